//! Bridge between ASIO-style low latency audio drivers and a host
//! application.
//!
//! The host registers one per-block processing callback; the bridge owns
//! the driver lifecycle, negotiates double buffered hardware buffers and
//! moves each ready block from the driver's realtime thread to a single
//! host thread without ever blocking the realtime side.

mod bridge;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod format;
mod invoker;
pub mod loopback;
pub mod negotiate;
pub mod session;

pub use config::SessionConfig;
pub use dispatch::WorkItem;
pub use driver::{
    BlockSizeRange, ChannelRequest, DriverMessage, DriverPort, DriverTime, HwBufferPair,
    HwChannelInfo, OutputReady, RtHandler, SlotCell, list_drivers, register_driver,
};
pub use error::{BridgeError, DriverFault};
pub use format::SampleEncoding;
pub use invoker::UserCallback;
pub use negotiate::{
    ChannelDescriptor, MAX_INPUT_CHANNELS, MAX_OUTPUT_CHANNELS, NegotiatedCapability,
};
pub use session::{DriverSession, SessionEvent, SessionState};
