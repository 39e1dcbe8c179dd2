use crate::error::{BridgeError, DriverFault};
use crate::format::SampleEncoding;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::warn;

/// Driver ABI limit on enumerated driver names, terminator included.
pub const MAX_DRIVER_NAME: usize = 32;

/// One slot of a channel's hardware double buffer.
///
/// The slot is shared between the driver's realtime thread and the host
/// thread. Slot alternation is the only synchronization: while the driver
/// fills slot 0 the host owns slot 1 and vice versa. If the host holds a
/// slot past one block period the driver writes into it anyway; that is the
/// overrun condition the dispatch queue counts.
#[derive(Debug)]
pub struct SlotCell {
    bytes: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for SlotCell {}
unsafe impl Sync for SlotCell {}

impl SlotCell {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: UnsafeCell::new(vec![0_u8; len].into_boxed_slice()),
        })
    }

    pub fn len(&self) -> usize {
        unsafe { (&**self.bytes.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callers must own the slot per the double buffer protocol.
    pub fn bytes(&self) -> &mut [u8] {
        unsafe { &mut **self.bytes.get() }
    }
}

/// The two slots backing one hardware channel.
#[derive(Debug, Clone)]
pub struct HwBufferPair {
    pub slots: [Arc<SlotCell>; 2],
}

impl HwBufferPair {
    pub fn new(slot_bytes: usize) -> Self {
        Self {
            slots: [SlotCell::new(slot_bytes), SlotCell::new(slot_bytes)],
        }
    }
}

/// One channel the session wants buffers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRequest {
    pub input: bool,
    pub index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockSizeRange {
    pub min: u32,
    pub max: u32,
    pub preferred: u32,
    /// Spacing between valid sizes; negative means powers of two.
    pub granularity: i32,
}

#[derive(Debug, Clone)]
pub struct HwChannelInfo {
    pub name: String,
    pub encoding: SampleEncoding,
    pub clock_group: i32,
}

/// Timing metadata the driver hands to the block callback. `None` means the
/// driver did not flag the field as valid for this block.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverTime {
    pub system_time_nanos: Option<u64>,
    pub sample_position: Option<u64>,
    pub timecode_samples: Option<u64>,
}

/// Selector for the driver's out-of-band message callback. Raw values
/// follow the driver ABI's selector numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMessage {
    SelectorSupported,
    EngineVersion,
    ResetRequest,
    SupportsTimeInfo,
    Other(i32),
}

impl DriverMessage {
    pub fn from_raw_selector(raw: i32) -> Self {
        match raw {
            1 => DriverMessage::SelectorSupported,
            2 => DriverMessage::EngineVersion,
            3 => DriverMessage::ResetRequest,
            7 => DriverMessage::SupportsTimeInfo,
            other => DriverMessage::Other(other),
        }
    }

    pub fn raw_selector(self) -> i32 {
        match self {
            DriverMessage::SelectorSupported => 1,
            DriverMessage::EngineVersion => 2,
            DriverMessage::ResetRequest => 3,
            DriverMessage::SupportsTimeInfo => 7,
            DriverMessage::Other(raw) => raw,
        }
    }
}

/// The four hooks a driver invokes on its realtime thread.
///
/// Implementations must never block and must not run user code; they hand
/// work off to the host context and return within the block period.
pub trait RtHandler: Send + Sync {
    /// A double buffer slot just became ready, no timing attached.
    fn block_ready(&self, slot: usize);

    /// A slot became ready, with whatever timing the driver could supply.
    fn block_ready_with_time(&self, time: DriverTime, slot: usize);

    /// The driver's sample rate changed, usually under external sync.
    fn sample_rate_changed(&self, rate: f64);

    /// Out-of-band driver message; the return value answers the selector.
    fn message(&self, selector: DriverMessage, value: i32) -> i32;
}

/// Handle for the output-ready latency optimization. Drivers that support
/// it return one from [`DriverPort::output_ready`]; the realtime bridge
/// signals it right after submitting each block.
pub trait OutputReady: Send + Sync {
    fn signal_output_ready(&self);
}

/// Seam between the session core and a concrete driver backend.
///
/// Control methods are called from the host side only. `start` hands the
/// handler to the driver; after `stop` returns the driver must guarantee no
/// further handler invocation occurs.
pub trait DriverPort: Send {
    fn name(&self) -> &str;

    /// Driver level initialize. Returns a descriptive banner on success;
    /// the fault carries the driver's own diagnostic string.
    fn init(&mut self) -> Result<String, DriverFault>;

    /// Hardware channel counts as (inputs, outputs).
    fn channel_counts(&self) -> Result<(u32, u32), DriverFault>;

    fn block_size_range(&self) -> Result<BlockSizeRange, DriverFault>;

    fn sample_rate(&self) -> Result<f64, DriverFault>;

    fn set_sample_rate(&mut self, rate: f64) -> Result<(), DriverFault>;

    /// `Some` when the driver supports the output-ready optimization.
    fn output_ready(&self) -> Option<Arc<dyn OutputReady>>;

    /// Allocate double buffers for the requested channels. The returned
    /// pairs share indexing with `requests`: inputs first, then outputs.
    fn create_buffers(
        &mut self,
        requests: &[ChannelRequest],
        block_size: u32,
    ) -> Result<Vec<HwBufferPair>, DriverFault>;

    fn channel_info(&self, index: u32, input: bool) -> Result<HwChannelInfo, DriverFault>;

    /// Input and output latency in frames. Only meaningful after
    /// `create_buffers`.
    fn latencies(&self) -> Result<(u32, u32), DriverFault>;

    fn start(&mut self, handler: Arc<dyn RtHandler>) -> Result<(), DriverFault>;

    /// Stop the stream. No handler invocation may happen after this returns.
    fn stop(&mut self) -> Result<(), DriverFault>;

    fn dispose_buffers(&mut self) -> Result<(), DriverFault>;

    /// Open the driver's own control panel, if it has one.
    fn control_panel(&mut self) {}

    fn deinit(&mut self);
}

type DriverFactory = Arc<dyn Fn() -> Box<dyn DriverPort> + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, DriverFactory>> {
    static REG: OnceLock<Mutex<HashMap<String, DriverFactory>>> = OnceLock::new();
    REG.get_or_init(|| {
        let mut map: HashMap<String, DriverFactory> = HashMap::new();
        map.insert(
            "loopback".to_string(),
            Arc::new(|| Box::new(crate::loopback::LoopbackDriver::default()) as Box<dyn DriverPort>),
        );
        Mutex::new(map)
    })
}

/// Register a driver port factory under `name`. Names longer than the
/// driver ABI allows are truncated to fit the enumeration surface.
pub fn register_driver<F>(name: &str, factory: F)
where
    F: Fn() -> Box<dyn DriverPort> + Send + Sync + 'static,
{
    let mut key = name.to_string();
    if key.len() >= MAX_DRIVER_NAME {
        warn!(
            "driver name '{}' exceeds {} bytes, truncating",
            key,
            MAX_DRIVER_NAME - 1
        );
        key.truncate(MAX_DRIVER_NAME - 1);
    }
    let mut map = registry().lock().expect("driver registry poisoned");
    map.insert(key, Arc::new(factory));
}

pub fn load_driver(name: &str) -> Result<Box<dyn DriverPort>, BridgeError> {
    let factory = {
        let map = registry().lock().expect("driver registry poisoned");
        map.get(name).cloned()
    };
    match factory {
        Some(f) => Ok(f()),
        None => Err(BridgeError::DriverLoad(name.to_string())),
    }
}

/// Enumerate registered driver names.
pub fn list_drivers() -> Vec<String> {
    let map = registry().lock().expect("driver registry poisoned");
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}
