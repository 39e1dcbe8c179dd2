use thiserror::Error;

/// Failure reported by a driver port, carrying the driver's own diagnostic.
///
/// Ports do not know which negotiation stage they were called from; the
/// caller wraps a fault into the stage-specific [`BridgeError`] variant.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DriverFault(pub String);

impl DriverFault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("driver '{0}' is not available")]
    DriverLoad(String),

    #[error("driver initialization failed: {0}")]
    DriverInit(String),

    #[error("channel query failed: {0}")]
    ChannelQuery(String),

    #[error("buffer size query failed: {0}")]
    BufferSizeQuery(String),

    #[error("sample rate negotiation failed: {0}")]
    SampleRate(String),

    #[error("buffer creation failed: {0}")]
    BufferCreation(String),

    #[error("invalid session state {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("output buffer for channel {channel}: got {got} bytes, expected {expected}")]
    FormatMismatch {
        channel: u32,
        expected: usize,
        got: usize,
    },

    #[error("user callback failed: {0}")]
    UserCallbackFailure(String),
}

impl BridgeError {
    /// Stable status code for hosts that consume integers instead of error
    /// values. Zero is reserved for success.
    pub fn status_code(&self) -> i32 {
        match self {
            BridgeError::DriverLoad(_) => -1,
            BridgeError::DriverInit(_) => -2,
            BridgeError::ChannelQuery(_) => -3,
            BridgeError::BufferSizeQuery(_) => -4,
            BridgeError::SampleRate(_) => -5,
            BridgeError::BufferCreation(_) => -6,
            BridgeError::InvalidState { .. } => -7,
            BridgeError::FormatMismatch { .. } => -8,
            BridgeError::UserCallbackFailure(_) => -9,
        }
    }
}
