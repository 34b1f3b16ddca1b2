//! Error handling for the sdrplay3 library
//!
//! Errors returned by control operations are synchronous and, apart from
//! [`Error::ShutdownTimeout`] and [`Error::DeviceFault`], recoverable by
//! retrying with corrected parameters. Data loss on the streaming path is
//! never reported here: it is counted and exposed through
//! [`Health`](crate::port::Health).

use thiserror::Error;

/// A specialized Result type for sdrplay3 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sdrplay3 operations
#[derive(Debug, Error)]
pub enum Error {
    /// No device matches the selector
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device is claimed by another session or application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// The requested configuration is outside the model's capabilities,
    /// or cannot be applied in the current session state
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// A parameter is out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The service did not confirm the stream stopped in time; the device
    /// must be closed and reopened
    #[error("Timed out after {0:?} waiting for the stream to stop")]
    ShutdownTimeout(std::time::Duration),

    /// The device was removed or is in an indeterminate state
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// The output port of this channel was already handed out
    #[error("Output port for channel {0} already taken")]
    PortTaken(usize),

    /// SDRplay API call failed
    #[error(transparent)]
    Api(#[from] sdrplay_api::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

// Helper constructors for common error scenarios

impl Error {
    /// Create an unsupported configuration error with a custom message
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::UnsupportedConfig(msg.into())
    }

    /// Create an invalid parameter error with a custom message
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Create a device fault error with a custom message
    pub fn fault<S: Into<String>>(msg: S) -> Self {
        Error::DeviceFault(msg.into())
    }

    /// True for errors after which the device must be closed and reopened
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ShutdownTimeout(_) | Error::DeviceFault(_))
    }
}
