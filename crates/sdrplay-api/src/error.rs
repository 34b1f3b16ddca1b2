//! Error types for SDRplay API calls.

use thiserror::Error;

/// Result type for SDRplay API calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes matching the `sdrplay_api_ErrT` enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Fail = 1,
    InvalidParam = 2,
    OutOfRange = 3,
    GainUpdateError = 4,
    RfUpdateError = 5,
    FsUpdateError = 6,
    HwError = 7,
    AliasingError = 8,
    AlreadyInitialised = 9,
    NotInitialised = 10,
    NotEnabled = 11,
    HwVerError = 12,
    OutOfMemError = 13,
    ServiceNotResponding = 14,
    StartPending = 15,
    StopPending = 16,
    InvalidMode = 17,
    FailedVerification1 = 18,
    FailedVerification2 = 19,
    FailedVerification3 = 20,
    FailedVerification4 = 21,
    FailedVerification5 = 22,
    FailedVerification6 = 23,
    InvalidServiceVersion = 24,
}

impl ErrorCode {
    /// Get the vendor name for the error code, as `sdrplay_api_GetErrorString` would.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "sdrplay_api_Success",
            ErrorCode::Fail => "sdrplay_api_Fail",
            ErrorCode::InvalidParam => "sdrplay_api_InvalidParam",
            ErrorCode::OutOfRange => "sdrplay_api_OutOfRange",
            ErrorCode::GainUpdateError => "sdrplay_api_GainUpdateError",
            ErrorCode::RfUpdateError => "sdrplay_api_RfUpdateError",
            ErrorCode::FsUpdateError => "sdrplay_api_FsUpdateError",
            ErrorCode::HwError => "sdrplay_api_HwError",
            ErrorCode::AliasingError => "sdrplay_api_AliasingError",
            ErrorCode::AlreadyInitialised => "sdrplay_api_AlreadyInitialised",
            ErrorCode::NotInitialised => "sdrplay_api_NotInitialised",
            ErrorCode::NotEnabled => "sdrplay_api_NotEnabled",
            ErrorCode::HwVerError => "sdrplay_api_HwVerError",
            ErrorCode::OutOfMemError => "sdrplay_api_OutOfMemError",
            ErrorCode::ServiceNotResponding => "sdrplay_api_ServiceNotResponding",
            ErrorCode::StartPending => "sdrplay_api_StartPending",
            ErrorCode::StopPending => "sdrplay_api_StopPending",
            ErrorCode::InvalidMode => "sdrplay_api_InvalidMode",
            ErrorCode::FailedVerification1 => "sdrplay_api_FailedVerification1",
            ErrorCode::FailedVerification2 => "sdrplay_api_FailedVerification2",
            ErrorCode::FailedVerification3 => "sdrplay_api_FailedVerification3",
            ErrorCode::FailedVerification4 => "sdrplay_api_FailedVerification4",
            ErrorCode::FailedVerification5 => "sdrplay_api_FailedVerification5",
            ErrorCode::FailedVerification6 => "sdrplay_api_FailedVerification6",
            ErrorCode::InvalidServiceVersion => "sdrplay_api_InvalidServiceVersion",
        }
    }

    /// Map a raw `sdrplay_api_ErrT` value.
    pub fn from_raw(value: i32) -> Option<Self> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 25] = [
            Success,
            Fail,
            InvalidParam,
            OutOfRange,
            GainUpdateError,
            RfUpdateError,
            FsUpdateError,
            HwError,
            AliasingError,
            AlreadyInitialised,
            NotInitialised,
            NotEnabled,
            HwVerError,
            OutOfMemError,
            ServiceNotResponding,
            StartPending,
            StopPending,
            InvalidMode,
            FailedVerification1,
            FailedVerification2,
            FailedVerification3,
            FailedVerification4,
            FailedVerification5,
            FailedVerification6,
            InvalidServiceVersion,
        ];
        ALL.into_iter().find(|code| *code as i32 == value)
    }

    /// Turn a status code returned by `call` into a `Result`.
    pub fn check(self, call: &'static str) -> Result<()> {
        match self {
            ErrorCode::Success => Ok(()),
            code => Err(Error::Call { call, code }),
        }
    }
}

/// Errors that can occur during SDRplay API calls.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// An API function returned something other than `sdrplay_api_Success`.
    #[error("sdrplay_api_{call}() Error: {}", code.name())]
    Call {
        call: &'static str,
        code: ErrorCode,
    },

    /// The device handle does not belong to a selected device.
    #[error("unknown device handle {0}")]
    UnknownHandle(u64),

    /// The API version reported by the service does not match.
    #[error("sdrplay api version mismatch - expected {expected:.2} found {found:.2}")]
    VersionMismatch { expected: f32, found: f32 },
}

impl Error {
    /// Vendor error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Call { code, .. } => Some(*code),
            _ => None,
        }
    }
}
