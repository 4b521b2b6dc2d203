//! Error types for the event queue.

use thiserror::Error;

/// Result type alias for event queue operations.
pub type EqResult<T> = Result<T, EqError>;

/// Error variants returned by the event queue and its endpoint surface.
#[derive(Debug, Error)]
pub enum EqError {
    /// No event is available yet. Not a failure.
    #[error("no event available")]
    WouldBlock,

    /// A structured error is recorded and must be drained with `read_error`.
    #[error("error entry available")]
    ErrorAvailable,

    /// The caller's buffer cannot hold the pending entry.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    TooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes the caller offered.
        available: usize,
    },

    /// The queue still has external references attached.
    #[error("event queue busy: {refs} references outstanding")]
    Busy {
        /// Number of outstanding references.
        refs: usize,
    },

    /// The request is not valid for the current queue or endpoint state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal table ran out of slots.
    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    /// The requested wait object or feature is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The queue has been closed.
    #[error("event queue closed")]
    Closed,

    /// A handle refers to an endpoint or listener that no longer exists.
    #[error("stale handle")]
    StaleHandle,

    /// An inbound request does not match the listener's hints.
    #[error("no matching data: {0}")]
    NoMatchingData(String),

    /// A connection manager command failed.
    #[error(transparent)]
    Cm(#[from] std::io::Error),
}

impl EqError {
    /// Returns true for the non-failure "try again later" outcome.
    pub fn is_would_block(&self) -> bool {
        matches!(self, EqError::WouldBlock)
    }

    /// Provider errno for errors originating from a collaborator command.
    pub fn prov_errno(&self) -> i32 {
        match self {
            EqError::Cm(e) => e.raw_os_error().unwrap_or(ErrorCode::Provider(0).errno()),
            EqError::NoMemory(_) => ErrorCode::NoMemory.errno(),
            EqError::NoMatchingData(_) => ErrorCode::NoData.errno(),
            EqError::InvalidArgument(_) => ErrorCode::InvalidArgument.errno(),
            _ => 0,
        }
    }

    /// Code recorded in an error entry when this error is fatal to an endpoint.
    pub fn code(&self) -> ErrorCode {
        match self {
            EqError::Cm(e) => ErrorCode::from_io(e),
            EqError::NoMemory(_) => ErrorCode::NoMemory,
            EqError::NoMatchingData(_) => ErrorCode::NoData,
            EqError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            other => ErrorCode::Provider(other.prov_errno()),
        }
    }
}

/// Errno-style code stored in an error entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Address, route or connect attempt timed out or failed.
    TimedOut,
    /// The peer or the fabric refused the connection.
    ConnectionRefused,
    /// The device backing the connection was removed.
    NoDevice,
    /// The local address changed underneath the connection.
    AddressNotAvailable,
    /// The peer spoke an unexpected negotiation protocol.
    Protocol,
    /// No provider info matched a connect request.
    NoData,
    /// An allocation failed.
    NoMemory,
    /// A parameter was invalid.
    InvalidArgument,
    /// Raw provider errno.
    Provider(i32),
}

impl ErrorCode {
    /// Linux errno value for this code.
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::TimedOut => 110,
            ErrorCode::ConnectionRefused => 111,
            ErrorCode::NoDevice => 19,
            ErrorCode::AddressNotAvailable => 99,
            ErrorCode::Protocol => 71,
            ErrorCode::NoData => 61,
            ErrorCode::NoMemory => 12,
            ErrorCode::InvalidArgument => 22,
            ErrorCode::Provider(errno) => errno,
        }
    }

    /// Maps a collaborator failure onto the code recorded for the endpoint.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(110) => ErrorCode::TimedOut,
            Some(111) => ErrorCode::ConnectionRefused,
            Some(19) => ErrorCode::NoDevice,
            Some(99) => ErrorCode::AddressNotAvailable,
            Some(12) => ErrorCode::NoMemory,
            Some(errno) => ErrorCode::Provider(errno),
            None => ErrorCode::Provider(0),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", strerror(self.errno()))
    }
}

/// Renders a provider errno as human-readable text.
pub fn strerror(prov_errno: i32) -> String {
    std::io::Error::from_raw_os_error(prov_errno.abs()).to_string()
}
