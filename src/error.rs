use std::fmt;

use thiserror::*;

use crate::channel::{ChannelCommand, ChannelState};

pub type Result<T> = std::result::Result<T, BcError>;

/// An error coming from the internal communication channels
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Channel command send error")]
    SendError(#[from] tokio::sync::mpsc::error::SendError<ChannelCommand>),
}

/// An error for BrowserChannel
#[derive(Error, Debug)]
pub enum BcError {
    #[error("Url error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bad config: {0}")]
    BadConfig(String),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Invalid operation in channel state {0:?}")]
    InvalidState(ChannelState),

    #[error("Socket is closed")]
    SocketClosed,

    #[error("Socket is already open")]
    SocketOpen,

    #[error("Channel error: {0}")]
    ChannelError(Box<CommandError>),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<CommandError> for BcError {
    fn from(value: CommandError) -> Self {
        Self::ChannelError(Box::new(value))
    }
}

/// Failure of a single HTTP exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Non-200 return code ({0})")]
    BadStatus(u16),

    #[error("No data in response")]
    NoData,

    #[error("Request timed out")]
    Timeout,

    #[error("Unknown session id")]
    UnknownSessionId,

    #[error("Bad chunked data")]
    BadData,

    #[error("Transport failure: {0}")]
    Transport(String),
}

impl RequestError {
    /// Whether the forward or backward channel may retry after this error.
    ///
    /// Only a session the server no longer knows is final, every other failure
    /// goes through the retry budget.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, RequestError::UnknownSessionId)
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            RequestError::BadStatus(_) => ErrorCode::RequestFailed,
            RequestError::NoData => ErrorCode::NoData,
            RequestError::Timeout | RequestError::Transport(_) => ErrorCode::Network,
            RequestError::UnknownSessionId => ErrorCode::UnknownSessionId,
            RequestError::BadData => ErrorCode::BadData,
        }
    }
}

/// Raised by a transport when the exchange breaks below HTTP
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

impl From<TransportError> for RequestError {
    fn from(value: TransportError) -> Self {
        RequestError::Transport(value.0)
    }
}

/// Channel level error codes reported to handlers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    Ok = 0,
    RequestFailed = 2,
    LoggedOut = 4,
    NoData = 5,
    UnknownSessionId = 6,
    Stop = 7,
    Network = 8,
    Blocked = 9,
    BadData = 10,
    BadResponse = 11,
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "Ok",
            ErrorCode::RequestFailed => "Request failed",
            ErrorCode::LoggedOut => "User is logging out",
            ErrorCode::NoData => "No data from server",
            ErrorCode::UnknownSessionId => "Unknown session ID",
            ErrorCode::Stop => "Stopped by server",
            ErrorCode::Network => "General network error",
            ErrorCode::Blocked => "Blocked by a network administrator",
            ErrorCode::BadData => "Got bad data from the server",
            ErrorCode::BadResponse => "Got a bad response from the server",
        }
    }

    /// Codes that are only reported after checking general reachability
    pub fn needs_reachability_check(&self) -> bool {
        matches!(self, ErrorCode::Network | ErrorCode::Blocked)
    }
}

impl From<ErrorCode> for u8 {
    fn from(value: ErrorCode) -> Self {
        value as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), *self as u8)
    }
}
