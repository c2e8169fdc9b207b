use std::error::Error;

use strum_macros::Display;

use crate::frame::errors::FramingError;
use crate::frame::ErrorCode;
use crate::net::NetOpError;

#[derive(Clone, Debug, Display, PartialEq)]
pub enum TransportError {
    InvalidUrlScheme(String),
    UnableToResolveHostName(String),
    IoError(String),
    TlsError(String),
    WebSocket(String),
    Framing(String),
    Closed
}

impl Error for TransportError {}

impl From<NetOpError> for TransportError {
    fn from(f: NetOpError) -> Self {
        match f {
            NetOpError::InvalidUrlScheme(s) => TransportError::InvalidUrlScheme(s),
            NetOpError::UnableToResolveHostName(s) => TransportError::UnableToResolveHostName(s),
            NetOpError::UnableToReadCert(s) => TransportError::TlsError(s),
            NetOpError::InvalidUrl(s) | NetOpError::MissingPort(s) => TransportError::IoError(s)
        }
    }
}

impl From<FramingError> for TransportError {
    fn from(e: FramingError) -> Self {
        TransportError::Framing(e.to_string())
    }
}

#[derive(Clone, Debug, Display, PartialEq)]
pub enum ConnectionError {
    /// The transport went away.
    Disconnected,
    /// Closed from this side.
    Closed,
    HeartbeatTimeout,
    MaxLifetimeExceeded,
    NotActive,
    StreamIdsExhausted,
    RSocketError {
        code: ErrorCode,
        message: String
    },
    /// A connection setting RSocket cannot carry, such as a zero keep-alive interval.
    InvalidConfig(String),
    Unexpected(String),
    Transport(TransportError),
    NetOpError(NetOpError)
}

impl Error for ConnectionError {}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self { ConnectionError::Transport(e) }
}

impl From<NetOpError> for ConnectionError {
    fn from(e: NetOpError) -> Self {
        ConnectionError::NetOpError(e)
    }
}
