use std::error::Error;
use std::fmt;

use strum_macros::Display;

use crate::frame::ErrorCode;
use crate::netflow::errors::ConnectionError;

/// Breaches of the channel contract. Fatal to the offending channel only.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum Violation {
    /// A payload arrived while no demand was outstanding.
    InsufficientCredit,
    /// A second terminal signal for the same channel.
    DuplicateCompletion,
    SecondSubscriber,
    PayloadAfterCompletion,
    UnexpectedFrame(String)
}

#[derive(Debug, Display, Clone, PartialEq)]
pub enum ChannelError {
    ConnectionClosed(ConnectionError),
    ProtocolViolation(Violation),
    Peer {
        code: ErrorCode,
        message: String
    },
    Application(String)
}

impl Error for ChannelError {}

impl From<Violation> for ChannelError {
    fn from(v: Violation) -> Self {
        ChannelError::ProtocolViolation(v)
    }
}

impl From<CreditError> for ChannelError {
    fn from(_: CreditError) -> Self {
        ChannelError::ProtocolViolation(Violation::InsufficientCredit)
    }
}

impl From<ApplicationError> for ChannelError {
    fn from(e: ApplicationError) -> Self {
        ChannelError::Application(e.0)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CreditError {
    InsufficientCredit
}

impl Error for CreditError {}

/// Raised by application callbacks. Logged by the channel, which then cancels.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationError(pub String);

impl ApplicationError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        ApplicationError(message.into())
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApplicationError: {}", self.0)
    }
}

impl Error for ApplicationError {}
