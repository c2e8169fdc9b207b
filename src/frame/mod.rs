//! RSocket frames used by the request-channel interaction.
//!
//! Only the frames a requester needs to drive a channel are modelled: SETUP, KEEPALIVE,
//! REQUEST_CHANNEL, REQUEST_N, CANCEL, PAYLOAD and ERROR. Anything else is surfaced as
//! [`Frame::Unsupported`] so the connection can log and skip it.

pub mod codec;
pub mod errors;
pub mod payload;

use std::convert::TryFrom;

use bytes::Bytes;
use strum_macros::Display;

use crate::frame::payload::Payload;

pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;

/// Largest value of a 31-bit field (stream ids, request n, durations in ms).
pub const MAX_U31: u32 = 0x7FFF_FFFF;

/// Largest length a 24-bit metadata or frame length prefix can carry.
pub const MAX_U24: usize = 0xFF_FFFF;

pub mod flags {
    pub const IGNORE: u16 = 0x200;
    pub const METADATA: u16 = 0x100;
    pub const FOLLOWS: u16 = 0x80;
    pub const COMPLETE: u16 = 0x40;
    pub const NEXT: u16 = 0x20;
    pub const RESPOND: u16 = 0x80;
    pub const RESUME: u16 = 0x80;
    pub const LEASE: u16 = 0x40;
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    KeepAlive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Resume = 0x0D,
    ResumeOk = 0x0E,
    Ext = 0x3F,
}

impl TryFrom<u8> for FrameType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(FrameType::Setup),
            0x02 => Ok(FrameType::Lease),
            0x03 => Ok(FrameType::KeepAlive),
            0x04 => Ok(FrameType::RequestResponse),
            0x05 => Ok(FrameType::RequestFnf),
            0x06 => Ok(FrameType::RequestStream),
            0x07 => Ok(FrameType::RequestChannel),
            0x08 => Ok(FrameType::RequestN),
            0x09 => Ok(FrameType::Cancel),
            0x0A => Ok(FrameType::Payload),
            0x0B => Ok(FrameType::Error),
            0x0C => Ok(FrameType::MetadataPush),
            0x0D => Ok(FrameType::Resume),
            0x0E => Ok(FrameType::ResumeOk),
            0x3F => Ok(FrameType::Ext),
            _ => Err(())
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidSetup,
    UnsupportedSetup,
    RejectedSetup,
    RejectedResume,
    ConnectionError,
    ConnectionClose,
    ApplicationError,
    Rejected,
    Canceled,
    Invalid,
    Other(u32)
}

impl ErrorCode {
    pub fn is_setup_error(&self) -> bool {
        matches!(self, ErrorCode::InvalidSetup | ErrorCode::UnsupportedSetup | ErrorCode::RejectedSetup)
    }
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> Self {
        match value {
            0x001 => ErrorCode::InvalidSetup,
            0x002 => ErrorCode::UnsupportedSetup,
            0x003 => ErrorCode::RejectedSetup,
            0x004 => ErrorCode::RejectedResume,
            0x101 => ErrorCode::ConnectionError,
            0x102 => ErrorCode::ConnectionClose,
            0x201 => ErrorCode::ApplicationError,
            0x202 => ErrorCode::Rejected,
            0x203 => ErrorCode::Canceled,
            0x204 => ErrorCode::Invalid,
            other => ErrorCode::Other(other)
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidSetup => 0x001,
            ErrorCode::UnsupportedSetup => 0x002,
            ErrorCode::RejectedSetup => 0x003,
            ErrorCode::RejectedResume => 0x004,
            ErrorCode::ConnectionError => 0x101,
            ErrorCode::ConnectionClose => 0x102,
            ErrorCode::ApplicationError => 0x201,
            ErrorCode::Rejected => 0x202,
            ErrorCode::Canceled => 0x203,
            ErrorCode::Invalid => 0x204,
            ErrorCode::Other(value) => value
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Setup {
    /// Keep-alive interval in milliseconds.
    pub keepalive_interval: u32,
    /// Max lifetime in milliseconds.
    pub max_lifetime: u32,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Setup(Setup),
    KeepAlive {
        respond: bool,
        last_received_position: u64,
        data: Bytes
    },
    RequestChannel {
        stream_id: u32,
        initial_request_n: u32,
        complete: bool,
        payload: Payload
    },
    RequestN {
        stream_id: u32,
        n: u32
    },
    Cancel {
        stream_id: u32
    },
    Payload {
        stream_id: u32,
        next: bool,
        complete: bool,
        payload: Payload
    },
    Error {
        stream_id: u32,
        code: ErrorCode,
        message: String
    },
    Unsupported {
        stream_id: u32,
        frame_type: u8,
        ignore: bool
    }
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Setup(_) | Frame::KeepAlive { .. } => 0,
            Frame::RequestChannel { stream_id, .. } |
            Frame::RequestN { stream_id, .. } |
            Frame::Cancel { stream_id } |
            Frame::Payload { stream_id, .. } |
            Frame::Error { stream_id, .. } |
            Frame::Unsupported { stream_id, .. } => *stream_id
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        match self {
            Frame::Setup(_) => Some(FrameType::Setup),
            Frame::KeepAlive { .. } => Some(FrameType::KeepAlive),
            Frame::RequestChannel { .. } => Some(FrameType::RequestChannel),
            Frame::RequestN { .. } => Some(FrameType::RequestN),
            Frame::Cancel { .. } => Some(FrameType::Cancel),
            Frame::Payload { .. } => Some(FrameType::Payload),
            Frame::Error { .. } => Some(FrameType::Error),
            Frame::Unsupported { frame_type, .. } => FrameType::try_from(*frame_type).ok()
        }
    }

    pub fn next(stream_id: u32, payload: Payload, complete: bool) -> Frame {
        Frame::Payload { stream_id, next: true, complete, payload }
    }

    pub fn complete(stream_id: u32) -> Frame {
        Frame::Payload { stream_id, next: false, complete: true, payload: Payload::empty() }
    }

    pub fn error<S: Into<String>>(stream_id: u32, code: ErrorCode, message: S) -> Frame {
        Frame::Error { stream_id, code, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_parsing() {
        let mut successes = 0;
        for i in 0..=0x3F_u8 {
            if let Ok(type_) = FrameType::try_from(i) {
                successes += 1;
                assert_eq!(type_ as u8, i);
            }
        }
        assert_eq!(successes, 15);
    }

    #[test]
    fn error_codes_map_both_ways() {
        for raw in [0x001_u32, 0x002, 0x003, 0x004, 0x101, 0x102, 0x201, 0x202, 0x203, 0x204, 0x0999] {
            assert_eq!(u32::from(ErrorCode::from(raw)), raw);
        }
        assert!(ErrorCode::from(0x003).is_setup_error());
        assert!(!ErrorCode::ConnectionClose.is_setup_error());
    }
}
