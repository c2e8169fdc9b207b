use strum_macros::Display;
use std::error::Error;

#[derive(Debug, Display)]
pub enum SerDeError {
   Io(std::io::Error)
}

impl From<serde_json::error::Error> for SerDeError {
   fn from(e: serde_json::error::Error) -> Self {
      SerDeError::Io(std::io::Error::from(e))
   }
}

impl From<std::io::Error> for SerDeError {
   fn from(e: std::io::Error) -> Self {
      SerDeError::Io(e)
   }
}

impl Error for SerDeError {}

#[derive(Display, Debug)]
pub enum FramingError {
   EncodeErr(String),
   DecodeErr(String),
   IoError(String)
}

impl Error for FramingError {}

impl From<std::io::Error> for FramingError {
   fn from(err: std::io::Error) -> FramingError {
       FramingError::IoError(err.to_string())
   }
}

impl From<std::string::FromUtf8Error> for FramingError {
   fn from(err: std::string::FromUtf8Error) -> FramingError {
      FramingError::DecodeErr(err.to_string())
   }
}
