use std::string::FromUtf8Error;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::frame::errors::SerDeError;

/// One message unit exchanged over a channel. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Bytes,
    metadata: Bytes,
}

impl Payload {

    pub fn new<D: Into<Bytes>, M: Into<Bytes>>(data: D, metadata: M) -> Self {
        Payload { data: data.into(), metadata: metadata.into() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_data<D: Into<Bytes>>(data: D) -> Self {
        Payload { data: data.into(), metadata: Bytes::new() }
    }

    /// Encodes data and metadata as two independent JSON documents.
    pub fn json<D: Serialize, M: Serialize>(data: &D, metadata: &M) -> Result<Self, SerDeError> {
        let data = serde_json::to_vec(data)?;
        let metadata = serde_json::to_vec(metadata)?;
        Ok(Payload::new(data, metadata))
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn has_metadata(&self) -> bool {
        !self.metadata.is_empty()
    }

    pub fn data_utf8(&self) -> Result<String, FromUtf8Error> {
        String::deserialize_payload(self)
    }

    pub fn data_json<T: DeserializeOwned>(&self) -> Result<T, SerDeError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

pub trait DeserializePayload {
    type Output: Sized;
    fn deserialize_payload(payload: &Payload) -> Self::Output;
}

impl DeserializePayload for Vec<u8> {
    type Output = Self;
    fn deserialize_payload(payload: &Payload) -> Self::Output {
        payload.data.to_vec()
    }
}

impl DeserializePayload for String {
    type Output = Result<String, FromUtf8Error>;
    fn deserialize_payload(payload: &Payload) -> Self::Output {
        String::from_utf8(payload.data.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(data: &str) -> Self {
        Payload::from_data(data.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Payload::from_data(data.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::from_data(data)
    }
}
