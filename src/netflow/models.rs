use std::sync::atomic::{AtomicU32, Ordering};

use strum_macros::Display;

use crate::frame::MAX_U31;
use crate::netflow::errors::ConnectionError;

#[derive(Debug, Display, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed(ConnectionError)
}

/// Hands out odd stream ids in increasing order. Ids are never handed out twice.
pub struct StreamIdSupplier(AtomicU32);

impl StreamIdSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Option<u32> {
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(2))
            .ok()
            .filter(|id| *id <= MAX_U31)
    }
}

impl Default for StreamIdSupplier {
    fn default() -> Self {
        StreamIdSupplier(AtomicU32::new(1))
    }
}
