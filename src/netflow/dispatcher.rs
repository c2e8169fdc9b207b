use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::channel::coordinator::ChannelCommand;
use crate::frame::Frame;
use crate::netflow::errors::ConnectionError;

/// Open channels of one connection, keyed by stream id.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Mutex<Registry>>
}

#[derive(Default)]
struct Registry {
    channels: BTreeMap<u32, mpsc::UnboundedSender<ChannelCommand>>,
    closed: Option<ConnectionError>
}

impl Dispatcher {

    pub fn new() -> Self {
        Dispatcher { inner: Arc::new(Mutex::new(Registry::default())) }
    }

    pub async fn register(&self, stream_id: u32, tx: mpsc::UnboundedSender<ChannelCommand>) -> Result<(), ConnectionError> {
        let mut reg = self.inner.lock().await;
        if let Some(reason) = &reg.closed {
            return Err(reason.clone());
        }
        reg.channels.insert(stream_id, tx);
        Ok(())
    }

    pub async fn release(&self, stream_id: u32) {
        let mut reg = self.inner.lock().await;
        if reg.channels.remove(&stream_id).is_some() {
            log::trace!("Released stream. stream_id: {}", stream_id);
        }
    }

    pub async fn open_channels(&self) -> Vec<u32> {
        let reg = self.inner.lock().await;
        reg.channels.keys().copied().collect()
    }

    pub async fn dispatch(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let reg = self.inner.lock().await;
        match reg.channels.get(&stream_id) {
            Some(tx) => {
                let tx = tx.clone();
                std::mem::drop(reg); //unlock;
                if tx.send(ChannelCommand::Inbound(frame)).is_err() {
                    log::debug!("Channel is gone, drop frame. stream_id: {}", stream_id);
                }
            }
            None => {
                log::warn!("Cannot dispatch the frame to a channel. \
                No mapping channel found in registry. stream_id: {}, frame: {:?}", stream_id, frame.frame_type());
            }
        }
    }

    /// Terminates every open channel with `reason` and refuses new ones.
    /// Returns the number of channels that were open.
    pub async fn close_all(&self, reason: ConnectionError) -> usize {
        let channels = {
            let mut reg = self.inner.lock().await;
            if reg.closed.is_some() {
                return 0;
            }
            reg.closed = Some(reason.clone());
            std::mem::take(&mut reg.channels)
        };

        let count = channels.len();
        for (stream_id, tx) in channels {
            if tx.send(ChannelCommand::ConnectionClosed(reason.clone())).is_err() {
                log::debug!("Channel already finished. stream_id: {}", stream_id);
            }
        }
        count
    }
}
