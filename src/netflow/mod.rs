//! Connection plumbing: the duplex frame ports over a transport, the connection engine that
//! owns them, and the dispatcher that routes inbound frames to channels by stream id.

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::oneshot;

use crate::frame::Frame;

pub mod errors;
pub mod socket;
pub mod connection;
pub mod config;
pub(crate) mod dispatcher;
pub(crate) mod models;

pub use models::ConnectionState;

pub struct Term {
    tx_sigterm: oneshot::Sender<()>
}

impl Term {
    pub fn terminate(self) {
        let _ = self.tx_sigterm.send(());
    }
}

/// Decoded frames read from the transport. Ends when the transport closes.
pub struct In {
    pub rx: Receiver<Frame>
}

/// Frames queued for the single writer of the transport.
pub struct Out {
    pub tx: Sender<Frame>
}

pub trait SocketFlow {
    fn ports(self) -> (Term, In, Out);
}
