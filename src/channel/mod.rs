//! The request-channel interaction: a local producer streaming to the peer and a subscriber
//! receiving from it, both gated by demand.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

use crate::channel::credit::MAX_DEMAND;
use crate::channel::errors::{ApplicationError, ChannelError};
use crate::frame::payload::Payload;

pub mod coordinator;
pub mod credit;
pub mod errors;
pub mod inbound;
pub mod outbound;
pub mod producer;

pub use coordinator::InboundFlux;
pub use inbound::{ChannelCompletion, Completion, InboundHandler};

/// Lazy source of outbound payloads. `true` marks the last payload.
pub type Producer = Pin<Box<dyn Stream<Item = (Payload, bool)> + Send>>;

/// Demand requested when a direction is subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DemandPolicy {
    /// Grant the maximum demand up front.
    #[default]
    Unbounded,
    /// Grant `n` up front and replenish as payloads are consumed.
    Batch(u32)
}

impl DemandPolicy {
    pub fn initial(&self) -> u32 {
        match self {
            DemandPolicy::Unbounded => MAX_DEMAND,
            DemandPolicy::Batch(n) => (*n).min(MAX_DEMAND)
        }
    }
}

/// Control handle held by a subscriber over its publisher.
pub trait Subscription: Send + Sync {
    fn request(&self, n: u32);
    fn cancel(&self);
}

/// Receives one direction of a channel.
///
/// Exactly one of `on_complete`, `on_error`, `on_cancel` or `on_next(.., true)` ends the stream.
/// An error returned from `on_next` cancels the channel and is reported back through `on_error`.
pub trait Subscriber: Send {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    fn on_next(&mut self, payload: Payload, is_complete: bool) -> Result<(), ApplicationError>;

    fn on_error(&mut self, error: ChannelError);

    fn on_complete(&mut self);

    /// The channel was cancelled locally before it terminated.
    fn on_cancel(&mut self) {}
}
