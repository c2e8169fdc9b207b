use std::sync::Arc;

use tokio::sync::watch;

use crate::channel::errors::{ApplicationError, ChannelError, Violation};
use crate::channel::{DemandPolicy, Subscriber, Subscription};
use crate::frame::payload::Payload;

/// How a channel ended, as seen by the caller waiting on it.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Completed,
    Errored(ChannelError),
    Cancelled
}

/// Fire-once terminal signal of one channel.
pub struct CompletionSignal {
    tx: watch::Sender<Option<Completion>>
}

impl CompletionSignal {

    pub fn new() -> (CompletionSignal, ChannelCompletion) {
        let (tx, rx) = watch::channel(None);
        (CompletionSignal { tx }, ChannelCompletion { rx })
    }

    /// Records `completion`. A second call leaves the first one in place and is reported as a
    /// violation.
    pub fn fire(&self, completion: Completion) -> Result<(), Violation> {
        let fired = self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(completion);
                true
            } else {
                false
            }
        });

        if fired { Ok(()) } else { Err(Violation::DuplicateCompletion) }
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Awaitable side of a [`CompletionSignal`].
#[derive(Clone)]
pub struct ChannelCompletion {
    rx: watch::Receiver<Option<Completion>>
}

impl ChannelCompletion {

    /// Resolves once with how the channel ended. A signal dropped without firing counts as
    /// cancelled.
    pub async fn wait(&mut self) -> Completion {
        match self.rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Completion::Cancelled),
            Err(_) => Completion::Cancelled
        }
    }

    pub fn peek(&self) -> Option<Completion> {
        self.rx.borrow().clone()
    }
}

/// Subscriber that hands every payload to a callback and fires a [`CompletionSignal`] when the
/// inbound direction ends.
pub struct InboundHandler<F> {
    callback: F,
    policy: DemandPolicy,
    subscription: Option<Arc<dyn Subscription>>,
    received: u32,
    signal: CompletionSignal
}

impl<F> InboundHandler<F>
    where
        F: FnMut(&Payload) -> Result<(), ApplicationError> + Send
{
    pub fn new(callback: F) -> (Self, ChannelCompletion) {
        Self::with_policy(callback, DemandPolicy::Unbounded)
    }

    pub fn with_policy(callback: F, policy: DemandPolicy) -> (Self, ChannelCompletion) {
        let (signal, completion) = CompletionSignal::new();
        let handler = InboundHandler {
            callback,
            policy,
            subscription: None,
            received: 0,
            signal
        };
        (handler, completion)
    }

    fn finish(&mut self, completion: Completion) {
        if let Err(violation) = self.signal.fire(completion) {
            log::warn!("Channel already completed. {}", violation);
        }
        self.subscription = None;
    }

    fn replenish(&mut self) {
        if let DemandPolicy::Batch(n) = self.policy {
            self.received += 1;
            if self.received >= (n / 2).max(1) {
                if let Some(subscription) = &self.subscription {
                    subscription.request(self.received);
                }
                self.received = 0;
            }
        }
    }
}

impl<F> Subscriber for InboundHandler<F>
    where
        F: FnMut(&Payload) -> Result<(), ApplicationError> + Send
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let initial = self.policy.initial();
        if initial > 0 {
            subscription.request(initial);
        }
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, payload: Payload, is_complete: bool) -> Result<(), ApplicationError> {
        log::debug!("From server on channel: {}", String::from_utf8_lossy(payload.data()));
        (self.callback)(&payload)?;

        if is_complete {
            self.finish(Completion::Completed);
        } else {
            self.replenish();
        }
        Ok(())
    }

    fn on_error(&mut self, error: ChannelError) {
        log::debug!("Error from server on channel: {}", error);
        self.finish(Completion::Errored(error));
    }

    fn on_complete(&mut self) {
        log::debug!("Completed on channel");
        self.finish(Completion::Completed);
    }

    fn on_cancel(&mut self) {
        log::debug!("Canceled on channel");
        self.finish(Completion::Cancelled);
    }
}
