use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::channel::credit::CreditTracker;
use crate::channel::errors::ChannelError;
use crate::channel::{DemandPolicy, Producer, Subscription};
use crate::frame::Frame;
use crate::netflow::errors::ConnectionError;

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundOutcome {
    /// The producer finished and the final frame was written.
    Completed,
    Cancelled,
    Failed(ChannelError)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulled {
    Emitted,
    Completed,
    /// Nothing left to pull, the producer was cancelled or already completed.
    Finished
}

/// Drives a local producer onto one channel, one payload per unit of credit.
pub struct OutboundDriver {
    stream_id: u32,
    producer: Option<Producer>,
    credit: Arc<CreditTracker>,
    writer: mpsc::Sender<Frame>,
    policy: DemandPolicy,
    subscription: Option<Arc<dyn Subscription>>
}

impl OutboundDriver {

    pub fn new(stream_id: u32, producer: Producer, writer: mpsc::Sender<Frame>, policy: DemandPolicy) -> Self {
        OutboundDriver {
            stream_id,
            producer: Some(producer),
            credit: Arc::new(CreditTracker::new()),
            writer,
            policy,
            subscription: None
        }
    }

    pub fn credit(&self) -> Arc<CreditTracker> {
        self.credit.clone()
    }

    pub fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let initial = self.policy.initial();
        if initial > 0 {
            subscription.request(initial);
        }
        self.subscription = Some(subscription);
    }

    /// Advances the producer by one step and writes the result. A payload waits for credit, the
    /// end of the producer does not.
    pub async fn pull(&mut self) -> Result<Pulled, ChannelError> {
        let producer = match self.producer.as_mut() {
            Some(producer) => producer,
            None => return Ok(Pulled::Finished)
        };

        let frame = match producer.next().await {
            Some((payload, is_complete)) => {
                self.credit.acquire().await;
                self.credit.consume()?;
                if is_complete {
                    self.producer = None;
                }
                Frame::next(self.stream_id, payload, is_complete)
            }
            None => {
                self.producer = None;
                Frame::complete(self.stream_id)
            }
        };

        self.writer
            .send(frame).await
            .map_err(|_| ChannelError::ConnectionClosed(ConnectionError::Disconnected))?;

        if self.producer.is_none() {
            log::debug!("Outbound completed. stream_id: {}", self.stream_id);
            Ok(Pulled::Completed)
        } else {
            Ok(Pulled::Emitted)
        }
    }

    pub fn cancel(&mut self) {
        if self.producer.take().is_some() {
            log::debug!("Outbound cancelled. stream_id: {}", self.stream_id);
        }
        self.subscription = None;
    }

    /// Runs the driver on its own task until the producer completes, fails or the returned
    /// handle is cancelled or dropped. `on_finish` receives the outcome.
    pub fn spawn<F>(mut self, on_finish: F) -> OutboundHandle
        where
            F: FnOnce(OutboundOutcome) + Send + 'static
    {
        let (tx_sigterm, mut rx_sigterm) = oneshot::channel::<()>();
        let subscription = Arc::new(OutboundSubscription {
            credit: self.credit.clone(),
            tx_sigterm: Mutex::new(Some(tx_sigterm))
        });
        self.on_subscribe(subscription.clone());

        tokio::spawn(async move {
            let outcome = loop {
                let step = tokio::select! {
                    biased;
                    _ = &mut rx_sigterm => None,
                    pulled = self.pull() => Some(pulled)
                };

                match step {
                    None => {
                        self.cancel();
                        break OutboundOutcome::Cancelled;
                    }
                    Some(Ok(Pulled::Emitted)) => continue,
                    Some(Ok(Pulled::Completed)) | Some(Ok(Pulled::Finished)) => {
                        break OutboundOutcome::Completed;
                    }
                    Some(Err(e)) => {
                        log::warn!("Outbound failed. stream_id: {}, error: {}", self.stream_id, e);
                        self.cancel();
                        break OutboundOutcome::Failed(e);
                    }
                }
            };
            on_finish(outcome);
        });

        OutboundHandle { subscription }
    }
}

/// Owner side of a spawned driver. Dropping it cancels the driver.
pub struct OutboundHandle {
    subscription: Arc<OutboundSubscription>
}

impl OutboundHandle {
    pub fn request(&self, n: u32) {
        self.subscription.request(n);
    }

    pub fn cancel(&self) {
        self.subscription.cancel();
    }
}

impl Drop for OutboundHandle {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}

/// Subscription over a spawned [`OutboundDriver`]. Requests add credit, cancel stops the driver.
pub struct OutboundSubscription {
    credit: Arc<CreditTracker>,
    tx_sigterm: Mutex<Option<oneshot::Sender<()>>>
}

impl Subscription for OutboundSubscription {
    fn request(&self, n: u32) {
        self.credit.grant(n);
    }

    fn cancel(&self) {
        let tx = match self.tx_sigterm.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}
