//! One task per channel. The task owns the channel state and processes its commands in arrival
//! order: subscriber requests, frames routed by the dispatcher, the outcome of the outbound
//! driver and connection teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strum_macros::Display;
use tokio::sync::mpsc;

use crate::channel::credit::CreditTracker;
use crate::channel::errors::{ChannelError, Violation};
use crate::channel::outbound::{OutboundDriver, OutboundHandle, OutboundOutcome};
use crate::channel::{DemandPolicy, Producer, Subscriber, Subscription};
use crate::frame::payload::Payload;
use crate::frame::{ErrorCode, Frame};
use crate::netflow::dispatcher::Dispatcher;
use crate::netflow::errors::ConnectionError;

pub enum ChannelCommand {
    Subscribe(Box<dyn Subscriber>),
    Request(u32),
    Cancel,
    Violation(Violation),
    Inbound(Frame),
    OutboundFinished(OutboundOutcome),
    ConnectionClosed(ConnectionError)
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Open,
    /// The local producer completed, inbound still flowing.
    HalfClosedLocal,
    /// The peer completed, outbound still flowing.
    HalfClosedRemote,
    Closed,
    Errored
}

impl TerminationState {

    pub fn complete_local(self) -> Self {
        match self {
            TerminationState::Open => TerminationState::HalfClosedLocal,
            TerminationState::HalfClosedRemote => TerminationState::Closed,
            other => other
        }
    }

    pub fn complete_remote(self) -> Self {
        match self {
            TerminationState::Open => TerminationState::HalfClosedRemote,
            TerminationState::HalfClosedLocal => TerminationState::Closed,
            other => other
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, TerminationState::Closed | TerminationState::Errored)
    }

    pub fn inbound_done(&self) -> bool {
        !matches!(self, TerminationState::Open | TerminationState::HalfClosedLocal)
    }

    pub fn outbound_done(&self) -> bool {
        !matches!(self, TerminationState::Open | TerminationState::HalfClosedRemote)
    }
}

/// Inbound side of a channel returned to the application. Accepts exactly one subscriber.
pub struct InboundFlux {
    stream_id: u32,
    tx: mpsc::UnboundedSender<ChannelCommand>,
    subscribed: AtomicBool,
    cancelled: Arc<AtomicBool>
}

impl InboundFlux {

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn subscribe<S: Subscriber + 'static>(&self, subscriber: S) -> Result<(), ChannelError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            log::warn!("Second subscriber on channel. stream_id: {}", self.stream_id);
            let _ = self.tx.send(ChannelCommand::Violation(Violation::SecondSubscriber));
            return Err(Violation::SecondSubscriber.into());
        }

        self.tx
            .send(ChannelCommand::Subscribe(Box::new(subscriber)))
            .map_err(|_| ChannelError::ConnectionClosed(ConnectionError::Closed))
    }

    /// Cancels the channel in both directions.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ChannelCommand::Cancel);
        }
    }
}

impl Drop for InboundFlux {
    /// A flux dropped without a subscriber can never receive anything, so the channel is
    /// cancelled. Once subscribed, the subscription keeps the channel alive.
    fn drop(&mut self) {
        if !self.subscribed.load(Ordering::SeqCst) {
            self.cancel();
        }
    }
}

struct ChannelSubscription {
    tx: mpsc::UnboundedSender<ChannelCommand>,
    cancelled: Arc<AtomicBool>
}

impl Subscription for ChannelSubscription {
    fn request(&self, n: u32) {
        if !self.cancelled.load(Ordering::SeqCst) {
            let _ = self.tx.send(ChannelCommand::Request(n));
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ChannelCommand::Cancel);
        }
    }
}

/// Registers a channel on the dispatcher and spawns its task. Nothing is written until the
/// subscriber requests demand.
pub(crate) async fn open_channel(
    stream_id: u32,
    initial_payload: Payload,
    producer: Producer,
    outbound_policy: DemandPolicy,
    writer: mpsc::Sender<Frame>,
    dispatcher: Dispatcher
) -> Result<InboundFlux, ConnectionError> {
    let (tx, rx) = mpsc::unbounded_channel();
    dispatcher.register(stream_id, tx.clone()).await?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let driver = OutboundDriver::new(stream_id, producer, writer.clone(), outbound_policy);
    let task = ChannelTask {
        stream_id,
        writer,
        dispatcher,
        tx: tx.downgrade(),
        cancelled: cancelled.clone(),
        initial_payload: Some(initial_payload),
        outbound_credit: driver.credit(),
        driver: Some(driver),
        outbound: None,
        inbound_credit: CreditTracker::new(),
        subscriber: None,
        pending: None,
        state: TerminationState::Open
    };
    tokio::spawn(task.run(rx));

    log::debug!("Channel opened. stream_id: {}", stream_id);
    Ok(InboundFlux { stream_id, tx, subscribed: AtomicBool::new(false), cancelled })
}

enum Terminal {
    Errored(ChannelError),
    Cancelled
}

struct ChannelTask {
    stream_id: u32,
    writer: mpsc::Sender<Frame>,
    dispatcher: Dispatcher,
    tx: mpsc::WeakUnboundedSender<ChannelCommand>,
    cancelled: Arc<AtomicBool>,
    /// Taken when REQUEST_CHANNEL is written.
    initial_payload: Option<Payload>,
    outbound_credit: Arc<CreditTracker>,
    driver: Option<OutboundDriver>,
    outbound: Option<OutboundHandle>,
    /// Demand granted to the peer.
    inbound_credit: CreditTracker,
    subscriber: Option<Box<dyn Subscriber>>,
    /// Terminal signal raised before a subscriber attached.
    pending: Option<Terminal>,
    state: TerminationState
}

impl ChannelTask {

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ChannelCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
            if self.state.is_terminated() {
                self.dispatcher.release(self.stream_id).await;
                if !self.awaits_subscriber() {
                    break;
                }
            }
        }

        self.cancel_outbound();
        self.dispatcher.release(self.stream_id).await;
        log::debug!("Channel closed. stream_id: {}, state: {}", self.stream_id, self.state);
    }

    fn awaits_subscriber(&self) -> bool {
        self.subscriber.is_none() && self.pending.is_some()
    }

    fn started(&self) -> bool {
        self.initial_payload.is_none()
    }

    async fn handle(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Subscribe(subscriber) => self.on_subscribe(subscriber),
            ChannelCommand::Request(n) => self.on_request(n).await,
            ChannelCommand::Cancel => self.on_cancel().await,
            ChannelCommand::Violation(violation) => {
                if !self.state.is_terminated() {
                    self.write_if_started(Frame::Cancel { stream_id: self.stream_id }).await;
                    self.terminate(ChannelError::ProtocolViolation(violation));
                }
            }
            ChannelCommand::Inbound(frame) => self.on_frame(frame).await,
            ChannelCommand::OutboundFinished(outcome) => self.on_outbound_finished(outcome).await,
            ChannelCommand::ConnectionClosed(reason) => {
                if !self.state.is_terminated() {
                    log::debug!("Connection closed under channel. stream_id: {}, reason: {}", self.stream_id, reason);
                    self.terminate(ChannelError::ConnectionClosed(reason));
                }
            }
        }
    }

    fn on_subscribe(&mut self, mut subscriber: Box<dyn Subscriber>) {
        let subscription = match self.tx.upgrade() {
            Some(tx) => Arc::new(ChannelSubscription { tx, cancelled: self.cancelled.clone() }),
            None => return
        };
        subscriber.on_subscribe(subscription);

        match self.pending.take() {
            Some(Terminal::Errored(error)) => subscriber.on_error(error),
            Some(Terminal::Cancelled) => subscriber.on_cancel(),
            None => {}
        }
        self.subscriber = Some(subscriber);
    }

    async fn on_request(&mut self, n: u32) {
        if n == 0 || self.state.inbound_done() || self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        match self.initial_payload.take() {
            Some(payload) => {
                let initial_request_n = self.inbound_credit.grant(n);
                self.write(Frame::RequestChannel {
                    stream_id: self.stream_id,
                    initial_request_n,
                    complete: false,
                    payload
                }).await;
                self.start_outbound();
            }
            None => {
                if self.inbound_credit.is_unbounded() {
                    return;
                }
                self.inbound_credit.grant(n);
                self.write(Frame::RequestN { stream_id: self.stream_id, n }).await;
            }
        }
    }

    fn start_outbound(&mut self) {
        let (driver, tx) = match (self.driver.take(), self.tx.upgrade()) {
            (Some(driver), Some(tx)) => (driver, tx),
            _ => return
        };

        let handle = driver.spawn(move |outcome| {
            let _ = tx.send(ChannelCommand::OutboundFinished(outcome));
        });
        self.outbound = Some(handle);
    }

    async fn on_cancel(&mut self) {
        if self.state.is_terminated() {
            return;
        }
        log::debug!("Channel cancelled. stream_id: {}", self.stream_id);
        self.write_if_started(Frame::Cancel { stream_id: self.stream_id }).await;
        self.cancel_outbound();
        let inbound_done = self.state.inbound_done();
        self.state = TerminationState::Closed;
        if !inbound_done {
            self.notify(Terminal::Cancelled);
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Payload { next, complete, payload, .. } => self.on_payload(next, complete, payload).await,
            Frame::RequestN { n, .. } => {
                if !self.state.outbound_done() {
                    self.outbound_credit.grant(n);
                }
            }
            Frame::Cancel { .. } => {
                log::debug!("Channel cancelled by peer. stream_id: {}", self.stream_id);
                self.cancel_outbound();
                if self.state.inbound_done() {
                    self.state = TerminationState::Closed;
                } else {
                    self.write(Frame::Cancel { stream_id: self.stream_id }).await;
                    self.state = TerminationState::Closed;
                    self.notify(Terminal::Cancelled);
                }
            }
            Frame::Error { code, message, .. } => {
                log::warn!("Error from peer. stream_id: {}, code: {}, message: {}", self.stream_id, code, message);
                self.terminate(ChannelError::Peer { code, message });
            }
            Frame::Unsupported { ignore: true, .. } => {
                log::debug!("Ignore frame. stream_id: {}", self.stream_id);
            }
            other => {
                let violation = Violation::UnexpectedFrame(format!("{:?}", other.frame_type()));
                self.reject(violation).await;
            }
        }
    }

    async fn on_payload(&mut self, next: bool, complete: bool, payload: Payload) {
        if self.state.inbound_done() {
            self.reject(Violation::PayloadAfterCompletion).await;
            return;
        }

        if next {
            if self.inbound_credit.consume().is_err() {
                self.reject(Violation::InsufficientCredit).await;
                return;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }

            let delivered = match self.subscriber.as_mut() {
                Some(subscriber) => subscriber.on_next(payload, complete),
                None => Ok(())
            };

            if let Err(e) = delivered {
                log::error!("Subscriber failed, cancel channel. stream_id: {}, {}", self.stream_id, e);
                self.write(Frame::Cancel { stream_id: self.stream_id }).await;
                self.terminate(e.into());
                return;
            }
        }

        if complete {
            self.state = self.state.complete_remote();
            if !next {
                if let Some(subscriber) = self.subscriber.as_mut() {
                    subscriber.on_complete();
                }
            }
            log::debug!("Inbound completed. stream_id: {}, state: {}", self.stream_id, self.state);
        } else if !next {
            log::warn!("Payload frame without NEXT or COMPLETE. stream_id: {}", self.stream_id);
        }
    }

    async fn on_outbound_finished(&mut self, outcome: OutboundOutcome) {
        self.outbound = None;
        match outcome {
            OutboundOutcome::Completed => {
                self.state = self.state.complete_local();
                log::debug!("Outbound completed. stream_id: {}, state: {}", self.stream_id, self.state);
            }
            OutboundOutcome::Cancelled => {}
            OutboundOutcome::Failed(e) => {
                if !self.state.is_terminated() {
                    self.write(Frame::Cancel { stream_id: self.stream_id }).await;
                    self.terminate(e);
                }
            }
        }
    }

    /// Ends the channel because the peer broke the contract.
    async fn reject(&mut self, violation: Violation) {
        log::warn!("Protocol violation on channel. stream_id: {}, violation: {}", self.stream_id, violation);
        self.write(Frame::error(self.stream_id, ErrorCode::Invalid, violation.to_string())).await;
        self.terminate(ChannelError::ProtocolViolation(violation));
    }

    /// Errors the channel in both directions. The subscriber hears about it unless its side
    /// already ended.
    fn terminate(&mut self, error: ChannelError) {
        let inbound_done = self.state.inbound_done();
        self.cancel_outbound();
        self.state = TerminationState::Errored;

        if !inbound_done {
            self.notify(Terminal::Errored(error));
        }
    }

    /// Delivers the terminal signal, or keeps it until a subscriber attaches.
    fn notify(&mut self, terminal: Terminal) {
        match (self.subscriber.as_mut(), terminal) {
            (Some(subscriber), Terminal::Errored(error)) => subscriber.on_error(error),
            (Some(subscriber), Terminal::Cancelled) => subscriber.on_cancel(),
            (None, terminal) => self.pending = Some(terminal)
        }
    }

    fn cancel_outbound(&mut self) {
        if let Some(handle) = self.outbound.take() {
            handle.cancel();
        }
        self.driver = None;
    }

    async fn write_if_started(&mut self, frame: Frame) {
        if self.started() {
            self.write(frame).await;
        }
    }

    async fn write(&mut self, frame: Frame) {
        if self.writer.send(frame).await.is_err() {
            log::debug!("Connection writer is gone. stream_id: {}", self.stream_id);
        }
    }
}
