use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::mpsc;

use rsocket_lunar::channel::credit::MAX_DEMAND;
use rsocket_lunar::channel::errors::Violation;
use rsocket_lunar::channel::{producer, Producer};
use rsocket_lunar::frame::{ErrorCode, Frame};
use rsocket_lunar::netflow::connection::{self, Connection};
use rsocket_lunar::netflow::socket::{self, MemoryPeer};
use rsocket_lunar::{
    ApplicationError, ChannelError, Completion, ConnectionConfig, ConnectionError, ConnectionState,
    DemandPolicy, InboundHandler, Payload, Subscriber, Subscription
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Next(String, bool),
    Error(ChannelError),
    Complete,
    Cancel
}

/// Subscriber that reports every signal on a channel.
struct Recorder {
    request: u32,
    cancel_on_subscribe: bool,
    subscription: Option<Arc<dyn Subscription>>,
    tx: mpsc::UnboundedSender<Event>
}

impl Recorder {
    fn new(request: u32) -> (Recorder, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Recorder { request, cancel_on_subscribe: false, subscription: None, tx }, rx)
    }
}

impl Subscriber for Recorder {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        subscription.request(self.request);
        if self.cancel_on_subscribe {
            subscription.cancel();
        }
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, payload: Payload, is_complete: bool) -> Result<(), ApplicationError> {
        let _ = self.tx.send(Event::Next(payload.data_utf8().unwrap(), is_complete));
        Ok(())
    }

    fn on_error(&mut self, error: ChannelError) {
        let _ = self.tx.send(Event::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(Event::Complete);
    }

    fn on_cancel(&mut self) {
        let _ = self.tx.send(Event::Cancel);
    }
}

fn paused() -> Producer {
    stream::pending().boxed()
}

fn config() -> ConnectionConfig {
    ConnectionConfig::parse("ws://localhost:9898").unwrap()
}

async fn connected(config: ConnectionConfig) -> (Connection, MemoryPeer) {
    let (flow, mut peer) = socket::memory();
    let connection = connection::connect(move |_| async move { Ok::<_, ConnectionError>(flow) }, config)
        .await
        .unwrap();

    match peer.rx.next().await {
        Some(Frame::Setup(_)) => {}
        other => panic!("expected SETUP, got {:?}", other)
    }
    assert_eq!(connection.state(), ConnectionState::Active);
    (connection, peer)
}

async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), peer.rx.next())
        .await
        .expect("no frame from connection")
        .expect("connection writer closed")
}

async fn assert_no_frame(peer: &mut MemoryPeer) {
    let frame = tokio::time::timeout(Duration::from_millis(100), peer.rx.next()).await;
    assert!(frame.is_err(), "unexpected frame {:?}", frame);
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event from channel")
        .expect("subscriber dropped")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Event>) {
    let event = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(matches!(event, Err(_) | Ok(None)), "unexpected event {:?}", event);
}

async fn wait_released(connection: &Connection) {
    for _ in 0..100 {
        if connection.open_channels().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channels still open: {:?}", connection.open_channels().await);
}

fn request_channel(stream_id: u32, initial_request_n: u32) -> Frame {
    Frame::RequestChannel { stream_id, initial_request_n, complete: false, payload: Payload::empty() }
}

#[tokio::test]
async fn single_payload_then_pause_keeps_the_channel_open() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), producer::once_then_pause(Payload::from("X")))
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();

    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("X"), false));

    peer.tx.unbounded_send(Frame::next(1, Payload::from("X"), false)).unwrap();
    assert_eq!(next_event(&mut events).await, Event::Next("X".into(), false));
    assert_no_event(&mut events).await;
    assert_no_frame(&mut peer).await;
    assert_eq!(connection.open_channels().await, vec![1]);

    flux.cancel();
    assert_eq!(next_event(&mut events).await, Event::Cancel);
    assert_eq!(next_frame(&mut peer).await, Frame::Cancel { stream_id: 1 });
    wait_released(&connection).await;
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn complete_flag_signals_once_and_late_payload_is_rejected() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), producer::once_then_pause(Payload::from("X")))
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("X"), false));

    peer.tx.unbounded_send(Frame::next(1, Payload::from("a"), true)).unwrap();
    assert_eq!(next_event(&mut events).await, Event::Next("a".into(), true));

    // outbound is still open after the peer completed
    assert_eq!(connection.open_channels().await, vec![1]);

    peer.tx.unbounded_send(Frame::next(1, Payload::from("b"), false)).unwrap();
    match next_frame(&mut peer).await {
        Frame::Error { stream_id: 1, code: ErrorCode::Invalid, .. } => {}
        other => panic!("expected ERROR, got {:?}", other)
    }
    assert_no_event(&mut events).await;
    wait_released(&connection).await;
}

#[tokio::test]
async fn completion_wait_resolves_once() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), producer::once_then_pause(Payload::from("X")))
        .await
        .unwrap();
    let (handler, mut completion) = InboundHandler::new(|_: &Payload| Ok(()));
    flux.subscribe(handler).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));

    peer.tx.unbounded_send(Frame::next(1, Payload::from("a"), true)).unwrap();
    peer.tx.unbounded_send(Frame::complete(1)).unwrap();
    assert_eq!(completion.wait().await, Completion::Completed);
    assert_eq!(completion.wait().await, Completion::Completed);
}

#[tokio::test]
async fn publisher_complete_flag_stops_emission() {
    let (connection, mut peer) = connected(config()).await;
    let items = stream::iter(vec![(Payload::from("a"), true), (Payload::from("never"), false)]);
    let flux = connection
        .request_channel(Payload::from("init"), producer::from_stream(items))
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();

    match next_frame(&mut peer).await {
        Frame::RequestChannel { stream_id: 1, payload, .. } => assert_eq!(payload, Payload::from("init")),
        other => panic!("expected REQUEST_CHANNEL, got {:?}", other)
    }
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("a"), true));
    assert_no_frame(&mut peer).await;
    assert_eq!(connection.open_channels().await, vec![1]);

    peer.tx.unbounded_send(Frame::complete(1)).unwrap();
    assert_eq!(next_event(&mut events).await, Event::Complete);
    wait_released(&connection).await;
}

#[tokio::test]
async fn payloads_beyond_demand_are_a_violation() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(2);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, 2));

    for data in ["a", "b", "c"] {
        peer.tx.unbounded_send(Frame::next(1, Payload::from(data), false)).unwrap();
    }

    assert_eq!(next_event(&mut events).await, Event::Next("a".into(), false));
    assert_eq!(next_event(&mut events).await, Event::Next("b".into(), false));
    assert_eq!(
        next_event(&mut events).await,
        Event::Error(ChannelError::ProtocolViolation(Violation::InsufficientCredit))
    );
    match next_frame(&mut peer).await {
        Frame::Error { stream_id: 1, code: ErrorCode::Invalid, .. } => {}
        other => panic!("expected ERROR, got {:?}", other)
    }
    wait_released(&connection).await;
    assert_eq!(connection.state(), ConnectionState::Active);
}

#[tokio::test]
async fn request_then_cancel_delivers_nothing() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), producer::once_then_pause(Payload::from("X")))
        .await
        .unwrap();
    let (mut recorder, mut events) = Recorder::new(5);
    recorder.cancel_on_subscribe = true;
    flux.subscribe(recorder).unwrap();

    assert_eq!(next_event(&mut events).await, Event::Cancel);
    wait_released(&connection).await;

    peer.tx.unbounded_send(Frame::next(1, Payload::from("late"), false)).unwrap();
    assert_no_event(&mut events).await;
    assert_no_frame(&mut peer).await;
}

#[tokio::test]
async fn transport_close_terminates_every_channel_once() {
    for count in [0usize, 1, 3] {
        let (connection, mut peer) = connected(config()).await;
        let mut receivers = vec![];
        for _ in 0..count {
            let flux = connection
                .request_channel(Payload::empty(), paused())
                .await
                .unwrap();
            let (recorder, events) = Recorder::new(MAX_DEMAND);
            flux.subscribe(recorder).unwrap();
            assert!(matches!(next_frame(&mut peer).await, Frame::RequestChannel { .. }));
            receivers.push(events);
        }
        assert_eq!(connection.open_channels().await.len(), count);

        let MemoryPeer { tx, rx: _rx } = peer;
        drop(tx);

        assert_eq!(connection.wait_closed().await, ConnectionError::Disconnected);
        assert_eq!(connection.state(), ConnectionState::Closed(ConnectionError::Disconnected));
        for mut events in receivers {
            assert_eq!(
                next_event(&mut events).await,
                Event::Error(ChannelError::ConnectionClosed(ConnectionError::Disconnected))
            );
            assert_no_event(&mut events).await;
        }
        assert!(connection.open_channels().await.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out() {
    let config = config().with_keepalive(Duration::from_secs(1), Duration::from_secs(3600));
    let (connection, mut peer) = connected(config).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();

    assert_eq!(connection.wait_closed().await, ConnectionError::HeartbeatTimeout);
    assert_eq!(
        next_event(&mut events).await,
        Event::Error(ChannelError::ConnectionClosed(ConnectionError::HeartbeatTimeout))
    );

    let mut keepalives = 0;
    while let Some(frame) = peer.rx.next().await {
        if let Frame::KeepAlive { respond: true, .. } = frame {
            keepalives += 1;
        }
    }
    assert_eq!(keepalives, 2);
}

#[tokio::test(start_paused = true)]
async fn answered_keepalives_keep_the_connection() {
    let config = config().with_keepalive(Duration::from_secs(1), Duration::from_secs(3600));
    let (connection, mut peer) = connected(config).await;

    for _ in 0..5 {
        match next_frame(&mut peer).await {
            Frame::KeepAlive { respond: true, .. } => {}
            other => panic!("expected KEEPALIVE, got {:?}", other)
        }
        peer.tx.unbounded_send(Frame::KeepAlive { respond: false, last_received_position: 0, data: Bytes::new() }).unwrap();
    }
    assert_eq!(connection.state(), ConnectionState::Active);
}

#[tokio::test(start_paused = true)]
async fn max_lifetime_closes_the_connection() {
    let config = config().with_keepalive(Duration::from_secs(10), Duration::from_secs(2));
    let (connection, _peer) = connected(config).await;
    assert_eq!(connection.wait_closed().await, ConnectionError::MaxLifetimeExceeded);
}

#[tokio::test]
async fn peer_keepalive_is_answered() {
    let (_connection, mut peer) = connected(config()).await;
    peer.tx.unbounded_send(Frame::KeepAlive { respond: true, last_received_position: 7, data: Bytes::from("ping") }).unwrap();
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::KeepAlive { respond: false, last_received_position: 0, data: Bytes::from("ping") }
    );
}

#[tokio::test]
async fn second_subscriber_is_rejected() {
    let (connection, _peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();
    let (first, mut first_events) = Recorder::new(MAX_DEMAND);
    let (second, mut second_events) = Recorder::new(MAX_DEMAND);

    flux.subscribe(first).unwrap();
    assert_eq!(flux.subscribe(second), Err(ChannelError::ProtocolViolation(Violation::SecondSubscriber)));

    assert_eq!(
        next_event(&mut first_events).await,
        Event::Error(ChannelError::ProtocolViolation(Violation::SecondSubscriber))
    );
    assert_no_event(&mut second_events).await;
    wait_released(&connection).await;
}

#[tokio::test]
async fn peer_error_ends_both_directions() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), producer::once_then_pause(Payload::from("X")))
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("X"), false));

    peer.tx.unbounded_send(Frame::error(1, ErrorCode::ApplicationError, "boom")).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Error(ChannelError::Peer { code: ErrorCode::ApplicationError, message: "boom".into() })
    );
    wait_released(&connection).await;
    assert_no_frame(&mut peer).await;
}

#[tokio::test]
async fn callback_error_cancels_the_channel() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();
    let (handler, mut completion) = InboundHandler::new(|_: &Payload| Err(ApplicationError::new("bad payload")));
    flux.subscribe(handler).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));

    peer.tx.unbounded_send(Frame::next(1, Payload::from("a"), false)).unwrap();
    assert_eq!(next_frame(&mut peer).await, Frame::Cancel { stream_id: 1 });
    assert_eq!(completion.wait().await, Completion::Errored(ChannelError::Application("bad payload".into())));
    assert_eq!(connection.state(), ConnectionState::Active);
}

#[tokio::test]
async fn batch_demand_is_replenished() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();
    let (handler, _completion) = InboundHandler::with_policy(|_: &Payload| Ok(()), DemandPolicy::Batch(2));
    flux.subscribe(handler).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, 2));

    peer.tx.unbounded_send(Frame::next(1, Payload::from("a"), false)).unwrap();
    assert_eq!(next_frame(&mut peer).await, Frame::RequestN { stream_id: 1, n: 1 });
}

#[tokio::test]
async fn outbound_waits_for_peer_demand() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel_with(Payload::empty(), producer::once_then_pause(Payload::from("X")), DemandPolicy::Batch(0))
        .await
        .unwrap();
    let (recorder, _events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));
    assert_no_frame(&mut peer).await;

    peer.tx.unbounded_send(Frame::RequestN { stream_id: 1, n: 1 }).unwrap();
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("X"), false));
}

#[tokio::test]
async fn producer_end_is_written_without_peer_demand() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel_with(Payload::empty(), producer::from_stream(stream::empty()), DemandPolicy::Batch(0))
        .await
        .unwrap();
    let (recorder, _events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();

    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));
    assert_eq!(next_frame(&mut peer).await, Frame::complete(1));
}

#[tokio::test]
async fn peer_cancel_ends_an_open_channel() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), producer::once_then_pause(Payload::from("X")))
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("X"), false));

    peer.tx.unbounded_send(Frame::Cancel { stream_id: 1 }).unwrap();
    assert_eq!(next_frame(&mut peer).await, Frame::Cancel { stream_id: 1 });
    assert_eq!(next_event(&mut events).await, Event::Cancel);
    wait_released(&connection).await;

    peer.tx.unbounded_send(Frame::next(1, Payload::from("late"), false)).unwrap();
    assert_no_event(&mut events).await;
    assert_no_frame(&mut peer).await;
    assert_eq!(connection.state(), ConnectionState::Active);
}

#[tokio::test]
async fn peer_cancel_after_peer_completed_stops_outbound_quietly() {
    let (connection, mut peer) = connected(config()).await;
    let (handle, outbound) = producer::channel(4);
    let flux = connection
        .request_channel(Payload::empty(), outbound)
        .await
        .unwrap();
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_frame(&mut peer).await, request_channel(1, MAX_DEMAND));

    peer.tx.unbounded_send(Frame::complete(1)).unwrap();
    assert_eq!(next_event(&mut events).await, Event::Complete);

    handle.send(Payload::from("a")).await.unwrap();
    assert_eq!(next_frame(&mut peer).await, Frame::next(1, Payload::from("a"), false));

    peer.tx.unbounded_send(Frame::Cancel { stream_id: 1 }).unwrap();
    wait_released(&connection).await;
    assert_no_event(&mut events).await;
    assert_no_frame(&mut peer).await;

    // the producer was dropped with the outbound side
    assert_eq!(handle.send(Payload::from("b")).await, Err(Payload::from("b")));
}

#[tokio::test]
async fn dropping_an_unsubscribed_flux_releases_the_channel() {
    let (connection, mut peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();
    assert_eq!(connection.open_channels().await, vec![1]);

    drop(flux);
    wait_released(&connection).await;
    assert_no_frame(&mut peer).await;
}

#[tokio::test]
async fn rejected_setup_closes_the_connection() {
    let (connection, peer) = connected(config()).await;
    let flux = connection
        .request_channel(Payload::empty(), paused())
        .await
        .unwrap();

    peer.tx.unbounded_send(Frame::error(0, ErrorCode::RejectedSetup, "no")).unwrap();
    let reason = ConnectionError::RSocketError { code: ErrorCode::RejectedSetup, message: "no".into() };
    assert_eq!(connection.wait_closed().await, reason);

    // the channel was never subscribed, the subscriber still hears about the teardown
    let (recorder, mut events) = Recorder::new(MAX_DEMAND);
    flux.subscribe(recorder).unwrap();
    assert_eq!(next_event(&mut events).await, Event::Error(ChannelError::ConnectionClosed(reason)));
}

#[tokio::test]
async fn zero_keepalive_is_refused_before_connecting() {
    for (keepalive, lifetime) in [
        (Duration::ZERO, Duration::from_secs(60)),
        (Duration::from_secs(1), Duration::from_micros(10))
    ] {
        let (flow, _peer) = socket::memory();
        let opened = Arc::new(AtomicBool::new(false));
        let flag = opened.clone();
        let result = connection::connect(
            move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, ConnectionError>(flow)
            },
            config().with_keepalive(keepalive, lifetime)
        ).await;

        assert!(matches!(result, Err(ConnectionError::InvalidConfig(_))));
        assert!(!opened.load(Ordering::SeqCst));
    }
}

#[tokio::test]
async fn no_channels_after_close() {
    let (connection, _peer) = connected(config()).await;
    assert_eq!(connection.close().await, ConnectionError::Closed);
    assert_eq!(connection.close().await, ConnectionError::Closed);

    let result = connection
        .request_channel(Payload::empty(), paused())
        .await;
    assert!(matches!(result, Err(ConnectionError::Closed)));
}

#[tokio::test]
async fn stream_ids_are_odd_and_never_reused() {
    let (connection, _peer) = connected(config()).await;
    let first = connection.request_channel(Payload::empty(), paused()).await.unwrap();
    first.cancel();
    wait_released(&connection).await;
    let second = connection.request_channel(Payload::empty(), paused()).await.unwrap();
    assert_eq!(first.stream_id(), 1);
    assert_eq!(second.stream_id(), 3);
}

#[tokio::test]
async fn unknown_stream_frames_are_dropped() {
    let (connection, mut peer) = connected(config()).await;
    peer.tx.unbounded_send(Frame::next(41, Payload::from("stray"), false)).unwrap();
    assert_no_frame(&mut peer).await;
    assert_eq!(connection.state(), ConnectionState::Active);
}
