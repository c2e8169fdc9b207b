use std::fmt::{Debug, Display};
use std::sync::Mutex;

use futures::Future;
use tokio::sync::{mpsc, oneshot, watch};

use crate::channel::coordinator;
use crate::channel::{DemandPolicy, InboundFlux, Producer};
use crate::frame::payload::Payload;
use crate::frame::Frame;
use crate::net;
use crate::netflow::config::ConnectionConfig;
use crate::netflow::dispatcher::Dispatcher;
use crate::netflow::errors::ConnectionError;
use crate::netflow::models::{ConnectionState, StreamIdSupplier};
use crate::netflow::SocketFlow;

pub async fn connect_websocket(config: ConnectionConfig) -> Result<Connection, ConnectionError> {
    connect(engine::websocket_sock, config).await
}

pub async fn connect_tcp(config: ConnectionConfig) -> Result<Connection, ConnectionError> {
    connect(engine::tcp_sock, config).await
}

pub async fn connect_tls(config: ConnectionConfig) -> Result<Connection, ConnectionError> {
    connect(engine::tls_sock, config).await
}

/// Picks the transport from the url scheme.
pub async fn connect_url(config: ConnectionConfig) -> Result<Connection, ConnectionError> {
    if net::is_websocket(&config.url) {
        connect_websocket(config).await
    } else if config.use_tls() {
        connect_tls(config).await
    } else {
        connect_tcp(config).await
    }
}

pub async fn connect<SF, Fut, S, E>(create_socket: SF, config: ConnectionConfig) -> Result<Connection, ConnectionError>
    where
        SF: FnOnce(ConnectionConfig) -> Fut,
        Fut: Future<Output = Result<S, E>>,
        S: SocketFlow,
        E: Into<ConnectionError> + Debug + Display,
{
    let dispatcher = Dispatcher::new();
    let (tx_state, rx_state) = watch::channel(ConnectionState::Connecting);
    let (tx_close, rx_close) = oneshot::channel();

    let writer = engine::run_loop(create_socket, config.clone(), dispatcher.clone(), tx_state, rx_close).await?;

    Ok(Connection {
        writer,
        dispatcher,
        stream_ids: StreamIdSupplier::new(),
        config,
        rx_state,
        tx_close: Mutex::new(Some(tx_close))
    })
}

/// A client connection. Dropping it closes the connection.
pub struct Connection {
    writer: mpsc::Sender<Frame>,
    dispatcher: Dispatcher,
    stream_ids: StreamIdSupplier,
    config: ConnectionConfig,
    rx_state: watch::Receiver<ConnectionState>,
    tx_close: Mutex<Option<oneshot::Sender<()>>>
}

impl Connection {

    pub fn state(&self) -> ConnectionState {
        self.rx_state.borrow().clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Stream ids of the channels still registered on this connection.
    pub async fn open_channels(&self) -> Vec<u32> {
        self.dispatcher.open_channels().await
    }

    pub async fn request_channel(&self, initial_payload: Payload, producer: Producer) -> Result<InboundFlux, ConnectionError> {
        self.request_channel_with(initial_payload, producer, self.config.outbound_demand).await
    }

    /// Opens a channel. `initial_payload` travels with the REQUEST_CHANNEL frame, the producer
    /// feeds every later payload under `outbound_policy`.
    pub async fn request_channel_with(
        &self,
        initial_payload: Payload,
        producer: Producer,
        outbound_policy: DemandPolicy
    ) -> Result<InboundFlux, ConnectionError> {
        match self.state() {
            ConnectionState::Active => {},
            ConnectionState::Closed(reason) => return Err(reason),
            _ => return Err(ConnectionError::NotActive)
        }

        let stream_id = self.stream_ids.next().ok_or(ConnectionError::StreamIdsExhausted)?;
        coordinator::open_channel(
            stream_id,
            initial_payload,
            producer,
            outbound_policy,
            self.writer.clone(),
            self.dispatcher.clone()
        ).await
    }

    /// Closes the connection and resolves with the reason once it is closed. Every open channel
    /// has been handed the reason by then; its subscriber hears about it from the channel task,
    /// which may run a moment later.
    pub async fn close(&self) -> ConnectionError {
        let tx = match self.tx_close.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        self.wait_closed().await
    }

    /// Resolves with the reason once the connection is closed.
    pub async fn wait_closed(&self) -> ConnectionError {
        let mut rx = self.rx_state.clone();
        let closed = rx.wait_for(|state| matches!(state, ConnectionState::Closed(_))).await;
        match closed.as_deref() {
            Ok(ConnectionState::Closed(reason)) => reason.clone(),
            _ => ConnectionError::Disconnected
        }
    }
}

mod engine {
    use std::fmt::{Debug, Display};
    use std::future::Future;
    use std::time::Duration;

    use tokio::net::TcpStream;
    use tokio::sync::mpsc::Sender;
    use tokio::sync::{oneshot, watch};
    use tokio::time;
    use tokio_native_tls::TlsStream;

    use crate::frame::Frame;
    use crate::netflow::config::ConnectionConfig;
    use crate::netflow::connection::message_utils;
    use crate::netflow::dispatcher::Dispatcher;
    use crate::netflow::errors::{ConnectionError, TransportError};
    use crate::netflow::models::ConnectionState;
    use crate::netflow::socket::{self, WebSocket};
    use crate::netflow::{In, SocketFlow, Term};

    pub async fn websocket_sock(config: ConnectionConfig) -> Result<WebSocket, TransportError> {
        socket::websocket(&config.url, &config.cert_chain).await
    }

    pub async fn tcp_sock(config: ConnectionConfig) -> Result<TcpStream, TransportError> {
        let address = config.resolve_address().await?;
        socket::tcp(address).await
    }

    pub async fn tls_sock(config: ConnectionConfig) -> Result<TlsStream<TcpStream>, TransportError> {
        let address = config.resolve_address().await?;
        let host_name = config.get_host_name().await?;
        socket::tls(address, host_name, &config.cert_chain).await
    }

    pub async fn run_loop<SF, Fut, S, E>(create_socket: SF,
                                         config: ConnectionConfig,
                                         dispatcher: Dispatcher,
                                         tx_state: watch::Sender<ConnectionState>,
                                         rx_close: oneshot::Receiver<()>) -> Result<Sender<Frame>, ConnectionError>
        where
            SF: FnOnce(ConnectionConfig) -> Fut,
            Fut: Future<Output = Result<S, E>>,
            S: SocketFlow,
            E: Into<ConnectionError> + Debug + Display,
    {
        let setup = message_utils::create_setup(&config).map_err(|e| {
            log::error!("Invalid connection config. {}", e);
            let _ = tx_state.send_replace(ConnectionState::Closed(e.clone()));
            e
        })?;

        let (sock_term, inbound_rcv, outbound_snd) = create_socket(config.clone()).await
            .map_err(|e| -> ConnectionError {
                log::error!("Unable to open socket. {}", e);
                e.into()
            })?
            .ports();

        let handshake = outbound_snd.tx
            .send(setup).await
            .map_err(|e| ConnectionError::Unexpected(e.to_string()));

        if let Err(e) = handshake {
            sock_term.terminate();
            let _ = tx_state.send_replace(ConnectionState::Closed(e.clone()));
            return Err(e);
        }

        log::debug!("connected!");
        let _ = tx_state.send_replace(ConnectionState::Active);

        let tx_outbound = outbound_snd.tx.clone();
        tokio::spawn(supervise(inbound_rcv, outbound_snd.tx, sock_term, dispatcher, tx_state, rx_close, config));

        Ok(tx_outbound)
    }

    async fn supervise(mut inbound_rcv: In,
                       tx_outbound: Sender<Frame>,
                       sock_term: Term,
                       dispatcher: Dispatcher,
                       tx_state: watch::Sender<ConnectionState>,
                       mut rx_close: oneshot::Receiver<()>,
                       config: ConnectionConfig) {

        let mut heartbeat = Heartbeat::new(config.keepalive_interval, config.keepalive_miss_limit);
        let lifetime = time::sleep(config.max_lifetime);
        tokio::pin!(lifetime);

        let reason = loop {
            tokio::select! {
                frame = inbound_rcv.rx.recv() => match frame {
                    Some(frame) => {
                        heartbeat.beat();
                        if let Some(reason) = handle_frame(frame, &tx_outbound, &dispatcher).await {
                            break reason;
                        }
                    }
                    None => {
                        log::debug!("The input socket is closed!");
                        break ConnectionError::Disconnected;
                    }
                },

                _ = heartbeat.tick() => {
                    if heartbeat.miss() {
                        log::warn!("No frame from server within {} keep-alive intervals", config.keepalive_miss_limit);
                        break ConnectionError::HeartbeatTimeout;
                    }
                    log::debug!("Ping server!");
                    if let Err(e) = send_with_timeout(&tx_outbound, message_utils::create_keepalive(true), config.keepalive_interval).await {
                        break e;
                    }
                },

                _ = &mut lifetime => {
                    log::debug!("Max lifetime reached");
                    break ConnectionError::MaxLifetimeExceeded;
                },

                _ = &mut rx_close => {
                    log::debug!("Close requested");
                    break ConnectionError::Closed;
                }
            }
        };

        let _ = tx_state.send_replace(ConnectionState::Closing);
        let closed = dispatcher.close_all(reason.clone()).await;
        log::debug!("Connection closing. reason: {}, channels terminated: {}", reason, closed);
        sock_term.terminate();
        let _ = tx_state.send_replace(ConnectionState::Closed(reason));
    }

    /// Handles connection-level frames and routes the rest. Returns the reason when the frame
    /// ends the connection.
    async fn handle_frame(frame: Frame, tx_outbound: &Sender<Frame>, dispatcher: &Dispatcher) -> Option<ConnectionError> {
        if frame.stream_id() != 0 {
            dispatcher.dispatch(frame).await;
            return None;
        }

        match frame {
            Frame::KeepAlive { respond: true, data, .. } => {
                log::debug!("Ping received!");
                let pong = Frame::KeepAlive { respond: false, last_received_position: 0, data };
                if tx_outbound.send(pong).await.is_err() {
                    return Some(ConnectionError::Disconnected);
                }
                None
            }
            Frame::KeepAlive { respond: false, .. } => {
                log::debug!("heartbeat received");
                None
            }
            Frame::Error { code, message, .. } => {
                log::error!("Connection error from server. code: {}, message: {}", code, message);
                Some(ConnectionError::RSocketError { code, message })
            }
            Frame::Unsupported { ignore: true, frame_type, .. } => {
                log::debug!("Ignore connection frame. type: {}", frame_type);
                None
            }
            other => {
                log::warn!("Unexpected frame on connection stream. frame: {:?}", other.frame_type());
                None
            }
        }
    }

    /// The writer may be stuck behind a dead socket. Give up waiting after `timeout`.
    async fn send_with_timeout(tx_outbound: &Sender<Frame>, frame: Frame, timeout: Duration) -> Result<(), ConnectionError> {
        tokio::select! {
            sent = tx_outbound.send(frame) => sent.map_err(|_| ConnectionError::Disconnected),
            _ = time::sleep(timeout) => {
                log::warn!("Keep-alive not written within {:?}", timeout);
                Ok(())
            }
        }
    }

    pub(super) struct Heartbeat {
        interval: time::Interval,
        missed: u8,
        miss_limit: u8
    }

    impl Heartbeat {

        pub(super) fn new(period: Duration, miss_limit: u8) -> Heartbeat {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            Heartbeat { interval, missed: 0, miss_limit: miss_limit.max(1) }
        }

        pub(super) async fn tick(&mut self) {
            self.interval.tick().await;
        }

        pub(super) fn beat(&mut self) {
            self.missed = 0;
        }

        /// Counts one silent interval. True once the limit is reached.
        pub(super) fn miss(&mut self) -> bool {
            self.missed = self.missed.saturating_add(1);
            self.missed >= self.miss_limit
        }
    }
}

mod message_utils {
    use std::time::Duration;

    use bytes::Bytes;

    use crate::frame::{Frame, Setup, MAX_U31};
    use crate::netflow::config::ConnectionConfig;
    use crate::netflow::errors::ConnectionError;

    pub fn create_setup(config: &ConnectionConfig) -> Result<Frame, ConnectionError> {
        Ok(Frame::Setup(Setup {
            keepalive_interval: millis(config.keepalive_interval)?,
            max_lifetime: millis(config.max_lifetime)?,
            metadata_mime_type: config.metadata_mime_type.clone(),
            data_mime_type: config.data_mime_type.clone(),
            payload: config.setup_payload.clone()
        }))
    }

    pub fn create_keepalive(respond: bool) -> Frame {
        Frame::KeepAlive { respond, last_received_position: 0, data: Bytes::new() }
    }

    /// Both SETUP intervals must be at least one millisecond and fit in 31 bits.
    fn millis(duration: Duration) -> Result<u32, ConnectionError> {
        match u32::try_from(duration.as_millis()) {
            Ok(ms) if ms > 0 && ms <= MAX_U31 => Ok(ms),
            _ => Err(ConnectionError::InvalidConfig(format!("Duration out of range: {:?}", duration)))
        }
    }
}
