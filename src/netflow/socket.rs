use std::fmt::Debug;
use std::net::SocketAddr;

use bytes::BytesMut;
use futures::channel::mpsc as memory_channel;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use native_tls::Certificate;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::channel;
use tokio::sync::oneshot;
use tokio_native_tls::{TlsConnector, TlsStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::Framed;
use url::Url;

use crate::frame::codec::{decode_frame, encode_frame, Codec};
use crate::frame::Frame;
use crate::netflow::errors::TransportError;
use crate::netflow::{In, Out, SocketFlow, Term};

const PORT_BUFFER_SIZE: usize = 32;

pub type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn websocket(url: &Url, cert_chain: &[Certificate]) -> Result<WebSocket, TransportError> {
    let connector = if url.scheme() == "wss" {
        Some(Connector::NativeTls(tls_connector(cert_chain)?))
    } else {
        None
    };

    let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;

    Ok(stream)
}

pub async fn tcp(address: SocketAddr) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(&address)
        .await
        .map_err(|e| TransportError::IoError(e.to_string()))?;
    Ok(stream)
}

pub async fn tls(address: SocketAddr, host_name: String, cert_chain: &[Certificate]) -> Result<TlsStream<TcpStream>, TransportError> {
    let stream = TcpStream::connect(&address)
        .await
        .map_err( |e| TransportError::IoError(e.to_string()) )?;

    let stream = TlsConnector::from(tls_connector(cert_chain)?)
        .connect(&host_name, stream)
        .await
        .map_err(|e| TransportError::IoError(e.to_string()))?;

    Ok(stream)
}

fn tls_connector(cert_chain: &[Certificate]) -> Result<native_tls::TlsConnector, TransportError> {
    let mut builder = native_tls::TlsConnector::builder();

    for cert in cert_chain {
        builder.add_root_certificate(cert.clone());
    }

    builder
        .build()
        .map_err(|e| TransportError::TlsError(e.to_string()))
}

/// The far end of an in-memory transport.
pub struct MemoryPeer {
    /// Frames written by the connection.
    pub rx: memory_channel::UnboundedReceiver<Frame>,
    /// Frames delivered to the connection.
    pub tx: memory_channel::UnboundedSender<Frame>
}

pub struct MemoryFlow {
    sink: memory_channel::UnboundedSender<Frame>,
    source: memory_channel::UnboundedReceiver<Frame>
}

/// A connected in-memory transport pair, frames are passed through without encoding.
pub fn memory() -> (MemoryFlow, MemoryPeer) {
    let (tx_to_peer, rx_from_flow) = memory_channel::unbounded();
    let (tx_to_flow, rx_from_peer) = memory_channel::unbounded();
    (
        MemoryFlow { sink: tx_to_peer, source: rx_from_peer },
        MemoryPeer { rx: rx_from_flow, tx: tx_to_flow }
    )
}

impl SocketFlow for MemoryFlow {
    fn ports(self) -> (Term, In, Out) {
        let MemoryFlow { sink, source } = self;
        into_ports(sink, source.map(Ok::<Frame, TransportError>))
    }
}

impl SocketFlow for WebSocket {
    fn ports(self) -> (Term, In, Out) {
        let (sink, source) = self.split();
        let sink = sink.with(|frame: Frame| future::ready(to_ws_message(&frame)));
        let source = source.filter_map(|msg| future::ready(from_ws_message(msg)));
        into_ports(sink, source)
    }
}

impl SocketFlow for TlsStream<TcpStream> {
    fn ports(self) -> (Term, In, Out) {
        framed_ports(self)
    }
}

impl SocketFlow for TcpStream {
    fn ports(self) -> (Term, In, Out) {
        framed_ports(self)
    }
}

fn to_ws_message(frame: &Frame) -> Result<Message, tungstenite::Error> {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf)
        .map_err(|e| tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
    Ok(Message::Binary(buf.freeze()))
}

fn from_ws_message(msg: Result<Message, tungstenite::Error>) -> Option<Result<Frame, TransportError>> {
    match msg {
        Ok(Message::Binary(data)) => match decode_frame(&data) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                log::warn!("Drop undecodable websocket frame. {}", e);
                None
            }
        },
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(other) => {
            log::trace!("Ignore websocket control or text message. {:?}", other);
            None
        }
        Err(e) => Some(Err(TransportError::WebSocket(e.to_string())))
    }
}

fn framed_ports<S>(stream: S) -> (Term, In, Out)
    where
        S: AsyncRead + AsyncWrite,
        S: Sized + Send + Unpin + 'static
{
    let (sink, source) = Framed::new(stream, Codec).split();
    into_ports(sink, source)
}

fn into_ports<Si, St, E>(sink: Si, source: St) -> (Term, In, Out)
    where
        Si: Sink<Frame> + Send + 'static,
        Si::Error: Debug + Send,
        St: Stream<Item = Result<Frame, E>> + Send + 'static,
        E: Debug + Send
{
    let mut sink = Box::pin(sink);
    let mut source = Box::pin(source);
    let (tx_sigterm, rx_sigterm) = oneshot::channel::<()>();
    let (tx_sigterm_1, rx_sigterm_1) = oneshot::channel::<()>();
    let (tx_sigterm_2, rx_sigterm_2) = oneshot::channel::<()>();
    let (tx_inbound, rx_inbound) = channel::<Frame>(PORT_BUFFER_SIZE);
    let (tx_outbound, mut rx_outbound) = channel::<Frame>(PORT_BUFFER_SIZE);

    tokio::spawn(async move {
        let _ = rx_sigterm.await;
        let _ = tx_sigterm_1.send(());
        let _ = tx_sigterm_2.send(());
    });

    tokio::spawn(async move {

        tokio::select! {
            _ = async {
                    while let Some(result) = source.next().await {
                        match result {
                            Ok(frame) => {
                                if let Err(e) = tx_inbound.send(frame).await {
                                    log::error!("Can't send inbound frame. {:?}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                log::error!("Error occurred while reading frame. {:?}", e);
                                break;
                            }
                        }
                    }
                    log::debug!("The input socket is closed!");
                } => {},
            _ = tx_inbound.closed() => {},
            _ = rx_sigterm_1 => {
                log::debug!("Sigterm received on source stream");
            }
        }

    });

    tokio::spawn(async move {

        tokio::select! {
            _ = async {
                    while let Some(frame) = rx_outbound.recv().await {
                        if let Err(e) = sink.send(frame).await {
                            log::error!("Error occurred while sending outbound frame. {:?}", e);
                            break;
                        }
                    }
            } => {} ,

            _ = rx_sigterm_2 => {
                log::debug!("Sigterm received on sink stream");
            }
        }

        let _ = sink.close().await; //ignore any other error.
    });

    (Term { tx_sigterm }, In { rx: rx_inbound }, Out { tx: tx_outbound } )

}
