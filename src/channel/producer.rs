//! Ready-made producers for the outbound direction.

use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::channel::Producer;
use crate::frame::payload::Payload;

/// Emits `payload` once and then stays pending until cancelled.
pub fn once_then_pause(payload: Payload) -> Producer {
    stream::once(async move { (payload, false) })
        .chain(stream::pending())
        .boxed()
}

/// Emits every payload of `items` and completes with the last one.
pub fn from_iter<I>(items: I) -> Producer
    where
        I: IntoIterator<Item = Payload>,
        I::IntoIter: Send + 'static
{
    let mut items = items.into_iter().peekable();
    stream::poll_fn(move |_| {
        std::task::Poll::Ready(items.next().map(|payload| {
            let is_last = items.peek().is_none();
            (payload, is_last)
        }))
    }).boxed()
}

pub fn from_stream<S>(stream: S) -> Producer
    where
        S: Stream<Item = (Payload, bool)> + Send + 'static
{
    stream.boxed()
}

/// Sending half of [`channel`].
#[derive(Clone)]
pub struct ProducerHandle {
    tx: mpsc::Sender<(Payload, bool)>
}

impl ProducerHandle {

    pub async fn send(&self, payload: Payload) -> Result<(), Payload> {
        self.tx.send((payload, false)).await.map_err(|e| e.0 .0)
    }

    /// Sends the last payload. The producer completes after it.
    pub async fn send_last(self, payload: Payload) -> Result<(), Payload> {
        self.tx.send((payload, true)).await.map_err(|e| e.0 .0)
    }
}

/// A producer fed from the application. It pauses while the buffer is empty and completes when
/// every handle is dropped.
pub fn channel(buffer_size: usize) -> (ProducerHandle, Producer) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let producer = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }).boxed();
    (ProducerHandle { tx }, producer)
}
