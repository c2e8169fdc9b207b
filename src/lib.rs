//! A request-channel client for RSocket over websocket or TCP, with demand-based flow control
//! in both directions.

use std::time::Duration;

pub mod channel;
pub mod frame;
pub mod net;
pub mod netflow;

pub use channel::errors::{ApplicationError, ChannelError};
pub use channel::{Completion, DemandPolicy, InboundFlux, InboundHandler, Subscriber, Subscription};
pub use frame::payload::Payload;
pub use netflow::config::ConnectionConfig;
pub use netflow::connection::Connection;
pub use netflow::errors::ConnectionError;
pub use netflow::ConnectionState;

/// Connects to `ws://host:port`.
pub async fn connect(host: &str, port: u16, keep_alive: Duration, max_lifetime: Duration) -> Result<Connection, ConnectionError> {
    let config = ConnectionConfig::parse(&format!("ws://{}:{}", host, port))?
        .with_keepalive(keep_alive, max_lifetime);
    netflow::connection::connect_websocket(config).await
}
