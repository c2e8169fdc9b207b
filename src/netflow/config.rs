use std::net::SocketAddr;
use std::time::Duration;

use native_tls::Certificate;
use url::Url;

use crate::channel::DemandPolicy;
use crate::frame::payload::Payload;
use crate::net;
use crate::net::NetOpError;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_KEEPALIVE_MISS_LIMIT: u8 = 3;
pub const DEFAULT_MIME_TYPE: &str = "application/json";

#[derive(Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub cert_chain: Vec<Certificate>,
    pub keepalive_interval: Duration,
    /// Keep-alive intervals that may pass without any inbound frame before the peer is
    /// considered dead.
    pub keepalive_miss_limit: u8,
    pub max_lifetime: Duration,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub setup_payload: Payload,
    pub inbound_demand: DemandPolicy,
    pub outbound_demand: DemandPolicy
}

impl ConnectionConfig {

    pub fn new(url: Url) -> Result<ConnectionConfig, NetOpError> {
        let _ = net::use_tls_and_port(&url)?; // check scheme and port
        Ok(ConnectionConfig {
            url,
            cert_chain: vec![],
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_miss_limit: DEFAULT_KEEPALIVE_MISS_LIMIT,
            max_lifetime: DEFAULT_MAX_LIFETIME,
            metadata_mime_type: DEFAULT_MIME_TYPE.into(),
            data_mime_type: DEFAULT_MIME_TYPE.into(),
            setup_payload: Payload::empty(),
            inbound_demand: DemandPolicy::default(),
            outbound_demand: DemandPolicy::default()
        })
    }

    pub fn parse(url: &str) -> Result<ConnectionConfig, NetOpError> {
        let url = Url::parse(url).map_err(|e| NetOpError::InvalidUrl(e.to_string()))?;
        ConnectionConfig::new(url)
    }

    pub fn with_cert_file(mut self, cert_file: &str) -> Result<ConnectionConfig, NetOpError> {
        self.cert_chain = net::read_cert_chain_from_file(cert_file)?;
        Ok(self)
    }

    pub fn with_keepalive(mut self, interval: Duration, max_lifetime: Duration) -> ConnectionConfig {
        self.keepalive_interval = interval;
        self.max_lifetime = max_lifetime;
        self
    }

    pub fn with_demand(mut self, inbound: DemandPolicy, outbound: DemandPolicy) -> ConnectionConfig {
        self.inbound_demand = inbound;
        self.outbound_demand = outbound;
        self
    }

    pub async fn resolve_address(&self) -> Result<SocketAddr, NetOpError> {
        net::resolve_address(self.url.clone(), self.get_port()?).await
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls_and_port().map(|(use_tls, _)| use_tls).unwrap_or(false)
    }

    pub fn get_port(&self) -> Result<u16, NetOpError> { self.use_tls_and_port().map(|(_, port)| port) }

    pub fn use_tls_and_port(&self) -> Result<(bool, u16), NetOpError> {
        net::use_tls_and_port(&self.url)
    }

    pub async fn get_host_name(&self) -> Result<String, NetOpError> {
        match self.url.host_str() {
            Some(host) => Ok(host.into()),
            None => self.resolve_address().await.map(|address| address.ip().to_string())
        }
    }
}
