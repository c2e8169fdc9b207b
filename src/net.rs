use url::Url;
use std::net::SocketAddr;
use native_tls::Certificate;
use strum_macros::Display;
use rand::Rng;

#[derive(Clone, Debug, Display, PartialEq)]
pub enum NetOpError {
    InvalidUrl(String),
    InvalidUrlScheme(String),
    MissingPort(String),
    UnableToResolveHostName(String),
    UnableToReadCert(String)
}

impl std::error::Error for NetOpError {}

/// Websocket urls fall back to their well-known ports, raw TCP urls must name one.
pub fn use_tls_and_port(url: &Url) -> Result<(bool, u16), NetOpError> {
    let use_tls = match url.scheme() {
        "ws" | "tcp" => false,
        "wss" | "tcp+tls" => true,
        s => return Err(NetOpError::InvalidUrlScheme(s.into()))
    };
    url.port_or_known_default()
        .map(|port| (use_tls, port))
        .ok_or_else(|| NetOpError::MissingPort(url.to_string()))
}

pub fn is_websocket(url: &Url) -> bool {
    matches!(url.scheme(), "ws" | "wss")
}

pub async fn resolve_address(url: Url, port: u16) -> Result<SocketAddr, NetOpError> {
    tokio::task::spawn_blocking(move || {
        url
            .socket_addrs(|| Some(port))
            .map_err(|e| NetOpError::UnableToResolveHostName(e.to_string()))
            .and_then(|addrs| {
                let mut rng = rand::thread_rng();
                if addrs.is_empty() {
                    Err(NetOpError::UnableToResolveHostName(url.host_str().unwrap_or("null").into()))
                } else {
                    let idx: usize = rng.gen_range(0..addrs.len());
                    Ok(addrs[idx])
                }
            })
    }).await.map_err(|e| NetOpError::UnableToResolveHostName(e.to_string()))?
}

pub fn read_cert_chain_from_file(path: &str) -> Result<Vec<Certificate>, NetOpError> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|e| NetOpError::UnableToReadCert(e.to_string()))?;
    let mut buffer = vec![];
    file.read_to_end(&mut buffer).map_err(|e| NetOpError::UnableToReadCert(e.to_string()))?;

    let mut certs = vec![];

    let pems = pem::parse_many(&buffer).map_err(|e| NetOpError::UnableToReadCert(e.to_string()))?;
    for cert in pems.iter().rev() {
        match Certificate::from_der(&cert.contents[..]) {
            Ok(value) => certs.push(value),
            Err(e) => return Err(NetOpError::UnableToReadCert(e.to_string()))
        }
    }

    Ok(certs)

}
