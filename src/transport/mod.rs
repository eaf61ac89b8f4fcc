//! Connection establishment and reuse.
//!
//! A [`Connector`] turns a [`PoolKey`] into a byte stream; the
//! [`ConnectionPool`] keeps finished connections around for later requests
//! to the same origin.

mod pool;
mod tcp;
mod tls;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use url::Url;

pub use pool::{ConnectionPool, PoolConfig};
pub use tcp::TcpConnector;
pub use tls::{ClientIdentity, VerifyConfig};

const READ_CHUNK: usize = 8 * 1024;

/// Byte stream a connection runs over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedIo = Box<dyn Io>;

/// Identity of a reusable connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolKey {
    /// `None` for non-http(s) schemes or URLs without a host.
    pub fn from_url(url: &Url) -> Option<Self> {
        let tls = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return None,
        };
        Some(Self {
            host: url.host_str()?.to_ascii_lowercase(),
            port: url.port_or_known_default()?,
            tls,
        })
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Opens byte streams for the pool.
///
/// The session only depends on this trait, so tests and embedders can swap
/// in their own transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, key: &PoolKey, verify: &VerifyConfig)
    -> Result<BoxedIo, TransportError>;
}

/// An open connection plus any bytes read past the last response.
pub struct Connection {
    key: PoolKey,
    io: BoxedIo,
    read_buf: BytesMut,
    /// Settings the TLS session was established with; `None` for plain TCP.
    tls: Option<VerifyConfig>,
    reusable: bool,
    requests_served: usize,
    idle_since: Instant,
}

impl Connection {
    pub(crate) fn new(key: PoolKey, io: BoxedIo, verify: &VerifyConfig) -> Self {
        let tls = key.tls.then(|| verify.clone());
        Self {
            key,
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            tls,
            reusable: true,
            requests_served: 0,
            idle_since: Instant::now(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// True once the connection has carried a previous exchange.
    pub fn is_reused(&self) -> bool {
        self.requests_served > 0
    }

    /// Whether a request with `verify` may run over this connection.
    ///
    /// TLS connections need identical settings, except that a request
    /// skipping verification accepts any trust roots as long as SNI and
    /// client certificate agree.
    pub(crate) fn serves(&self, verify: &VerifyConfig) -> bool {
        match &self.tls {
            None => true,
            Some(opened) if opened == verify => true,
            Some(opened) => {
                !verify.verify_peer
                    && opened.hostname == verify.hostname
                    && opened.client_identity == verify.client_identity
            }
        }
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable && self.read_buf.is_empty()
    }

    pub(crate) fn mark_unusable(&mut self) {
        self.reusable = false;
    }

    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.requests_served += 1;
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    /// Reads more bytes into the buffer; `0` means the peer closed.
    pub(crate) async fn fill_buf(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.read_buf).await
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    pub(crate) fn idle_since(&self) -> Instant {
        self.idle_since
    }

    /// Non-blocking liveness probe for an idle connection.
    ///
    /// An idle HTTP/1.1 connection should have nothing to read; EOF, stray
    /// bytes or an error all mean it cannot carry another request.
    pub(crate) fn probe_idle(&mut self) -> bool {
        let mut cx = Context::from_waker(Waker::noop());
        let mut scratch = [0u8; 1];
        let mut buf = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.io).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(_) => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("tls", &self.tls)
            .field("reusable", &self.reusable)
            .field("requests_served", &self.requests_served)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_from_url() {
        let key = PoolKey::from_url(&Url::parse("https://Example.com/path").unwrap()).unwrap();
        assert_eq!(
            key,
            PoolKey {
                host: "example.com".into(),
                port: 443,
                tls: true
            }
        );
        assert_eq!(key.to_string(), "https://example.com:443");

        let plain = PoolKey::from_url(&Url::parse("http://localhost:8080/").unwrap()).unwrap();
        assert_eq!(plain.port, 8080);
        assert!(!plain.tls);

        assert!(PoolKey::from_url(&Url::parse("ftp://example.com/").unwrap()).is_none());
    }

    #[test]
    fn tls_connections_require_matching_settings() {
        let (client, _server) = tokio::io::duplex(64);
        let key = PoolKey {
            host: "example.com".into(),
            port: 443,
            tls: true,
        };
        let opened = VerifyConfig::default();
        let conn = Connection::new(key, Box::new(client), &opened);

        assert!(conn.serves(&opened));
        assert!(conn.serves(&VerifyConfig::insecure()));
        assert!(!conn.serves(&opened.clone().with_ca_file("/etc/private-ca.pem")));
        assert!(!conn.serves(&opened.clone().with_hostname("internal.example")));
        assert!(!conn.serves(&VerifyConfig::insecure().with_client_identity("c.pem", "k.pem")));
    }

    #[test]
    fn plain_connections_ignore_tls_settings() {
        let (client, _server) = tokio::io::duplex(64);
        let key = PoolKey {
            host: "example.com".into(),
            port: 80,
            tls: false,
        };
        let conn = Connection::new(key, Box::new(client), &VerifyConfig::insecure());
        assert!(conn.serves(&VerifyConfig::default().with_ca_file("/etc/private-ca.pem")));
    }

    #[tokio::test]
    async fn probe_detects_closed_peer() {
        let (client, server) = tokio::io::duplex(64);
        let key = PoolKey {
            host: "example.com".into(),
            port: 80,
            tls: false,
        };
        let mut conn = Connection::new(key, Box::new(client), &VerifyConfig::default());
        assert!(conn.probe_idle());

        drop(server);
        assert!(!conn.probe_idle());
    }
}
