//! Default connector: TCP via tokio, TLS via rustls.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::TlsConnector;

use super::tls::{VerifyConfig, client_config};
use super::{BoxedIo, Connector, PoolKey, TransportError};

/// Connects over TCP, wrapping `https` keys in TLS.
///
/// TLS client configurations are cached per [`VerifyConfig`].
#[derive(Default)]
pub struct TcpConnector {
    tls_configs: Mutex<HashMap<VerifyConfig, Arc<ClientConfig>>>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn tls_config(&self, verify: &VerifyConfig) -> io::Result<Arc<ClientConfig>> {
        let mut cache = self
            .tls_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = cache.get(verify) {
            return Ok(config.clone());
        }
        let config = client_config(verify)?;
        cache.insert(verify.clone(), config.clone());
        Ok(config)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        key: &PoolKey,
        verify: &VerifyConfig,
    ) -> Result<BoxedIo, TransportError> {
        let host = key.host.trim_start_matches('[').trim_end_matches(']');

        let addrs: Vec<_> = lookup_host((host, key.port))
            .await
            .map_err(|source| TransportError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Resolve {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            });
        }

        let mut last_error = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    stream = Some(tcp);
                    break;
                }
                Err(err) => {
                    log::debug!("connect to {addr} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        let tcp = stream.ok_or_else(|| TransportError::Connect {
            host: host.to_string(),
            port: key.port,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address connected")),
        })?;
        if let Err(err) = tcp.set_nodelay(true) {
            log::debug!("failed to set TCP_NODELAY for {key}: {err}");
        }

        if !key.tls {
            return Ok(Box::new(tcp));
        }

        let tls_error = |source: io::Error| TransportError::Tls {
            host: host.to_string(),
            source,
        };
        let config = self.tls_config(verify).map_err(tls_error)?;
        let name = verify.hostname.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|err| tls_error(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(tls_error)?;

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let key = PoolKey {
            host: "127.0.0.1".into(),
            port,
            tls: false,
        };
        TcpConnector::new()
            .connect(&key, &VerifyConfig::default())
            .await
            .unwrap();
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn refused_connection_maps_to_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = PoolKey {
            host: "127.0.0.1".into(),
            port,
            tls: false,
        };
        let err = TcpConnector::new()
            .connect(&key, &VerifyConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn caches_tls_configs() {
        let connector = TcpConnector::new();
        let first = connector.tls_config(&VerifyConfig::default()).unwrap();
        let second = connector.tls_config(&VerifyConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
