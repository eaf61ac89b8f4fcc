//! In-memory HTTP server behind a [`Connector`], for session tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::transport::{BoxedIo, Connector, PoolKey, TransportError, VerifyConfig};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub key: PoolKey,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

type Handler = dyn Fn(&RecordedRequest) -> String + Send + Sync;

/// Serves raw HTTP responses produced by a handler over duplex pipes.
///
/// A response containing `Connection: close` ends its connection.
pub(crate) struct ScriptedConnector {
    handler: Arc<Handler>,
    connects: AtomicUsize,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedConnector {
    pub(crate) fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&RecordedRequest) -> String + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Arc::new(handler),
            connects: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        key: &PoolKey,
        _verify: &VerifyConfig,
    ) -> Result<BoxedIo, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(
            server,
            key.clone(),
            self.handler.clone(),
            self.requests.clone(),
        ));
        Ok(Box::new(client))
    }
}

async fn serve(
    mut stream: DuplexStream,
    key: PoolKey,
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let mut buf = BytesMut::new();
    while let Some(request) = read_request(&mut stream, &mut buf, &key).await {
        requests.lock().unwrap().push(request.clone());
        let response = handler(&request);
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if response.to_ascii_lowercase().contains("connection: close") {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

async fn read_request(
    stream: &mut DuplexStream,
    buf: &mut BytesMut,
    key: &PoolKey,
) -> Option<RecordedRequest> {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(head_len)) = parsed.parse(buf) {
            let header_list: Vec<(String, String)> = parsed
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            let content_length = header_list
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_len + content_length {
                let request = RecordedRequest {
                    key: key.clone(),
                    method: parsed.method.unwrap_or_default().to_string(),
                    target: parsed.path.unwrap_or_default().to_string(),
                    headers: header_list,
                    body: buf[head_len..head_len + content_length].to_vec(),
                };
                let _ = buf.split_to(head_len + content_length);
                return Some(request);
            }
        }

        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Builds a raw response with `Content-Length` set from `body`.
pub(crate) fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out
}
