//! Response types returned by a [`Session`](crate::Session).

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::AsHeaderName;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::session::budget::RequestBudget;
use crate::session::redirect::is_redirect_status;
use crate::session::{HttpStatusError, SessionError, SessionResult};
use crate::transport::{Connection, ConnectionPool};
use crate::wire::{BodyDecoder, ResponseHead};

/// A fully read response.
///
/// `history` lists the redirect responses that led here, oldest first.
#[derive(Debug, Clone)]
pub struct Response<B = String> {
    version: Version,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    body: B,
    url: Url,
    elapsed: Duration,
    history: Vec<Response>,
}

impl<B> Response<B> {
    pub(crate) fn from_head(
        head: ResponseHead,
        body: B,
        url: Url,
        elapsed: Duration,
        history: Vec<Response>,
    ) -> Self {
        Self {
            version: head.version,
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
            url,
            elapsed,
            history,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_int(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if present and valid UTF-8.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn history(&self) -> &[Response] {
        &self.history
    }

    /// Status below 400.
    pub fn ok(&self) -> bool {
        self.status.as_u16() < 400
    }

    pub fn is_redirect(&self) -> bool {
        is_redirect_status(self.status)
    }

    pub fn raise_for_status(&self) -> SessionResult<()> {
        if self.ok() {
            return Ok(());
        }
        Err(HttpStatusError {
            status: self.status,
            reason: self.reason.clone(),
            url: self.url.clone(),
        }
        .into())
    }

    /// Consumes the response, failing on 4xx/5xx.
    pub fn error_for_status(self) -> SessionResult<Self> {
        self.raise_for_status()?;
        Ok(self)
    }

    pub fn map_body<C>(self, f: impl FnOnce(B) -> C) -> Response<C> {
        Response {
            version: self.version,
            status: self.status,
            reason: self.reason,
            headers: self.headers,
            body: f(self.body),
            url: self.url,
            elapsed: self.elapsed,
            history: self.history,
        }
    }
}

impl Response<String> {
    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> SessionResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Parses the body as JSON, keeping status, headers and history.
    pub fn into_json<T: DeserializeOwned>(self) -> SessionResult<Response<T>> {
        let body = serde_json::from_str(&self.body)?;
        Ok(self.map_body(|_| body))
    }
}

#[cfg(test)]
impl Response {
    pub(crate) fn for_test(status: u16, url: &str) -> Self {
        Self {
            version: Version::HTTP_11,
            status: StatusCode::from_u16(status).unwrap(),
            reason: String::new(),
            headers: HeaderMap::new(),
            body: String::new(),
            url: Url::parse(url).unwrap(),
            elapsed: Duration::ZERO,
            history: Vec::new(),
        }
    }
}

/// A response whose body is read incrementally.
///
/// The connection goes back to the pool once the body has been read to the
/// end; dropping the response earlier closes it.
#[derive(Debug)]
pub struct StreamedResponse {
    version: Version,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    url: Url,
    elapsed: Duration,
    history: Vec<Response>,
    body: BodyStream,
}

impl StreamedResponse {
    pub(crate) fn new(
        head: ResponseHead,
        url: Url,
        elapsed: Duration,
        history: Vec<Response>,
        body: BodyStream,
    ) -> Self {
        Self {
            version: head.version,
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            url,
            elapsed,
            history,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_int(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Time until the response head arrived.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn history(&self) -> &[Response] {
        &self.history
    }

    pub fn ok(&self) -> bool {
        self.status.as_u16() < 400
    }

    pub fn is_redirect(&self) -> bool {
        is_redirect_status(self.status)
    }

    pub fn body_mut(&mut self) -> &mut BodyStream {
        &mut self.body
    }

    pub fn into_body(self) -> BodyStream {
        self.body
    }

    /// Next body chunk; `None` once the body is complete.
    pub async fn chunk(&mut self) -> SessionResult<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Reads the rest of the body into a buffered [`Response`].
    pub async fn buffer(self) -> SessionResult<Response> {
        let Self {
            version,
            status,
            reason,
            headers,
            url,
            elapsed,
            history,
            body,
        } = self;
        let text = body.text().await?;
        Ok(Response {
            version,
            status,
            reason,
            headers,
            body: text,
            url,
            elapsed,
            history,
        })
    }
}

/// Incremental reader over a response body.
pub struct BodyStream {
    conn: Option<Connection>,
    decoder: BodyDecoder,
    pool: Arc<ConnectionPool>,
    budget: RequestBudget,
    limit: Option<usize>,
    received: usize,
}

impl BodyStream {
    pub(crate) fn new(
        conn: Connection,
        decoder: BodyDecoder,
        pool: Arc<ConnectionPool>,
        budget: RequestBudget,
        limit: Option<usize>,
    ) -> Self {
        Self {
            conn: Some(conn),
            decoder,
            pool,
            budget,
            limit,
            received: 0,
        }
    }

    /// Bytes delivered so far.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.decoder.is_done()
    }

    pub async fn chunk(&mut self) -> SessionResult<Option<Bytes>> {
        let result = self.next_chunk().await;
        match &result {
            Ok(Some(_)) => {}
            Ok(None) => self.release(),
            // the connection is in an unknown state
            Err(_) => self.conn = None,
        }
        result
    }

    async fn next_chunk(&mut self) -> SessionResult<Option<Bytes>> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };

        loop {
            if let Some(chunk) = self.decoder.decode(conn.buffer())? {
                self.received += chunk.len();
                if let Some(limit) = self.limit
                    && self.received > limit
                {
                    return Err(SessionError::BodyTooLarge { limit });
                }
                return Ok(Some(chunk));
            }
            if self.decoder.is_done() {
                return Ok(None);
            }

            let read = self
                .budget
                .run(async { conn.fill_buf().await.map_err(SessionError::from_io) })
                .await?;
            if read == 0 {
                self.decoder.finish_on_eof()?;
                conn.mark_unusable();
            }
        }
    }

    pub async fn bytes(mut self) -> SessionResult<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Whole remaining body as text; invalid UTF-8 is replaced.
    pub async fn text(self) -> SessionResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        if self.decoder.is_done() {
            self.release();
        }
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream")
            .field("received", &self.received)
            .field("complete", &self.decoder.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http::header::CONTENT_TYPE;
    use serde::Deserialize;

    fn response(status: u16, body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Response::from_head(
            ResponseHead {
                version: Version::HTTP_11,
                status: StatusCode::from_u16(status).unwrap(),
                reason: "Reason".into(),
                headers,
            },
            body.to_string(),
            Url::parse("https://example.com/final").unwrap(),
            Duration::from_millis(5),
            vec![Response::for_test(302, "https://example.com/start")],
        )
    }

    #[test]
    fn status_helpers() {
        assert!(response(200, "").ok());
        assert!(response(399, "").ok());
        assert!(!response(404, "").ok());
        assert!(response(308, "").is_redirect());
        assert!(!response(304, "").is_redirect());
    }

    #[test]
    fn raise_for_status_reports_status_reason_and_url() {
        assert!(response(201, "").raise_for_status().is_ok());

        let err = response(503, "").raise_for_status().unwrap_err();
        let SessionError::Status(status) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(status.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status.reason, "Reason");
        assert_eq!(status.url.as_str(), "https://example.com/final");
        assert_eq!(err.to_string(), "503 Reason: https://example.com/final");
    }

    #[test]
    fn json_conversion_keeps_metadata() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            name: String,
        }

        let typed = response(200, r#"{"name":"burl"}"#)
            .into_json::<Payload>()
            .unwrap();
        assert_eq!(typed.body().name, "burl");
        assert_eq!(typed.history().len(), 1);
        assert_eq!(typed.header(CONTENT_TYPE), Some("application/json"));

        let err = response(200, "not json").json::<Payload>().unwrap_err();
        assert_eq!(err.kind(), crate::session::ErrorKind::Decode);
    }
}
