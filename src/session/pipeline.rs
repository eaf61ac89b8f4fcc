//! A single hop: acquire a connection, write the request, read the response
//! head, store cookies and answer one digest challenge.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http::header::{CONNECTION, CONTENT_LENGTH, COOKIE, HOST, SET_COOKIE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use super::error::{SessionError, SessionResult};
use crate::auth::{Auth, find_digest_challenge};
use crate::cookies::CookieJar;
use crate::events::{AuthRetryEvent, EventDispatcher, RequestEvent, ResponseEvent, SessionEvent};
use crate::transport::{Connection, ConnectionPool, Connector, PoolKey, VerifyConfig};
use crate::wire::{BodyDecoder, PreparedRequest, ResponseHead, host_header, parse_response_head};

/// Request state for the current hop.
#[derive(Debug, Clone)]
pub(crate) struct HopRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub index: usize,
}

/// A response whose head has been read and whose body is still on the wire.
pub(crate) struct InFlight {
    pub head: ResponseHead,
    pub conn: Connection,
    pub decoder: BodyDecoder,
}

/// Session resources a hop works with.
pub(crate) struct HopContext<'a> {
    pub pool: &'a ConnectionPool,
    pub connector: &'a dyn Connector,
    pub jar: &'a Mutex<CookieJar>,
    pub events: &'a EventDispatcher,
    pub connect_timeout: Option<Duration>,
    pub max_body_size: Option<usize>,
}

impl HopContext<'_> {
    /// Sends `hop` and returns once the response head is in.
    ///
    /// A 401 carrying a digest challenge for a not yet challenged digest
    /// strategy is answered once; any further 401 is returned as is.
    pub(crate) async fn execute(
        &self,
        hop: &HopRequest,
        auth: &mut Option<Auth>,
        verify: &VerifyConfig,
    ) -> SessionResult<InFlight> {
        let mut answered_challenge = false;
        loop {
            let request = self.prepare(hop, auth.as_mut())?;
            self.events.dispatch(SessionEvent::Request(RequestEvent {
                url: hop.url.clone(),
                method: hop.method.clone(),
                hop: hop.index,
                timestamp: Utc::now(),
            }));

            let started = Instant::now();
            let (in_flight, reused) = self.exchange(&request, verify).await?;
            self.events.dispatch(SessionEvent::Response(ResponseEvent {
                url: hop.url.clone(),
                method: hop.method.clone(),
                status: in_flight.head.status.as_u16(),
                latency: started.elapsed(),
                reused_connection: reused,
                timestamp: Utc::now(),
            }));
            self.store_cookies(&hop.url, &in_flight.head.headers);

            if !answered_challenge
                && in_flight.head.status == StatusCode::UNAUTHORIZED
                && let Some(digest) = auth.as_mut().and_then(Auth::as_digest_mut)
                && !digest.is_challenged()
                && let Some(challenge) = find_digest_challenge(&in_flight.head.headers)
            {
                match digest.process_challenge(&challenge) {
                    Ok(()) => {
                        answered_challenge = true;
                        let realm = digest.realm().map(str::to_string);
                        self.finish(in_flight).await?;
                        self.events.dispatch(SessionEvent::AuthRetry(AuthRetryEvent {
                            url: hop.url.clone(),
                            realm,
                            timestamp: Utc::now(),
                        }));
                        continue;
                    }
                    Err(err) => log::warn!("ignoring digest challenge from {}: {err}", hop.url),
                }
            }

            return Ok(in_flight);
        }
    }

    /// Reads the rest of the body and hands the connection back to the pool.
    pub(crate) async fn finish(&self, in_flight: InFlight) -> SessionResult<(ResponseHead, Bytes)> {
        let InFlight {
            head,
            mut conn,
            mut decoder,
        } = in_flight;
        let body = read_body(&mut conn, &mut decoder, self.max_body_size).await?;
        self.pool.release(conn);
        Ok((head, body))
    }

    fn prepare(&self, hop: &HopRequest, auth: Option<&mut Auth>) -> SessionResult<PreparedRequest> {
        let mut request = PreparedRequest::new(hop.method.clone(), hop.url.clone());
        request.headers = hop.headers.clone();

        if !request.headers.contains_key(HOST) {
            let host = host_header(&hop.url)
                .ok_or_else(|| SessionError::InvalidUrl(format!("{} has no host", hop.url)))?;
            request.headers.insert(HOST, header_value(&host)?);
        }

        let cookies = self
            .jar
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_cookie_header(&hop.url);
        if !cookies.is_empty() {
            let value = match request.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}; {cookies}"),
                None => cookies,
            };
            request.headers.insert(COOKIE, header_value(&value)?);
        }

        request.headers.remove(TRANSFER_ENCODING);
        match &hop.body {
            Some(body) => {
                request
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                request.body = Some(body.clone());
            }
            None if [Method::POST, Method::PUT, Method::PATCH].contains(&hop.method) => {
                request
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            None => {
                request.headers.remove(CONTENT_LENGTH);
            }
        }

        if let Some(auth) = auth {
            auth.apply(&mut request);
        }
        Ok(request)
    }

    async fn exchange(
        &self,
        request: &PreparedRequest,
        verify: &VerifyConfig,
    ) -> SessionResult<(InFlight, bool)> {
        let key = PoolKey::from_url(&request.url)
            .ok_or_else(|| SessionError::InvalidUrl(request.url.to_string()))?;
        let mut conn = self.connect(&key, verify).await?;
        let reused = conn.is_reused();

        conn.send(&request.encode())
            .await
            .map_err(SessionError::from_io)?;
        let head = read_head(&mut conn).await?;
        let decoder = BodyDecoder::for_response(&request.method, &head)?;

        if !head.keep_alive() || decoder.is_close_delimited() || asks_close(&request.headers) {
            conn.mark_unusable();
        }
        Ok((InFlight { head, conn, decoder }, reused))
    }

    async fn connect(&self, key: &PoolKey, verify: &VerifyConfig) -> SessionResult<Connection> {
        let acquire = self.pool.acquire(key, verify, self.connector);
        let conn = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| SessionError::Timeout)??,
            None => acquire.await?,
        };
        Ok(conn)
    }

    fn store_cookies(&self, url: &Url, headers: &HeaderMap) {
        let mut values = headers.get_all(SET_COOKIE).iter().peekable();
        if values.peek().is_none() {
            return;
        }
        let mut jar = self.jar.lock().unwrap_or_else(PoisonError::into_inner);
        for value in values {
            jar.set_from_header(&String::from_utf8_lossy(value.as_bytes()), url);
        }
    }
}

async fn read_head(conn: &mut Connection) -> SessionResult<ResponseHead> {
    loop {
        if let Some(head) = parse_response_head(conn.buffer())? {
            if head.status.is_informational() {
                log::trace!("skipping interim {} response", head.status);
                continue;
            }
            return Ok(head);
        }
        let read = conn.fill_buf().await.map_err(SessionError::from_io)?;
        if read == 0 {
            return Err(SessionError::ConnectionClosed { source: None });
        }
    }
}

async fn read_body(
    conn: &mut Connection,
    decoder: &mut BodyDecoder,
    limit: Option<usize>,
) -> SessionResult<Bytes> {
    let mut body = BytesMut::new();
    loop {
        while let Some(chunk) = decoder.decode(conn.buffer())? {
            if let Some(limit) = limit
                && body.len() + chunk.len() > limit
            {
                return Err(SessionError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        if decoder.is_done() {
            return Ok(body.freeze());
        }

        let read = conn.fill_buf().await.map_err(SessionError::from_io)?;
        if read == 0 {
            decoder.finish_on_eof()?;
            conn.mark_unusable();
        }
    }
}

fn asks_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        })
}

fn header_value(value: &str) -> SessionResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SessionError::InvalidRequest(format!("invalid header value {value:?}")))
}
