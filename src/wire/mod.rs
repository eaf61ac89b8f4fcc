//! HTTP/1.1 wire codec.
//!
//! Serialises requests, parses response heads with `httparse` and frames
//! response bodies (`Content-Length`, chunked, read-until-close).

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use thiserror::Error;
use url::Url;

const MAX_HEADERS: usize = 128;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed response head: {0}")]
    MalformedHead(String),
    #[error("response head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    #[error("invalid chunked encoding: {0}")]
    InvalidChunk(String),
    #[error("connection closed before the body was complete")]
    IncompleteBody,
}

/// A request ready to be written to a connection.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    /// Origin-form target: path plus query.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl PreparedRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let target = request_target(&url);
        Self {
            method,
            url,
            target,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body.as_ref().map_or(0, Bytes::len);
        let mut out = Vec::with_capacity(256 + body_len);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

pub fn request_target(url: &Url) -> String {
    let path = match url.path() {
        "" => "/",
        path => path,
    };
    match url.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

/// `Host` header value: host plus port when it is not the scheme default.
pub fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Whether the server allows the connection to carry another request.
    pub fn keep_alive(&self) -> bool {
        let mut close = false;
        let mut keep_alive = false;
        for token in connection_tokens(&self.headers) {
            match token.as_str() {
                "close" => close = true,
                "keep-alive" => keep_alive = true,
                _ => {}
            }
        }
        if close {
            return false;
        }
        match self.version {
            Version::HTTP_10 | Version::HTTP_09 => keep_alive,
            _ => true,
        }
    }
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect()
}

/// Parses a complete response head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the head bytes
/// are consumed from `buf`.
pub fn parse_response_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>, WireError> {
    let (head, consumed) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf[..]) {
            Ok(httparse::Status::Complete(consumed)) => (build_head(&response)?, consumed),
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(WireError::HeadTooLarge);
                }
                return Ok(None);
            }
            Err(err) => return Err(WireError::MalformedHead(err.to_string())),
        }
    };
    buf.advance(consumed);
    Ok(Some(head))
}

fn build_head(response: &httparse::Response<'_, '_>) -> Result<ResponseHead, WireError> {
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let code = response
        .code
        .ok_or_else(|| WireError::MalformedHead("missing status code".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| WireError::MalformedHead(format!("invalid status code {code}")))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| WireError::MalformedHead(format!("invalid header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| WireError::MalformedHead(format!("invalid value for {}", header.name)))?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        version,
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        headers,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilClose,
    Done,
}

/// Incremental response body decoder.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    state: DecoderState,
    close_delimited: bool,
}

impl BodyDecoder {
    /// Chooses the framing for a response to `method`.
    pub fn for_response(method: &Method, head: &ResponseHead) -> Result<Self, WireError> {
        let status = head.status;
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::empty());
        }

        if is_chunked(&head.headers) {
            return Ok(Self::with_state(DecoderState::ChunkSize));
        }

        match content_length(&head.headers)? {
            Some(0) => Ok(Self::empty()),
            Some(len) => Ok(Self::with_state(DecoderState::Length(len))),
            None => Ok(Self {
                state: DecoderState::UntilClose,
                close_delimited: true,
            }),
        }
    }

    pub fn empty() -> Self {
        Self::with_state(DecoderState::Done)
    }

    fn with_state(state: DecoderState) -> Self {
        Self {
            state,
            close_delimited: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecoderState::Done
    }

    /// The body ends only when the peer closes the connection.
    pub fn is_close_delimited(&self) -> bool {
        self.close_delimited
    }

    /// Pulls the next piece of body out of `buf`.
    ///
    /// `Ok(None)` means either more input is needed or the body is complete;
    /// check [`is_done`](Self::is_done) to tell them apart.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            match self.state {
                DecoderState::Done => return Ok(None),
                DecoderState::Length(remaining) => {
                    let Some(chunk) = take_up_to(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecoderState::Done
                    } else {
                        DecoderState::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                DecoderState::UntilClose => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(buf.split().freeze()));
                }
                DecoderState::ChunkSize => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let size_field = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_field, 16)
                        .map_err(|_| WireError::InvalidChunk(format!("bad size {size_field:?}")))?;
                    self.state = if size == 0 {
                        DecoderState::Trailers
                    } else {
                        DecoderState::ChunkData(size)
                    };
                }
                DecoderState::ChunkData(remaining) => {
                    let Some(chunk) = take_up_to(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecoderState::ChunkDataEnd
                    } else {
                        DecoderState::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                DecoderState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(WireError::InvalidChunk("missing CRLF after chunk".into()));
                    }
                    buf.advance(2);
                    self.state = DecoderState::ChunkSize;
                }
                DecoderState::Trailers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = DecoderState::Done;
                    }
                }
            }
        }
    }

    /// Called when the peer closed the connection.
    pub fn finish_on_eof(&mut self) -> Result<(), WireError> {
        match self.state {
            DecoderState::UntilClose | DecoderState::Done => {
                self.state = DecoderState::Done;
                Ok(())
            }
            _ => Err(WireError::IncompleteBody),
        }
    }
}

fn take_up_to(buf: &mut BytesMut, remaining: u64) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }
    let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
    Some(buf.split_to(n).freeze())
}

fn take_line(buf: &mut BytesMut) -> Result<Option<String>, WireError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) => {
            let line = buf.split_to(end + 2);
            Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
        }
        None if buf.len() > MAX_CHUNK_LINE => {
            Err(WireError::InvalidChunk("line too long".into()))
        }
        None => Ok(None),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, WireError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let raw = value
            .to_str()
            .map_err(|_| WireError::InvalidContentLength("non-ascii".into()))?;
        for part in raw.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| WireError::InvalidContentLength(raw.to_string()))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(WireError::InvalidContentLength(raw.to_string()));
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> ResponseHead {
        let mut buf = BytesMut::from(raw);
        parse_response_head(&mut buf).unwrap().unwrap()
    }

    fn drain(decoder: &mut BodyDecoder, buf: &mut BytesMut) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = decoder.decode(buf).unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn encodes_request_line_headers_and_body() {
        let mut request = PreparedRequest::new(
            Method::POST,
            Url::parse("http://example.com:8080/submit?q=1").unwrap(),
        );
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("2"));
        request.body = Some(Bytes::from_static(b"hi"));

        let encoded = String::from_utf8(request.encode()).unwrap();
        assert_eq!(
            encoded,
            "POST /submit?q=1 HTTP/1.1\r\ncontent-length: 2\r\n\r\nhi"
        );
        assert_eq!(host_header(&request.url).unwrap(), "example.com:8080");
    }

    #[test]
    fn host_header_omits_default_port() {
        let url = Url::parse("https://example.com:443/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com");
    }

    #[test]
    fn partial_head_waits_for_more_bytes() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Le");
        assert!(parse_response_head(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ngth: 5\r\n\r\nhello");

        let head = parse_response_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.reason, "OK");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn rejects_garbage_head() {
        let mut buf = BytesMut::from("NOT HTTP AT ALL\r\n\r\n");
        assert!(matches!(
            parse_response_head(&mut buf),
            Err(WireError::MalformedHead(_))
        ));
    }

    #[test]
    fn content_length_body_across_reads() {
        let response = head("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        let mut decoder = BodyDecoder::for_response(&Method::GET, &response).unwrap();

        let mut buf = BytesMut::from("hello");
        assert_eq!(drain(&mut decoder, &mut buf), b"hello");
        assert!(!decoder.is_done());

        buf.extend_from_slice(b"worldEXTRA");
        assert_eq!(drain(&mut decoder, &mut buf), b"world");
        assert!(decoder.is_done());
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[test]
    fn chunked_body_with_extensions_and_trailers() {
        let response = head("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::for_response(&Method::GET, &response).unwrap();

        let mut buf =
            BytesMut::from("5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n");
        assert_eq!(drain(&mut decoder, &mut buf), b"hello world");
        assert!(decoder.is_done());
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_body_split_mid_size_line() {
        let response = head("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::for_response(&Method::GET, &response).unwrap();

        let mut buf = BytesMut::from("1");
        assert!(drain(&mut decoder, &mut buf).is_empty());
        buf.extend_from_slice(b"0\r\n0123456789abcdef\r\n0\r\n\r\n");
        assert_eq!(drain(&mut decoder, &mut buf), b"0123456789abcdef");
        assert!(decoder.is_done());
    }

    #[test]
    fn bad_chunk_size_is_an_error() {
        let response = head("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut decoder = BodyDecoder::for_response(&Method::GET, &response).unwrap();
        let mut buf = BytesMut::from("zz\r\n");
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(WireError::InvalidChunk(_))
        ));
    }

    #[test]
    fn read_until_close() {
        let response = head("HTTP/1.0 200 OK\r\n\r\n");
        let mut decoder = BodyDecoder::for_response(&Method::GET, &response).unwrap();
        assert!(decoder.is_close_delimited());

        let mut buf = BytesMut::from("all of it");
        assert_eq!(drain(&mut decoder, &mut buf), b"all of it");
        assert!(!decoder.is_done());
        decoder.finish_on_eof().unwrap();
        assert!(decoder.is_done());
    }

    #[test]
    fn eof_mid_body_is_an_error() {
        let response = head("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        let mut decoder = BodyDecoder::for_response(&Method::GET, &response).unwrap();
        assert_eq!(decoder.finish_on_eof(), Err(WireError::IncompleteBody));
    }

    #[test]
    fn no_body_for_head_and_bodiless_statuses() {
        let ok = head("HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n");
        assert!(BodyDecoder::for_response(&Method::HEAD, &ok).unwrap().is_done());

        let no_content = head("HTTP/1.1 204 No Content\r\n\r\n");
        assert!(
            BodyDecoder::for_response(&Method::GET, &no_content)
                .unwrap()
                .is_done()
        );

        let not_modified = head("HTTP/1.1 304 Not Modified\r\nContent-Length: 42\r\n\r\n");
        assert!(
            BodyDecoder::for_response(&Method::GET, &not_modified)
                .unwrap()
                .is_done()
        );
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let response = head("HTTP/1.1 200 OK\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n");
        assert!(matches!(
            BodyDecoder::for_response(&Method::GET, &response),
            Err(WireError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn keep_alive_rules() {
        assert!(head("HTTP/1.1 200 OK\r\n\r\n").keep_alive());
        assert!(!head("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!head("HTTP/1.0 200 OK\r\n\r\n").keep_alive());
        assert!(head("HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\n\r\n").keep_alive());
    }
}
