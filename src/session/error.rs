use std::fmt;
use std::io;

use http::StatusCode;
use thiserror::Error;
use url::Url;

use crate::response::Response;
use crate::transport::TransportError;
use crate::wire::WireError;

pub type SessionResult<T> = Result<T, SessionError>;

/// Stable classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidUrl,
    InvalidScheme,
    ResolveFailed,
    ConnectionFailed,
    TlsHandshakeFailed,
    Timeout,
    TooManyRedirects,
    BodyTooLarge,
    InvalidResponse,
    ConnectionClosed,
    Cancelled,
    InvalidRequest,
    Status,
    Decode,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid-url",
            Self::InvalidScheme => "invalid-scheme",
            Self::ResolveFailed => "resolve-failed",
            Self::ConnectionFailed => "connection-failed",
            Self::TlsHandshakeFailed => "tls-handshake-failed",
            Self::Timeout => "timeout",
            Self::TooManyRedirects => "too-many-redirects",
            Self::BodyTooLarge => "body-too-large",
            Self::InvalidResponse => "invalid-response",
            Self::ConnectionClosed => "connection-closed",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest => "invalid-request",
            Self::Status => "status",
            Self::Decode => "decode",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised by [`Response::raise_for_status`] for 4xx/5xx responses.
#[derive(Debug, Clone, Error)]
#[error("{} {}: {}", .status.as_u16(), .reason, .url)]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub reason: String,
    pub url: Url,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unsupported url scheme `{0}`")]
    InvalidScheme(String),
    #[error("failed to resolve {host}: {source}")]
    ResolveFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {host} failed: {source}")]
    TlsHandshakeFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("request timed out")]
    Timeout,
    #[error("exceeded {limit} redirects")]
    TooManyRedirects { limit: usize },
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("connection closed before the response completed")]
    ConnectionClosed {
        #[source]
        source: Option<io::Error>,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Status(#[from] HttpStatusError),
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
    /// A failure after one or more redirects; `history` holds the hops
    /// completed before it.
    #[error("{source} (after {} redirect(s))", .history.len())]
    Redirected {
        #[source]
        source: Box<SessionError>,
        history: Vec<Response>,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Self::InvalidScheme(_) => ErrorKind::InvalidScheme,
            Self::ResolveFailed { .. } => ErrorKind::ResolveFailed,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::TlsHandshakeFailed { .. } => ErrorKind::TlsHandshakeFailed,
            Self::Timeout => ErrorKind::Timeout,
            Self::TooManyRedirects { .. } => ErrorKind::TooManyRedirects,
            Self::BodyTooLarge { .. } => ErrorKind::BodyTooLarge,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Status(_) => ErrorKind::Status,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Redirected { source, .. } => source.kind(),
        }
    }

    /// Responses completed before the failure, oldest first.
    pub fn history(&self) -> &[Response] {
        match self {
            Self::Redirected { history, .. } => history,
            _ => &[],
        }
    }

    /// The underlying error with any redirect history stripped.
    pub fn root(&self) -> &SessionError {
        match self {
            Self::Redirected { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub(crate) fn with_history(self, history: Vec<Response>) -> Self {
        if history.is_empty() {
            return self;
        }
        match self {
            Self::Redirected {
                source,
                history: mut earlier,
            } => {
                earlier.extend(history);
                Self::Redirected {
                    source,
                    history: earlier,
                }
            }
            other => Self::Redirected {
                source: Box::new(other),
                history,
            },
        }
    }

    /// Classifies an I/O failure on an established connection.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::InvalidData => Self::InvalidResponse(err.to_string()),
            _ => Self::ConnectionClosed { source: Some(err) },
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Resolve { host, source } => Self::ResolveFailed { host, source },
            TransportError::Connect { host, port, source } => {
                Self::ConnectionFailed { host, port, source }
            }
            TransportError::Tls { host, source } => Self::TlsHandshakeFailed { host, source },
        }
    }
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::IncompleteBody => Self::ConnectionClosed { source: None },
            other => Self::InvalidResponse(other.to_string()),
        }
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_as_stable_names() {
        assert_eq!(ErrorKind::TooManyRedirects.to_string(), "too-many-redirects");
        assert_eq!(SessionError::Timeout.kind().as_str(), "timeout");
    }

    #[test]
    fn history_wrapping_preserves_kind() {
        let err = SessionError::Timeout.with_history(Vec::new());
        assert!(matches!(err, SessionError::Timeout));
        assert!(err.history().is_empty());

        let response = Response::for_test(302, "http://example.com/a");
        let wrapped = SessionError::TooManyRedirects { limit: 1 }.with_history(vec![response]);
        assert_eq!(wrapped.kind(), ErrorKind::TooManyRedirects);
        assert_eq!(wrapped.history().len(), 1);
        assert!(matches!(wrapped.root(), SessionError::TooManyRedirects { limit: 1 }));
        assert!(wrapped.to_string().contains("after 1 redirect"));
    }

    #[test]
    fn transport_errors_map_to_kinds() {
        let err: SessionError = TransportError::Resolve {
            host: "nowhere.invalid".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "nx"),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ResolveFailed);

        let err = SessionError::from_io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);

        let err: SessionError = WireError::HeadTooLarge.into();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }
}
