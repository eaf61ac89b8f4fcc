//! Redirect classification and target resolution.

use http::{Method, StatusCode};
use url::Url;

use super::error::{SessionError, SessionResult};

pub fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// How the next hop is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectAction {
    pub method: Method,
    /// Whether the request body is resent.
    pub keep_body: bool,
}

/// 303 always becomes a bodiless GET; 301/302 turn POST into GET;
/// 307/308 keep method and body.
pub fn follow_action(status: StatusCode, method: &Method) -> RedirectAction {
    let downgrade = RedirectAction {
        method: Method::GET,
        keep_body: false,
    };
    match status.as_u16() {
        303 => downgrade,
        301 | 302 if method == Method::POST => downgrade,
        _ => RedirectAction {
            method: method.clone(),
            keep_body: true,
        },
    }
}

/// Resolves a `Location` value against the URL that produced it.
pub fn resolve_location(current: &Url, location: &str) -> SessionResult<Url> {
    let next = current
        .join(location.trim())
        .map_err(|err| SessionError::InvalidUrl(format!("redirect to {location:?}: {err}")))?;
    match next.scheme() {
        "http" | "https" => Ok(next),
        other => Err(SessionError::InvalidScheme(other.to_string())),
    }
}

/// Different scheme, host or port. Credentials, caller cookies and the
/// `Host` header are not forwarded across origins.
pub fn crosses_origin(from: &Url, to: &Url) -> bool {
    from.scheme() != to.scheme()
        || from.host_str() != to.host_str()
        || from.port_or_known_default() != to.port_or_known_default()
}
