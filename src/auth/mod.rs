//! Authentication strategies applied to outgoing requests.
//!
//! A session holds at most one strategy as its default; each request works
//! on its own copy so digest nonce counting never leaks between calls.

mod digest;

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderValue;
use http::header::AUTHORIZATION;

use crate::wire::PreparedRequest;

pub use digest::{DigestAlgorithm, DigestAuth, DigestChallengeError, Qop, find_digest_challenge};

/// Credentials attached to a request.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic(BasicAuth),
    Digest(DigestAuth),
    Bearer(BearerAuth),
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic(BasicAuth::new(username, password))
    }

    pub fn digest(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Digest(DigestAuth::new(username, password))
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(BearerAuth::new(token))
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Basic(_) => "Basic",
            Self::Digest(_) => "Digest",
            Self::Bearer(_) => "Bearer",
        }
    }

    /// Sets the `Authorization` header on `request`.
    ///
    /// An unchallenged digest strategy leaves the request untouched.
    pub fn apply(&mut self, request: &mut PreparedRequest) {
        let value = match self {
            Self::Basic(basic) => basic.header_value(),
            Self::Bearer(bearer) => bearer.header_value(),
            Self::Digest(digest) => {
                digest.apply(request);
                return;
            }
        };

        match value {
            Some(value) => {
                request.headers.insert(AUTHORIZATION, value);
            }
            None => log::warn!("{} credentials are not a valid header value", self.scheme()),
        }
    }

    pub fn as_digest_mut(&mut self) -> Option<&mut DigestAuth> {
        match self {
            Self::Digest(digest) => Some(digest),
            _ => None,
        }
    }
}

/// `Authorization: Basic base64(user:pass)`.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    encoded: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let encoded = STANDARD.encode(format!("{}:{}", username, password.into()));
        Self { username, encoded }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn header_value(&self) -> Option<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Basic {}", self.encoded)).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// `Authorization: Bearer <token>`.
#[derive(Clone)]
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn header_value(&self) -> Option<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token)).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAuth")
            .field("token", &"<redacted>")
            .finish()
    }
}
