//! # burl-rs
//!
//! A session-based async HTTP/1.1 client over plain TCP and TLS.
//!
//! A [`Session`] keeps cookies, pooled keep-alive connections and default
//! request settings across requests. Each request follows redirects within a
//! bounded budget, answers a digest challenge once, and runs under a single
//! total timeout that covers the whole redirect chain.
//!
//! ## Features
//!
//! - Cookie jar with domain and path matching, expiry and JSON persistence
//! - Basic, Bearer and Digest (MD5, SHA-256, SHA-512/256) authentication
//! - Connection pooling keyed by host, port and TLS
//! - Redirect history with method downgrade on 301/302/303
//! - Streaming bodies with chunked and length-delimited framing
//! - Certificate verification via webpki roots or custom CA files
//!
//! ## Example
//!
//! ```no_run
//! use burl_rs::{RequestOptions, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new();
//!     let response = session
//!         .get("https://example.com", RequestOptions::new())
//!         .await?
//!         .error_for_status()?;
//!     println!("{} after {} redirects", response.status(), response.history().len());
//!     println!("{}", response.text());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cookies;
pub mod events;
pub mod response;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use crate::session::{
    DEFAULT_MAX_REDIRECTS,
    DEFAULT_TIMEOUT,
    EffectiveOptions,
    ErrorKind,
    HttpStatusError,
    IntoUrl,
    RequestOptions,
    Session,
    SessionBuilder,
    SessionConfig,
    SessionError,
    SessionResult,
};

pub use crate::response::{BodyStream, Response, StreamedResponse};

pub use crate::auth::{Auth, DigestAlgorithm};

pub use crate::cookies::{Cookie, CookieJar, SameSite};

pub use crate::transport::{
    ClientIdentity,
    Connector,
    PoolConfig,
    PoolKey,
    TcpConnector,
    TransportError,
    VerifyConfig,
};

pub use crate::events::{
    AuthRetryEvent,
    ErrorEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    RedirectEvent,
    RequestEvent,
    ResponseEvent,
    SessionEvent,
};

pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
pub use url::Url;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
