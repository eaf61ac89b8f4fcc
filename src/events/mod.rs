//! Request lifecycle events.
//!
//! Handlers observe every hop of a request: the outgoing request, the
//! response head, redirects, digest retries and failures.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::session::ErrorKind;

/// A hop is about to be sent.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub url: Url,
    pub method: Method,
    /// Zero for the initial request, incremented per redirect.
    pub hop: usize,
    pub timestamp: DateTime<Utc>,
}

/// A response head arrived.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub reused_connection: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RedirectEvent {
    pub from: Url,
    pub to: Url,
    pub status: u16,
    /// Method used for the next hop.
    pub method: Method,
    pub remaining: usize,
    pub timestamp: DateTime<Utc>,
}

/// The request is being resent with a digest `Authorization`.
#[derive(Debug, Clone)]
pub struct AuthRetryEvent {
    pub url: Url,
    pub realm: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub url: Url,
    pub kind: ErrorKind,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Redirect(RedirectEvent),
    AuthRetry(AuthRetryEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &SessionEvent);
}

/// Broadcasts events to registered handlers, in registration order.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: SessionEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Request(request) => {
                log::debug!("-> {} {} (hop {})", request.method, request.url, request.hop);
            }
            SessionEvent::Response(response) => {
                log::debug!(
                    "<- {} {} -> {} ({:.3}s{})",
                    response.method,
                    response.url,
                    response.status,
                    response.latency.as_secs_f64(),
                    if response.reused_connection { ", reused" } else { "" }
                );
            }
            SessionEvent::Redirect(redirect) => {
                log::info!(
                    "redirect {} {} -> {} as {} ({} left)",
                    redirect.status,
                    redirect.from,
                    redirect.to,
                    redirect.method,
                    redirect.remaining
                );
            }
            SessionEvent::AuthRetry(retry) => {
                log::info!(
                    "digest challenge from {} (realm {}), retrying",
                    retry.url,
                    retry.realm.as_deref().unwrap_or("?")
                );
            }
            SessionEvent::Error(error) => {
                log::warn!("{} failed [{}]: {}", error.url, error.kind, error.error);
            }
        }
    }
}
