//! Session orchestration.
//!
//! A [`Session`] owns the cookie jar, the connection pool and the default
//! request settings, and drives every request through its redirect chain
//! under a single total timeout.

pub(crate) mod budget;
mod error;
mod options;
mod pipeline;
pub mod redirect;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use http::header::{
	AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::Auth;
use crate::cookies::CookieJar;
use crate::events::{
	ErrorEvent, EventDispatcher, EventHandler, LoggingHandler, RedirectEvent, SessionEvent,
};
use crate::response::{BodyStream, Response, StreamedResponse};
use crate::transport::{ConnectionPool, Connector, PoolConfig, TcpConnector, VerifyConfig};

use self::budget::RequestBudget;
use self::pipeline::{HopContext, HopRequest, InFlight};
use self::redirect::{crosses_origin, follow_action, is_redirect_status, resolve_location};

pub use error::{ErrorKind, HttpStatusError, SessionError, SessionResult};
pub use options::{EffectiveOptions, RequestOptions};

/// Default redirect budget per request.
pub const DEFAULT_MAX_REDIRECTS: usize = 30;
/// Default total timeout per request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Conversion into a validated `http`/`https` URL.
pub trait IntoUrl {
	fn into_url(self) -> SessionResult<Url>;
}

impl IntoUrl for Url {
	fn into_url(self) -> SessionResult<Url> {
		match self.scheme() {
			"http" | "https" => {}
			other => return Err(SessionError::InvalidScheme(other.to_string())),
		}
		if self.host_str().is_none_or(str::is_empty) {
			return Err(SessionError::InvalidUrl(format!("{self} has no host")));
		}
		Ok(self)
	}
}

impl IntoUrl for &Url {
	fn into_url(self) -> SessionResult<Url> {
		self.clone().into_url()
	}
}

impl IntoUrl for &str {
	fn into_url(self) -> SessionResult<Url> {
		Url::parse(self)?.into_url()
	}
}

impl IntoUrl for String {
	fn into_url(self) -> SessionResult<Url> {
		self.as_str().into_url()
	}
}

impl IntoUrl for &String {
	fn into_url(self) -> SessionResult<Url> {
		self.as_str().into_url()
	}
}

/// Session defaults used by the builder.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Sent with every request unless overridden per request.
	pub headers: HeaderMap,
	pub auth: Option<Auth>,
	pub verify: VerifyConfig,
	pub max_redirects: usize,
	/// Total time per request, redirects included. `None` waits forever.
	pub timeout: Option<Duration>,
	pub connect_timeout: Option<Duration>,
	pub max_body_size: Option<usize>,
	pub pool: PoolConfig,
	pub user_agent: String,
	pub enable_logging: bool,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			headers: HeaderMap::new(),
			auth: None,
			verify: VerifyConfig::default(),
			max_redirects: DEFAULT_MAX_REDIRECTS,
			timeout: Some(DEFAULT_TIMEOUT),
			connect_timeout: None,
			max_body_size: None,
			pool: PoolConfig::default(),
			user_agent: format!("burl-rs/{}", crate::VERSION),
			enable_logging: true,
		}
	}
}

/// Fluent builder for [`Session`].
pub struct SessionBuilder {
	config: SessionConfig,
	cookies: CookieJar,
	connector: Option<Arc<dyn Connector>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl SessionBuilder {
	pub fn new() -> Self {
		Self {
			config: SessionConfig::default(),
			cookies: CookieJar::new(),
			connector: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: SessionConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.config.headers.insert(name, value);
		self
	}

	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		self.config.headers = headers;
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.user_agent = user_agent.into();
		self
	}

	pub fn with_auth(mut self, auth: Auth) -> Self {
		self.config.auth = Some(auth);
		self
	}

	pub fn with_verify(mut self, verify: VerifyConfig) -> Self {
		self.config.verify = verify;
		self
	}

	pub fn with_verify_peer(mut self, verify_peer: bool) -> Self {
		self.config.verify.verify_peer = verify_peer;
		self
	}

	pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
		self.config.max_redirects = max_redirects;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.config.timeout = Some(timeout);
		self
	}

	pub fn without_timeout(mut self) -> Self {
		self.config.timeout = None;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.config.connect_timeout = Some(timeout);
		self
	}

	pub fn with_max_body_size(mut self, bytes: usize) -> Self {
		self.config.max_body_size = Some(bytes);
		self
	}

	pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
		self.config.pool = pool;
		self
	}

	pub fn with_cookie_jar(mut self, cookies: CookieJar) -> Self {
		self.cookies = cookies;
		self
	}

	/// Replaces the TCP/TLS transport.
	pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
		self.connector = Some(connector);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_logging(mut self) -> Self {
		self.config.enable_logging = false;
		self
	}

	pub fn build(self) -> SessionResult<Session> {
		HeaderValue::from_str(&self.config.user_agent).map_err(|_| {
			SessionError::InvalidRequest(format!("invalid user agent {:?}", self.config.user_agent))
		})?;
		Ok(self.assemble())
	}

	fn assemble(self) -> Session {
		let mut events = EventDispatcher::new();
		if self.config.enable_logging {
			events.register_handler(Arc::new(LoggingHandler));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let connector = self
			.connector
			.unwrap_or_else(|| Arc::new(TcpConnector::new()));

		Session {
			pool: Arc::new(ConnectionPool::new(self.config.pool.clone())),
			jar: Mutex::new(self.cookies),
			connector,
			events,
			shutdown: CancellationToken::new(),
			config: self.config,
		}
	}
}

impl Default for SessionBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct Outcome {
	in_flight: InFlight,
	url: Url,
	history: Vec<Response>,
	started: Instant,
	budget: RequestBudget,
}

/// HTTP client session: cookies, pooled connections and shared defaults.
///
/// Requests may run concurrently from several tasks; the jar and pool are
/// synchronised internally.
pub struct Session {
	config: SessionConfig,
	jar: Mutex<CookieJar>,
	pool: Arc<ConnectionPool>,
	connector: Arc<dyn Connector>,
	events: EventDispatcher,
	shutdown: CancellationToken,
}

impl Session {
	/// Session with default configuration.
	pub fn new() -> Self {
		SessionBuilder::new().assemble()
	}

	pub fn builder() -> SessionBuilder {
		SessionBuilder::new()
	}

	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.config.headers
	}

	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.config.headers
	}

	/// Locks the cookie jar. Do not hold the guard across an `.await`.
	pub fn cookies(&self) -> MutexGuard<'_, CookieJar> {
		self.jar.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn auth(&self) -> Option<&Auth> {
		self.config.auth.as_ref()
	}

	pub fn set_auth(&mut self, auth: Auth) {
		self.config.auth = Some(auth);
	}

	pub fn clear_auth(&mut self) {
		self.config.auth = None;
	}

	pub fn verify(&self) -> &VerifyConfig {
		&self.config.verify
	}

	pub fn set_verify(&mut self, verify: VerifyConfig) {
		self.config.verify = verify;
	}

	pub fn max_redirects(&self) -> usize {
		self.config.max_redirects
	}

	pub fn set_max_redirects(&mut self, max_redirects: usize) {
		self.config.max_redirects = max_redirects;
	}

	pub fn timeout(&self) -> Option<Duration> {
		self.config.timeout
	}

	pub fn set_timeout(&mut self, timeout: Option<Duration>) {
		self.config.timeout = timeout;
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	/// Cancels in-flight requests and closes idle connections.
	///
	/// Every later request fails with [`ErrorKind::Cancelled`].
	pub fn close(&self) {
		self.shutdown.cancel();
		self.pool.clear();
	}

	pub fn is_closed(&self) -> bool {
		self.shutdown.is_cancelled()
	}

	/// Perform a request with an explicit method.
	pub async fn request<U: IntoUrl>(
		&self,
		method: Method,
		url: U,
		options: RequestOptions,
	) -> SessionResult<Response> {
		self.fetch(Some(method), url.into_url()?, options).await
	}

	/// Perform a request whose method follows from the options: POST when a
	/// body is present, GET otherwise.
	pub async fn send<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.fetch(None, url.into_url()?, options).await
	}

	pub async fn get<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.request(Method::GET, url, options).await
	}

	pub async fn post<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.request(Method::POST, url, options).await
	}

	pub async fn put<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.request(Method::PUT, url, options).await
	}

	pub async fn patch<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.request(Method::PATCH, url, options).await
	}

	pub async fn delete<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.request(Method::DELETE, url, options).await
	}

	pub async fn head<U: IntoUrl>(&self, url: U, options: RequestOptions) -> SessionResult<Response> {
		self.request(Method::HEAD, url, options).await
	}

	pub async fn options<U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<Response> {
		self.request(Method::OPTIONS, url, options).await
	}

	pub async fn get_json<U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<Response<serde_json::Value>> {
		self.get(url, options).await?.into_json()
	}

	pub async fn post_json<U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<Response<serde_json::Value>> {
		self.post(url, options).await?.into_json()
	}

	pub async fn get_as<T: DeserializeOwned, U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<Response<T>> {
		self.get(url, options).await?.into_json()
	}

	pub async fn post_as<T: DeserializeOwned, U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<Response<T>> {
		self.post(url, options).await?.into_json()
	}

	/// Like [`request`](Self::request) but returns once the final response
	/// head has arrived; the body is read through the returned stream.
	pub async fn request_streamed<U: IntoUrl>(
		&self,
		method: Method,
		url: U,
		options: RequestOptions,
	) -> SessionResult<StreamedResponse> {
		let Outcome {
			in_flight,
			url,
			history,
			started,
			budget,
		} = self.run(Some(method), url.into_url()?, options).await?;
		let InFlight {
			head,
			conn,
			decoder,
		} = in_flight;

		let body = BodyStream::new(
			conn,
			decoder,
			self.pool.clone(),
			budget,
			self.config.max_body_size,
		);
		Ok(StreamedResponse::new(head, url, started.elapsed(), history, body))
	}

	pub async fn get_streamed<U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<StreamedResponse> {
		self.request_streamed(Method::GET, url, options).await
	}

	pub async fn post_streamed<U: IntoUrl>(
		&self,
		url: U,
		options: RequestOptions,
	) -> SessionResult<StreamedResponse> {
		self.request_streamed(Method::POST, url, options).await
	}

	async fn fetch(
		&self,
		method: Option<Method>,
		url: Url,
		options: RequestOptions,
	) -> SessionResult<Response> {
		let Outcome {
			in_flight,
			url,
			history,
			started,
			budget,
		} = self.run(method, url, options).await?;

		match budget.run(self.hop_context().finish(in_flight)).await {
			Ok((head, body)) => Ok(Response::from_head(
				head,
				String::from_utf8_lossy(&body).into_owned(),
				url,
				started.elapsed(),
				history,
			)),
			Err(err) => Err(self.fail(err, &url, history)),
		}
	}

	/// Runs the redirect chain until a final response head is in.
	async fn run(
		&self,
		method: Option<Method>,
		url: Url,
		options: RequestOptions,
	) -> SessionResult<Outcome> {
		let effective = EffectiveOptions::resolve(&self.config, options, method)?;
		let budget = RequestBudget::new(
			effective.timeout,
			self.shutdown.clone(),
			effective.cancel_token.clone(),
		);
		if budget.is_cancelled() {
			return Err(SessionError::Cancelled);
		}

		let started = Instant::now();
		let ctx = self.hop_context();
		let EffectiveOptions {
			method,
			headers,
			body,
			mut auth,
			max_redirects,
			verify,
			..
		} = effective;

		let mut hop = HopRequest {
			method,
			url,
			headers,
			body,
			index: 0,
		};
		let mut remaining = max_redirects;
		let mut history = Vec::new();

		loop {
			let hop_started = Instant::now();
			let in_flight = match budget.run(ctx.execute(&hop, &mut auth, &verify)).await {
				Ok(in_flight) => in_flight,
				Err(err) => return Err(self.fail(err, &hop.url, history)),
			};

			let status = in_flight.head.status;
			let location = (max_redirects > 0 && is_redirect_status(status))
				.then(|| {
					in_flight
						.head
						.headers
						.get(LOCATION)
						.and_then(|value| value.to_str().ok())
						.map(str::to_string)
				})
				.flatten();
			let Some(location) = location else {
				return Ok(Outcome {
					in_flight,
					url: hop.url,
					history,
					started,
					budget,
				});
			};

			let next = match resolve_location(&hop.url, &location) {
				Ok(next) => next,
				Err(err) => return Err(self.fail(err, &hop.url, history)),
			};
			let (head, body) = match budget.run(ctx.finish(in_flight)).await {
				Ok(done) => done,
				Err(err) => return Err(self.fail(err, &hop.url, history)),
			};
			history.push(Response::from_head(
				head,
				String::from_utf8_lossy(&body).into_owned(),
				hop.url.clone(),
				hop_started.elapsed(),
				Vec::new(),
			));

			if remaining == 0 {
				let err = SessionError::TooManyRedirects {
					limit: max_redirects,
				};
				return Err(self.fail(err, &hop.url, history));
			}
			remaining -= 1;

			let action = follow_action(status, &hop.method);
			if !action.keep_body {
				hop.body = None;
				for name in [CONTENT_TYPE, CONTENT_LENGTH, TRANSFER_ENCODING] {
					hop.headers.remove(name);
				}
			}
			if crosses_origin(&hop.url, &next) {
				// jar cookies and Host are recomputed for the new origin
				for name in [AUTHORIZATION, COOKIE, HOST] {
					hop.headers.remove(name);
				}
				if auth.take().is_some() {
					log::debug!("not forwarding credentials from {} to {}", hop.url, next);
				}
			}

			self.events.dispatch(SessionEvent::Redirect(RedirectEvent {
				from: hop.url.clone(),
				to: next.clone(),
				status: status.as_u16(),
				method: action.method.clone(),
				remaining,
				timestamp: Utc::now(),
			}));

			hop.method = action.method;
			hop.url = next;
			hop.index += 1;
		}
	}

	fn hop_context(&self) -> HopContext<'_> {
		HopContext {
			pool: &self.pool,
			connector: self.connector.as_ref(),
			jar: &self.jar,
			events: &self.events,
			connect_timeout: self.config.connect_timeout,
			max_body_size: self.config.max_body_size,
		}
	}

	fn fail(&self, err: SessionError, url: &Url, history: Vec<Response>) -> SessionError {
		self.events.dispatch(SessionEvent::Error(ErrorEvent {
			url: url.clone(),
			kind: err.kind(),
			error: err.to_string(),
			timestamp: Utc::now(),
		}));
		err.with_history(history)
	}
}

impl Default for Session {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.pool.clear();
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("config", &self.config)
			.field("idle_connections", &self.pool.total_idle())
			.field("closed", &self.is_closed())
			.finish()
	}
}
