//! Per-request options and their resolution against session defaults.

use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;

use super::SessionConfig;
use super::error::{SessionError, SessionResult};
use crate::auth::Auth;
use crate::transport::VerifyConfig;

const JSON_CONTENT_TYPE: &str = "application/json";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Optional per-request overrides. Unset fields fall back to the session.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Replace session headers of the same name.
    pub headers: Option<HeaderMap>,
    /// JSON body text; sets `Content-Type: application/json`.
    pub json: Option<String>,
    /// Form fragments joined with `&`.
    pub data: Option<Vec<String>>,
    /// Total time for the whole request, redirects included.
    pub timeout: Option<Duration>,
    pub max_redirects: Option<usize>,
    /// `Some(false)` returns the first redirect response as final.
    pub allow_redirects: Option<bool>,
    /// Overrides the session's `verify_peer`.
    pub verify: Option<bool>,
    pub auth: Option<Auth>,
    pub cancel_token: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .append(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn json(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.json = Some(value.into().to_string());
        self
    }

    /// Serialises `value` as the JSON body.
    pub fn json_body<T: serde::Serialize>(mut self, value: &T) -> SessionResult<Self> {
        self.json = Some(serde_json::to_string(value)?);
        Ok(self)
    }

    pub fn json_text(mut self, text: impl Into<String>) -> Self {
        self.json = Some(text.into());
        self
    }

    /// Adds an already encoded form fragment such as `a=1`.
    pub fn data(mut self, fragment: impl Into<String>) -> Self {
        self.data.get_or_insert_with(Vec::new).push(fragment.into());
        self
    }

    /// Adds URL-encoded `key=value` pairs.
    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        if !encoded.is_empty() {
            self.data.get_or_insert_with(Vec::new).push(encoded);
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = Some(max);
        self
    }

    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = Some(allow);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Session defaults merged with [`RequestOptions`] for one request.
#[derive(Debug, Clone)]
pub struct EffectiveOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub auth: Option<Auth>,
    /// Zero disables redirect following.
    pub max_redirects: usize,
    pub verify: VerifyConfig,
    pub timeout: Option<Duration>,
    pub cancel_token: Option<CancellationToken>,
}

impl EffectiveOptions {
    /// Merges `options` over `config`.
    ///
    /// Without an explicit `method` a request carrying a body becomes a
    /// POST, otherwise a GET.
    pub fn resolve(
        config: &SessionConfig,
        options: RequestOptions,
        method: Option<Method>,
    ) -> SessionResult<Self> {
        let mut headers = config.headers.clone();
        if let Some(overrides) = &options.headers {
            for name in overrides.keys() {
                headers.remove(name);
            }
            for (name, value) in overrides {
                headers.append(name.clone(), value.clone());
            }
        }
        if !headers.contains_key(USER_AGENT) {
            let user_agent = HeaderValue::from_str(&config.user_agent).map_err(|_| {
                SessionError::InvalidRequest(format!("invalid user agent {:?}", config.user_agent))
            })?;
            headers.insert(USER_AGENT, user_agent);
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }

        let body = match (options.json, options.data) {
            (Some(_), Some(_)) => {
                return Err(SessionError::InvalidRequest(
                    "json and data bodies are mutually exclusive".into(),
                ));
            }
            (Some(json), None) => {
                set_default_content_type(&mut headers, JSON_CONTENT_TYPE);
                Some(Bytes::from(json))
            }
            (None, Some(fragments)) => {
                set_default_content_type(&mut headers, FORM_CONTENT_TYPE);
                Some(Bytes::from(fragments.join("&")))
            }
            (None, None) => None,
        };

        let method = match method {
            Some(method) => method,
            None if body.is_some() => Method::POST,
            None => Method::GET,
        };

        let max_redirects = if options.allow_redirects == Some(false) {
            0
        } else {
            options.max_redirects.unwrap_or(config.max_redirects)
        };

        let mut verify = config.verify.clone();
        if let Some(verify_peer) = options.verify {
            verify.verify_peer = verify_peer;
        }

        Ok(Self {
            method,
            headers,
            body,
            auth: options.auth.or_else(|| config.auth.clone()),
            max_redirects,
            verify,
            timeout: options.timeout.or(config.timeout),
            cancel_token: options.cancel_token,
        })
    }
}

fn set_default_content_type(headers: &mut HeaderMap, value: &'static str) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::AUTHORIZATION;

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config
            .headers
            .insert("x-a", HeaderValue::from_static("session"));
        config
            .headers
            .insert("x-b", HeaderValue::from_static("keep"));
        config
    }

    #[test]
    fn request_headers_replace_session_headers() {
        let options = RequestOptions::new()
            .header(HeaderName::from_static("x-a"), HeaderValue::from_static("one"))
            .header(HeaderName::from_static("x-a"), HeaderValue::from_static("two"));
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();

        let values: Vec<_> = effective.headers.get_all("x-a").iter().collect();
        assert_eq!(values, vec!["one", "two"]);
        assert_eq!(effective.headers["x-b"], "keep");
    }

    #[test]
    fn static_defaults_fill_only_missing_headers() {
        let effective =
            EffectiveOptions::resolve(&config(), RequestOptions::new(), None).unwrap();
        assert!(
            effective.headers[USER_AGENT]
                .to_str()
                .unwrap()
                .starts_with("burl-rs/")
        );
        assert_eq!(effective.headers[ACCEPT], "*/*");

        let options = RequestOptions::new().header(USER_AGENT, HeaderValue::from_static("custom/1"));
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();
        assert_eq!(effective.headers.get_all(USER_AGENT).iter().count(), 1);
        assert_eq!(effective.headers[USER_AGENT], "custom/1");
    }

    #[test]
    fn body_without_method_upgrades_to_post() {
        let options = RequestOptions::new().json(serde_json::json!({"k": 1}));
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();
        assert_eq!(effective.method, Method::POST);
        assert_eq!(effective.headers[CONTENT_TYPE], JSON_CONTENT_TYPE);
        assert_eq!(effective.body.unwrap(), Bytes::from_static(br#"{"k":1}"#));

        let options = RequestOptions::new().data("a=1");
        let effective = EffectiveOptions::resolve(&config(), options, Some(Method::PUT)).unwrap();
        assert_eq!(effective.method, Method::PUT);
    }

    #[test]
    fn explicit_get_keeps_its_method() {
        let options = RequestOptions::new().data("a=1");
        let effective = EffectiveOptions::resolve(&config(), options, Some(Method::GET)).unwrap();
        assert_eq!(effective.method, Method::GET);
        assert_eq!(effective.headers[CONTENT_TYPE], FORM_CONTENT_TYPE);
    }

    #[test]
    fn form_fragments_are_joined() {
        let options = RequestOptions::new()
            .data("a=1")
            .form([("b", "two words"), ("c", "&")]);
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();
        assert_eq!(
            effective.body.unwrap(),
            Bytes::from_static(b"a=1&b=two+words&c=%26")
        );
    }

    #[test]
    fn caller_content_type_wins() {
        let options = RequestOptions::new()
            .header(CONTENT_TYPE, HeaderValue::from_static("application/vnd.api+json"))
            .json_text("{}");
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();
        assert_eq!(effective.headers.get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(effective.headers[CONTENT_TYPE], "application/vnd.api+json");
    }

    #[test]
    fn json_and_data_conflict() {
        let options = RequestOptions::new().json_text("{}").data("a=1");
        let err = EffectiveOptions::resolve(&config(), options, None).unwrap_err();
        assert_eq!(err.kind(), crate::session::ErrorKind::InvalidRequest);
    }

    #[test]
    fn redirect_settings() {
        let effective =
            EffectiveOptions::resolve(&config(), RequestOptions::new(), None).unwrap();
        assert_eq!(effective.max_redirects, 30);

        let options = RequestOptions::new().max_redirects(5).allow_redirects(false);
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();
        assert_eq!(effective.max_redirects, 0);

        let options = RequestOptions::new().max_redirects(5);
        let effective = EffectiveOptions::resolve(&config(), options, None).unwrap();
        assert_eq!(effective.max_redirects, 5);
    }

    #[test]
    fn auth_verify_and_timeout_overrides() {
        let mut config = config();
        config.auth = Some(Auth::basic("session", "pw"));

        let effective =
            EffectiveOptions::resolve(&config, RequestOptions::new(), None).unwrap();
        assert!(matches!(effective.auth, Some(Auth::Basic(ref b)) if b.username() == "session"));
        assert!(effective.verify.verify_peer);
        assert_eq!(effective.timeout, Some(Duration::from_secs(30)));

        let options = RequestOptions::new()
            .auth(Auth::bearer("t"))
            .verify(false)
            .timeout(Duration::from_secs(2));
        let effective = EffectiveOptions::resolve(&config, options, None).unwrap();
        assert!(matches!(effective.auth, Some(Auth::Bearer(_))));
        assert!(!effective.verify.verify_peer);
        assert_eq!(effective.timeout, Some(Duration::from_secs(2)));
        assert!(!effective.headers.contains_key(AUTHORIZATION));
    }
}
