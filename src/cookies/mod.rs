//! Cookie storage with RFC 6265 matching.
//!
//! The jar is owned by the session and updated from every `Set-Cookie`
//! header seen on a hop. Lookups never return expired cookies, and `Secure`
//! cookies are only handed out for `https` URLs.

mod parse;

use std::io::{Read, Write};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub use parse::{CookieParseError, parse_cookie_date, parse_set_cookie};

/// `SameSite` attribute of a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    None,
    #[default]
    Lax,
    Strict,
}

/// A single stored cookie.
///
/// Identity inside a [`CookieJar`] is the `(name, domain, path)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Absolute expiry; `None` marks a session cookie.
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(&domain.into()),
            path: "/".to_string(),
            expires: None,
            secure: false,
            http_only: false,
            same_site: SameSite::default(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// Session cookies never expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Whether this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        self.matches_at(url, Utc::now())
    }

    fn matches_at(&self, url: &Url, now: DateTime<Utc>) -> bool {
        if self.is_expired_at(now) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        domain_matches(host, &self.domain) && path_matches(request_path(url), &self.path)
    }

    fn has_key(&self, name: &str, domain: &str, path: &str) -> bool {
        self.name == name && self.domain == domain && self.path == path
    }
}

/// RFC 6265 section 5.1.3 domain matching.
///
/// `host` matches when it equals `domain` or ends with `.domain`. IP
/// addresses only match exactly.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    let host = normalize_domain(host);
    let domain = normalize_domain(domain);
    if domain.is_empty() {
        return false;
    }
    if host == domain {
        return true;
    }
    if is_ip_literal(&host) {
        return false;
    }
    host.len() > domain.len()
        && host.ends_with(domain.as_str())
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 section 5.1.4 path matching.
pub fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    if !request_path.starts_with(cookie_path) {
        return false;
    }
    cookie_path.ends_with('/') || request_path.as_bytes()[cookie_path.len()] == b'/'
}

fn request_path(url: &Url) -> &str {
    match url.path() {
        "" => "/",
        path => path,
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

/// Cookie storage owned by a [`Session`](crate::Session).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `cookie`, replacing in place any cookie with the same
    /// `(name, domain, path)`.
    pub fn set(&mut self, cookie: Cookie) {
        match self
            .cookies
            .iter_mut()
            .find(|existing| existing.has_key(&cookie.name, &cookie.domain, &cookie.path))
        {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// Ingests one `Set-Cookie` header value received for `request_url`.
    ///
    /// Returns `true` when a cookie was stored. Malformed values are dropped,
    /// and a cookie arriving already expired deletes its stored counterpart.
    pub fn set_from_header(&mut self, raw: &str, request_url: &Url) -> bool {
        let cookie = match parse_set_cookie(raw, request_url) {
            Ok(cookie) => cookie,
            Err(err) => {
                log::debug!("ignoring Set-Cookie from {request_url}: {err}");
                return false;
            }
        };

        if cookie.is_expired() {
            self.remove(&cookie.name, &cookie.domain, &cookie.path);
            return false;
        }

        self.set(cookie);
        true
    }

    pub fn get(&self, name: &str, domain: &str, path: &str) -> Option<&Cookie> {
        let domain = normalize_domain(domain);
        self.cookies
            .iter()
            .find(|cookie| cookie.has_key(name, &domain, path))
    }

    /// Cookies to send to `url`, longest path first.
    pub fn get_cookies(&self, url: &Url) -> Vec<&Cookie> {
        let now = Utc::now();
        let mut matched: Vec<&Cookie> = self
            .cookies
            .iter()
            .filter(|cookie| cookie.matches_at(url, now))
            .collect();
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matched
    }

    /// `Cookie` header value for `url`; empty when nothing matches.
    pub fn get_cookie_header(&self, url: &Url) -> String {
        self.get_cookies(url)
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn remove(&mut self, name: &str, domain: &str, path: &str) -> Option<Cookie> {
        let domain = normalize_domain(domain);
        let position = self
            .cookies
            .iter()
            .position(|cookie| cookie.has_key(name, &domain, path))?;
        Some(self.cookies.remove(position))
    }

    pub fn remove_expired(&mut self) {
        let now = Utc::now();
        self.cookies.retain(|cookie| !cookie.is_expired_at(now));
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Cookie> {
        self.cookies.iter()
    }

    /// Writes the jar as JSON. Expired cookies are skipped.
    pub fn save_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        let mut live = self.clone();
        live.remove_expired();
        serde_json::to_writer_pretty(writer, &live)
    }

    pub fn load_json<R: Read>(reader: R) -> serde_json::Result<Self> {
        let mut jar: CookieJar = serde_json::from_reader(reader)?;
        jar.remove_expired();
        Ok(jar)
    }
}

impl<'a> IntoIterator for &'a CookieJar {
    type Item = &'a Cookie;
    type IntoIter = std::slice::Iter<'a, Cookie>;

    fn into_iter(self) -> Self::IntoIter {
        self.cookies.iter()
    }
}

impl Extend<Cookie> for CookieJar {
    fn extend<I: IntoIterator<Item = Cookie>>(&mut self, iter: I) {
        for cookie in iter {
            self.set(cookie);
        }
    }
}
