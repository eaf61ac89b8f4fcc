//! `Set-Cookie` parsing (RFC 6265 section 5.2).

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use thiserror::Error;
use url::Url;

use super::{Cookie, SameSite, domain_matches, normalize_domain};

/// Max-Age values are capped at 400 days.
const MAX_AGE_CAP_SECS: i64 = 400 * 24 * 60 * 60;

const DATE_FORMATS: &[&str] = &[
    "%a, %d-%b-%Y %H:%M:%S GMT",
    "%A, %d-%b-%y %H:%M:%S GMT",
    "%a, %d %b %Y %H:%M:%S GMT",
    "%a %b %e %H:%M:%S %Y",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CookieParseError {
    #[error("missing '=' in cookie pair")]
    MissingPair,
    #[error("empty cookie name")]
    EmptyName,
    #[error("request URL has no host")]
    NoHost,
    #[error("domain attribute {domain:?} does not cover host {host:?}")]
    ForeignDomain { domain: String, host: String },
}

/// Parses one `Set-Cookie` header value received in response to
/// `request_url`.
///
/// Domain defaults to the request host and path to `/`. A `Max-Age` of zero
/// or less yields a cookie that is already expired.
pub fn parse_set_cookie(raw: &str, request_url: &Url) -> Result<Cookie, CookieParseError> {
    let host = request_url
        .host_str()
        .map(normalize_domain)
        .ok_or(CookieParseError::NoHost)?;

    let mut parts = raw.split(';');
    let pair = parts.next().unwrap_or_default();
    let (name, value) = pair.split_once('=').ok_or(CookieParseError::MissingPair)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CookieParseError::EmptyName);
    }

    let mut cookie = Cookie::new(name, value.trim().trim_matches('"'), host.clone());
    let mut max_age: Option<i64> = None;
    let mut expires: Option<DateTime<Utc>> = None;

    for attribute in parts {
        let (key, val) = match attribute.split_once('=') {
            Some((key, val)) => (key.trim(), val.trim()),
            None => (attribute.trim(), ""),
        };

        match key.to_ascii_lowercase().as_str() {
            "expires" => {
                if let Some(at) = parse_cookie_date(val) {
                    expires = Some(at);
                }
            }
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    max_age = Some(secs);
                }
            }
            "domain" => {
                let domain = normalize_domain(val);
                if domain.is_empty() {
                    continue;
                }
                if !domain_matches(&host, &domain) {
                    return Err(CookieParseError::ForeignDomain { domain, host });
                }
                cookie.domain = domain;
            }
            "path" => {
                if val.starts_with('/') {
                    cookie.path = val.to_string();
                }
            }
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "samesite" => match val.to_ascii_lowercase().as_str() {
                "strict" => cookie.same_site = SameSite::Strict,
                "lax" => cookie.same_site = SameSite::Lax,
                "none" => cookie.same_site = SameSite::None,
                _ => {}
            },
            _ => {}
        }
    }

    // Max-Age wins over Expires
    cookie.expires = match max_age {
        Some(secs) if secs <= 0 => Some(DateTime::<Utc>::MIN_UTC),
        Some(secs) => Some(Utc::now() + Duration::seconds(secs.min(MAX_AGE_CAP_SECS))),
        None => expires,
    };

    Ok(cookie)
}

/// Parses the date formats servers use in `Expires`.
pub fn parse_cookie_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc2822(value) {
        return Some(at.with_timezone(&Utc));
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}
