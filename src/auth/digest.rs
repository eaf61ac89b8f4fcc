//! HTTP Digest access authentication (RFC 7616, with RFC 2069 fallback).

use std::fmt::{self, Write as _};

use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Method};
use md5::Md5;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256, Sha512_256};
use thiserror::Error;

use crate::wire::PreparedRequest;

static AUTH_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z0-9_-]+)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^\s,"]+))"#)
        .expect("invalid auth-param regex")
});

static ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(.)").expect("invalid quoted-pair regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512_256,
    Sha512_256Sess,
}

impl DigestAlgorithm {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            "SHA-512-256" => Some(Self::Sha512_256),
            "SHA-512-256-SESS" => Some(Self::Sha512_256Sess),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
            Self::Sha512_256 => "SHA-512-256",
            Self::Sha512_256Sess => "SHA-512-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess | Self::Sha512_256Sess)
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex_digest::<Md5>(data),
            Self::Sha256 | Self::Sha256Sess => hex_digest::<Sha256>(data),
            Self::Sha512_256 | Self::Sha512_256Sess => hex_digest::<Sha512_256>(data),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthInt => "auth-int",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestChallengeError {
    #[error("header does not carry a Digest challenge")]
    NotDigest,
    #[error("digest challenge is missing `{0}`")]
    MissingParameter(&'static str),
    #[error("unsupported digest algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("no supported qop in `{0}`")]
    UnsupportedQop(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<Qop>,
    algorithm: DigestAlgorithm,
    nonce_count: u32,
}

/// Digest credentials plus the challenge state learned from the server.
///
/// Until a challenge is processed the strategy adds nothing to requests.
#[derive(Clone)]
pub struct DigestAuth {
    username: String,
    password: String,
    challenge: Option<Challenge>,
}

impl DigestAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge: None,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_challenged(&self) -> bool {
        self.challenge.is_some()
    }

    pub fn realm(&self) -> Option<&str> {
        self.challenge.as_ref().map(|c| c.realm.as_str())
    }

    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        self.challenge.as_ref().map(|c| c.algorithm)
    }

    /// Number of authorization headers produced for the current nonce.
    pub fn nonce_count(&self) -> u32 {
        self.challenge.as_ref().map_or(0, |c| c.nonce_count)
    }

    /// Learns realm, nonce, opaque, qop and algorithm from a
    /// `WWW-Authenticate` value and resets the nonce count.
    ///
    /// A malformed challenge clears any previous state.
    pub fn process_challenge(&mut self, www_authenticate: &str) -> Result<(), DigestChallengeError> {
        match parse_challenge(www_authenticate) {
            Ok(challenge) => {
                self.challenge = Some(challenge);
                Ok(())
            }
            Err(err) => {
                self.challenge = None;
                Err(err)
            }
        }
    }

    pub fn apply(&mut self, request: &mut PreparedRequest) {
        let body = request.body.clone().unwrap_or_default();
        let Some(header) = self.authorization(&request.method, &request.target, &body) else {
            return;
        };
        match HeaderValue::from_str(&header) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers.insert(AUTHORIZATION, value);
            }
            Err(_) => log::warn!("digest authorization for {} is not a valid header", request.target),
        }
    }

    /// Builds the next `Authorization` value, advancing the nonce count.
    pub fn authorization(&mut self, method: &Method, uri: &str, body: &[u8]) -> Option<String> {
        let challenge = self.challenge.as_mut()?;
        challenge.nonce_count += 1;
        let cnonce = generate_cnonce();
        let challenge = challenge.clone();
        Some(self.render(&challenge, method, uri, body, &cnonce))
    }

    fn render(
        &self,
        challenge: &Challenge,
        method: &Method,
        uri: &str,
        body: &[u8],
        cnonce: &str,
    ) -> String {
        let nc = format!("{:08x}", challenge.nonce_count);
        let response = self.response_digest(challenge, method, uri, body, cnonce, &nc);

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", algorithm={}, response="{}""#,
            quote(&self.username),
            quote(&challenge.realm),
            quote(&challenge.nonce),
            quote(uri),
            challenge.algorithm,
            response,
        );
        if let Some(opaque) = &challenge.opaque {
            let _ = write!(header, r#", opaque="{}""#, quote(opaque));
        }
        if let Some(qop) = challenge.qop {
            let _ = write!(header, r#", qop={}, nc={}, cnonce="{}""#, qop.as_str(), nc, cnonce);
        } else if challenge.algorithm.is_session() {
            let _ = write!(header, r#", cnonce="{}""#, cnonce);
        }
        header
    }

    fn response_digest(
        &self,
        challenge: &Challenge,
        method: &Method,
        uri: &str,
        body: &[u8],
        cnonce: &str,
        nc: &str,
    ) -> String {
        let algorithm = challenge.algorithm;
        let mut ha1 = algorithm.hash(
            format!("{}:{}:{}", self.username, challenge.realm, self.password).as_bytes(),
        );
        if algorithm.is_session() {
            ha1 = algorithm.hash(format!("{}:{}:{}", ha1, challenge.nonce, cnonce).as_bytes());
        }

        let ha2 = match challenge.qop {
            Some(Qop::AuthInt) => algorithm
                .hash(format!("{}:{}:{}", method, uri, algorithm.hash(body)).as_bytes()),
            _ => algorithm.hash(format!("{}:{}", method, uri).as_bytes()),
        };

        match challenge.qop {
            Some(qop) => algorithm.hash(
                format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1,
                    challenge.nonce,
                    nc,
                    cnonce,
                    qop.as_str(),
                    ha2
                )
                .as_bytes(),
            ),
            None => algorithm.hash(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes()),
        }
    }
}

impl fmt::Debug for DigestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Returns the first `WWW-Authenticate` value offering the Digest scheme.
pub fn find_digest_challenge(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| digest_params_start(value).is_some())
        .map(str::to_string)
}

fn digest_params_start(header: &str) -> Option<usize> {
    let lower = header.to_ascii_lowercase();
    let mut offset = 0;
    while let Some(found) = lower[offset..].find("digest") {
        let start = offset + found;
        let end = start + "digest".len();
        let before_ok = start == 0 || matches!(lower.as_bytes()[start - 1], b' ' | b',' | b'\t');
        let after_ok = lower
            .as_bytes()
            .get(end)
            .is_none_or(|b| b.is_ascii_whitespace());
        if before_ok && after_ok {
            return Some(end);
        }
        offset = end;
    }
    None
}

fn parse_challenge(header: &str) -> Result<Challenge, DigestChallengeError> {
    let start = digest_params_start(header).ok_or(DigestChallengeError::NotDigest)?;
    let params = &header[start..];

    let mut realm = None;
    let mut nonce = None;
    let mut opaque = None;
    let mut qop_raw = None;
    let mut algorithm_raw = None;

    for caps in AUTH_PARAM_RE.captures_iter(params) {
        let value = match (caps.get(2), caps.get(3)) {
            (Some(quoted), _) => ESCAPE_RE.replace_all(quoted.as_str(), "$1").into_owned(),
            (None, Some(token)) => token.as_str().to_string(),
            (None, None) => continue,
        };
        let slot = match caps[1].to_ascii_lowercase().as_str() {
            "realm" => &mut realm,
            "nonce" => &mut nonce,
            "opaque" => &mut opaque,
            "qop" => &mut qop_raw,
            "algorithm" => &mut algorithm_raw,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    let realm = realm.ok_or(DigestChallengeError::MissingParameter("realm"))?;
    let nonce = nonce
        .filter(|n| !n.is_empty())
        .ok_or(DigestChallengeError::MissingParameter("nonce"))?;

    let algorithm = match algorithm_raw {
        Some(raw) => DigestAlgorithm::parse(&raw)
            .ok_or(DigestChallengeError::UnsupportedAlgorithm(raw))?,
        None => DigestAlgorithm::Md5,
    };

    let qop = match qop_raw {
        Some(raw) => {
            let offered: Vec<String> = raw
                .split(',')
                .map(|q| q.trim().to_ascii_lowercase())
                .collect();
            if offered.iter().any(|q| q == "auth") {
                Some(Qop::Auth)
            } else if offered.iter().any(|q| q == "auth-int") {
                Some(Qop::AuthInt)
            } else {
                return Err(DigestChallengeError::UnsupportedQop(raw));
            }
        }
        None => None,
    };

    Ok(Challenge {
        realm,
        nonce,
        opaque,
        qop,
        algorithm,
        nonce_count: 0,
    })
}

fn generate_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    to_hex(&bytes)
}

fn hex_digest<D: Digest>(data: &[u8]) -> String {
    to_hex(&D::digest(data))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    const RFC2617_CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    fn challenged(user: &str, pass: &str, header: &str) -> DigestAuth {
        let mut auth = DigestAuth::new(user, pass);
        auth.process_challenge(header).unwrap();
        auth
    }

    fn response_param(header: &str) -> String {
        let start = header.find("response=\"").unwrap() + "response=\"".len();
        header[start..start + header[start..].find('"').unwrap()].to_string()
    }

    #[test]
    fn rfc2617_md5_vector() {
        let mut auth = challenged("Mufasa", "Circle Of Life", RFC2617_CHALLENGE);
        let challenge = auth.challenge.as_mut().unwrap();
        challenge.nonce_count = 1;
        let challenge = challenge.clone();

        let header = auth.render(&challenge, &Method::GET, "/dir/index.html", b"", "0a4f113b");
        assert_eq!(response_param(&header), "6629fae49393a05397450978507c4ef1");
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
        assert!(header.contains("qop=auth, nc=00000001"));
    }

    #[test]
    fn rfc7616_sha256_vector() {
        let mut auth = challenged(
            "Mufasa",
            "Circle of Life",
            r#"Digest realm="http-auth@example.org", qop="auth, auth-int", algorithm=SHA-256, nonce="7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v", opaque="FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS""#,
        );
        let challenge = auth.challenge.as_mut().unwrap();
        challenge.nonce_count = 1;
        let challenge = challenge.clone();

        let header = auth.render(
            &challenge,
            &Method::GET,
            "/dir/index.html",
            b"",
            "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
        );
        assert_eq!(
            response_param(&header),
            "753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1"
        );
        assert!(header.contains("algorithm=SHA-256"));
    }

    #[test]
    fn nonce_count_increments_per_request() {
        let mut auth = challenged("u", "p", RFC2617_CHALLENGE);
        let first = auth.authorization(&Method::GET, "/a", b"").unwrap();
        let second = auth.authorization(&Method::GET, "/a", b"").unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert_eq!(auth.nonce_count(), 2);
    }

    #[test]
    fn new_challenge_resets_nonce_count() {
        let mut auth = challenged("u", "p", RFC2617_CHALLENGE);
        auth.authorization(&Method::GET, "/a", b"");
        auth.process_challenge(r#"Digest realm="r", nonce="fresh", qop="auth""#)
            .unwrap();
        assert_eq!(auth.nonce_count(), 0);
    }

    #[test]
    fn legacy_challenge_without_qop() {
        let mut auth = challenged("u", "p", r#"Digest realm="r", nonce="n""#);
        let header = auth.authorization(&Method::GET, "/", b"").unwrap();
        assert!(!header.contains("qop="));
        assert!(!header.contains("cnonce="));
        assert!(header.contains("algorithm=MD5"));
    }

    #[test]
    fn malformed_challenges_fail_closed() {
        let mut auth = challenged("u", "p", RFC2617_CHALLENGE);

        assert_eq!(
            auth.process_challenge(r#"Digest realm="r""#),
            Err(DigestChallengeError::MissingParameter("nonce"))
        );
        assert!(!auth.is_challenged());
        assert!(auth.authorization(&Method::GET, "/", b"").is_none());

        assert!(matches!(
            auth.process_challenge(r#"Digest realm="r", nonce="n", algorithm=SHA-1"#),
            Err(DigestChallengeError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            auth.process_challenge(r#"Digest realm="r", nonce="n", qop="token""#),
            Err(DigestChallengeError::UnsupportedQop(_))
        ));
        assert_eq!(
            auth.process_challenge(r#"Basic realm="r""#),
            Err(DigestChallengeError::NotDigest)
        );
    }

    #[test]
    fn picks_digest_out_of_multiple_schemes() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static(r#"Basic realm="basic""#));
        headers.append(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Digest realm="digest", nonce="abc""#),
        );

        let challenge = find_digest_challenge(&headers).unwrap();
        let mut auth = DigestAuth::new("u", "p");
        auth.process_challenge(&challenge).unwrap();
        assert_eq!(auth.realm(), Some("digest"));
    }

    #[test]
    fn quoted_values_are_unescaped() {
        let auth = challenged("u", "p", r#"Digest realm="say \"hi\"", nonce="n""#);
        assert_eq!(auth.realm(), Some(r#"say "hi""#));
    }

    #[test]
    fn session_and_auth_int_variants_sign_requests() {
        let mut auth = challenged(
            "u",
            "p",
            r#"Digest realm="r", nonce="n", qop="auth-int", algorithm=SHA-512-256-sess"#,
        );
        let header = auth.authorization(&Method::POST, "/upload", b"payload").unwrap();
        assert!(header.contains("qop=auth-int"));
        assert!(header.contains("algorithm=SHA-512-256-sess"));
        assert_eq!(response_param(&header).len(), 64);
    }

    #[test]
    fn apply_uses_request_target() {
        let mut auth = challenged("u", "p", RFC2617_CHALLENGE);
        let mut request = PreparedRequest::new(
            Method::GET,
            Url::parse("http://example.com/dir/index.html?x=1").unwrap(),
        );
        auth.apply(&mut request);
        let header = request.headers[AUTHORIZATION].to_str().unwrap();
        assert!(header.contains(r#"uri="/dir/index.html?x=1""#));
    }
}
