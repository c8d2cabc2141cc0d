//! Cookie synchronization.
//!
//! The engine only relies on the [`CookieStore`] contract (`update` and
//! `for_url`); [`CookieJar`] is a small in-memory store keyed by
//! `(domain, path, name)` that satisfies it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cookie::Cookie as RawCookie;
use http::header::SET_COOKIE;
use serde::{Deserialize, Serialize};
use url::Url;
use url::form_urlencoded::byte_serialize;

use crate::core::Response;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// `None` matches every host.
    pub domain: Option<String>,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: "/".to_string(),
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into().trim_start_matches('.').to_ascii_lowercase());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|at| at <= Utc::now())
    }

    /// Domain, path, scheme and expiry match against `url`.
    pub fn matches(&self, url: &Url) -> bool {
        if self.is_expired() {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        if let Some(ref domain) = self.domain {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            if host != *domain && !host.ends_with(&format!(".{domain}")) {
                return false;
            }
        }
        path_matches(&self.path, url.path())
    }

    /// Parses a single `Set-Cookie` header value received from `url`.
    /// Max-Age takes precedence over Expires.
    pub fn parse_set_cookie(header: &str, url: &Url) -> Option<Cookie> {
        let parsed = RawCookie::parse(header).ok()?;

        let mut cookie = Cookie::new(parsed.name(), parsed.value_trimmed());
        cookie.path = match parsed.path() {
            Some(path) if path.starts_with('/') => path.to_string(),
            _ => default_path(url),
        };
        match parsed.domain().filter(|domain| !domain.is_empty()) {
            Some(domain) => cookie = cookie.with_domain(domain),
            None => {
                if let Some(host) = url.host_str() {
                    cookie = cookie.with_domain(host);
                }
            }
        }
        cookie.secure = parsed.secure().unwrap_or(false);
        cookie.http_only = parsed.http_only().unwrap_or(false);

        cookie.expires = match parsed.max_age() {
            Some(max_age) => ChronoDuration::try_seconds(max_age.whole_seconds())
                .and_then(|delta| Utc::now().checked_add_signed(delta)),
            None => parsed
                .expires_datetime()
                .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
        };

        Some(cookie)
    }

    /// Parses a `name=value; other=value` string, as used for seed cookies.
    pub fn parse_cookie_string(input: &str) -> Vec<Cookie> {
        input
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| Cookie::new(name, value.trim()))
            })
            .collect()
    }

    /// Extracts every cookie set by a response.
    pub fn from_response(response: &Response) -> Vec<Cookie> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| Cookie::parse_set_cookie(value, response.url()))
            .collect()
    }

    fn key(&self) -> CookieKey {
        (
            self.domain.clone().unwrap_or_default(),
            self.path.clone(),
            self.name.clone(),
        )
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", encode_component(&self.name), encode_component(&self.value))
    }
}

fn default_path(url: &Url) -> String {
    match url.path().rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => "/".to_string(),
    }
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

type CookieKey = (String, String, String);

/// Contract the engine needs from a cookie jar.
pub trait CookieStore: Send + Sync {
    /// Merges cookies, later entries win for the same `(domain, path, name)`.
    /// Expired cookies remove their key.
    fn update(&mut self, cookies: &[Cookie]);

    /// Cookies that should be sent to `url`.
    fn for_url(&self, url: &Url) -> Vec<Cookie>;

    fn cookies(&self) -> Vec<Cookie>;

    /// Owned copy used to snapshot engine state.
    fn snapshot(&self) -> Box<dyn CookieStore>;
}

/// In-memory cookie jar.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    entries: BTreeMap<CookieKey, Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CookieStore for CookieJar {
    fn update(&mut self, cookies: &[Cookie]) {
        for cookie in cookies {
            if cookie.is_expired() {
                self.entries.remove(&cookie.key());
            } else {
                self.entries.insert(cookie.key(), cookie.clone());
            }
        }
    }

    fn for_url(&self, url: &Url) -> Vec<Cookie> {
        self.entries
            .values()
            .filter(|cookie| cookie.matches(url))
            .cloned()
            .collect()
    }

    fn cookies(&self) -> Vec<Cookie> {
        self.entries.values().cloned().collect()
    }

    fn snapshot(&self) -> Box<dyn CookieStore> {
        Box::new(self.clone())
    }
}

/// Form-encodes a cookie name or value so it cannot break a `Cookie` header.
pub fn encode_component(input: &str) -> String {
    byte_serialize(input.as_bytes()).collect()
}

/// Serializes cookie pairs into a `Cookie` header value. Empty input yields an
/// empty string, which callers treat as "omit the header".
pub fn cookie_header(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", encode_component(name), encode_component(value)))
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(input: &str) -> Url {
        Url::parse(input).unwrap()
    }

    #[test]
    fn merging_the_same_cookies_twice_is_idempotent() {
        let cookies = vec![
            Cookie::new("session", "abc").with_domain("example.com"),
            Cookie::new("theme", "dark").with_domain("example.com"),
        ];

        let mut once = CookieJar::new();
        once.update(&cookies);
        let mut twice = CookieJar::new();
        twice.update(&cookies);
        twice.update(&cookies);

        assert_eq!(once.cookies(), twice.cookies());
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn later_cookie_wins_within_one_update() {
        let mut jar = CookieJar::new();
        jar.update(&[
            Cookie::new("session", "old").with_domain("example.com"),
            Cookie::new("session", "new").with_domain("example.com"),
        ]);
        let cookies = jar.for_url(&url("http://example.com/"));
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].value, "new");
    }

    #[test]
    fn expired_cookie_removes_entry() {
        let mut jar = CookieJar::new();
        jar.update(&[Cookie::new("session", "abc").with_domain("example.com")]);
        jar.update(&[Cookie::new("session", "")
            .with_domain("example.com")
            .with_expires(Utc::now() - ChronoDuration::seconds(10))]);
        assert!(jar.is_empty());
    }

    #[test]
    fn matches_subdomains_and_paths() {
        let cookie = Cookie::new("a", "1").with_domain(".example.com").with_path("/app");
        assert!(cookie.matches(&url("http://www.example.com/app/page")));
        assert!(cookie.matches(&url("http://example.com/app")));
        assert!(!cookie.matches(&url("http://example.com/application")));
        assert!(!cookie.matches(&url("http://other.com/app")));
    }

    #[test]
    fn parses_set_cookie_attributes() {
        let cookie = Cookie::parse_set_cookie(
            "sid=xyz; Path=/; Domain=.example.com; Secure; HttpOnly; Max-Age=3600",
            &url("https://login.example.com/auth/start"),
        )
        .unwrap();

        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "xyz");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path, "/");
        assert!(cookie.secure && cookie.http_only);
        assert!(!cookie.is_expired());
    }

    #[test]
    fn netscape_expiry_in_the_past_deletes_the_cookie() {
        let target = url("http://example.com/account");
        let mut jar = CookieJar::new();
        jar.update(&[Cookie::parse_set_cookie("sid=live; path=/", &target).unwrap()]);
        assert_eq!(jar.len(), 1);

        let gone = Cookie::parse_set_cookie(
            "sid=gone; expires=Thu, 01-Jan-1970 00:00:01 GMT; path=/",
            &target,
        )
        .unwrap();
        assert!(gone.expires.is_some());
        assert!(gone.is_expired());

        jar.update(&[gone]);
        assert!(jar.is_empty());
    }

    #[test]
    fn max_age_wins_over_expires() {
        let cookie = Cookie::parse_set_cookie(
            "sid=xyz; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Max-Age=600",
            &url("http://example.com/"),
        )
        .unwrap();
        assert!(!cookie.is_expired());

        let cookie =
            Cookie::parse_set_cookie("sid=xyz; Max-Age=0", &url("http://example.com/")).unwrap();
        assert!(cookie.is_expired());
    }

    #[test]
    fn malformed_set_cookie_is_skipped() {
        let target = url("http://example.com/");
        assert!(Cookie::parse_set_cookie("no-pair-here", &target).is_none());
        assert!(Cookie::parse_set_cookie("=orphan", &target).is_none());
    }

    #[test]
    fn set_cookie_defaults_to_request_directory() {
        let cookie =
            Cookie::parse_set_cookie("a=1", &url("http://example.com/shop/cart.php")).unwrap();
        assert_eq!(cookie.path, "/shop");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
    }

    #[test]
    fn header_encodes_reserved_characters() {
        let header = cookie_header(&[
            ("session".into(), "abc".into()),
            ("odd name".into(), "a;b=c%".into()),
        ]);
        assert_eq!(header, "session=abc;odd+name=a%3Bb%3Dc%25");
        assert_eq!(cookie_header(&[]), "");
    }

    #[test]
    fn parses_cookie_strings() {
        let cookies = Cookie::parse_cookie_string("a=1; b = 2 ;broken; =x");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[1].name, "b");
        assert_eq!(cookies[1].value, "2");
    }
}
