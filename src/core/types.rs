//! Core data structures shared by the dispatcher, the pools and the transport.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use super::transport::{TransportError, TransportResponse};

/// Identifier assigned to a request when it is submitted to the engine.
pub type RequestId = u64;

/// Default per-request timeout used when a request is built by hand.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50_000);

/// Fully prepared HTTP request as seen by the pools and the transport.
///
/// Cookies and default headers have already been folded into `headers` by the
/// time a request reaches the transport; `cookies` keeps the merged pairs for
/// inspection by hooks.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub cookies: Vec<(String, String)>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub asynchronous: bool,
    pub train: bool,
    pub update_cookies: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: 0,
            url,
            method,
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            cookies: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            follow_redirects: false,
            asynchronous: true,
            train: false,
            update_cookies: false,
        }
    }

    /// Id assigned at submission. Requests that never went through the
    /// engine report `0`.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    /// Marks the response for downstream HTML/link analysis.
    /// Marks the response as worth feeding back to the crawler.
    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn with_update_cookies(mut self, update: bool) -> Self {
        self.update_cookies = update;
        self
    }

    /// Looks up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Terminal outcome of a request. Immutable once built.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    start_transfer_time: Duration,
    total_time: Duration,
    error: Option<TransportError>,
    request: Arc<Request>,
}

impl Response {
    pub(crate) fn from_transport(request: Arc<Request>, payload: TransportResponse) -> Self {
        Self {
            status: payload.status,
            headers: payload.headers,
            body: payload.body,
            url: payload.url,
            start_transfer_time: payload.start_transfer_time,
            total_time: payload.total_time,
            error: None,
            request,
        }
    }

    pub(crate) fn failed(request: Arc<Request>, error: TransportError, elapsed: Duration) -> Self {
        Self {
            status: 0,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url: request.url.clone(),
            start_transfer_time: elapsed,
            total_time: elapsed,
            error: Some(error),
            request,
        }
    }

    /// HTTP status code, `0` when the transport failed.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, lossy.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Effective URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Time until the response headers arrived.
    pub fn start_transfer_time(&self) -> Duration {
        self.start_transfer_time
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.error, Some(TransportError::Timeout))
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }

    /// The request that produced this response.
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }
}
