//! Per-call request options recognised by the engine's request helpers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc;

use super::types::{RequestId, Response};
use crate::modules::hooks::CompletionHook;

/// Options accepted by [`Engine::request`](crate::Engine::request) and the
/// `get`/`post`/`trace`/`cookie`/`header` helpers.
#[derive(Clone)]
pub struct RequestOptions {
    pub params: Vec<(String, String)>,
    /// Explicit cookies, these win over jar cookies with the same name.
    pub cookies: Vec<(String, String)>,
    /// Explicit headers, these win over the engine's default headers.
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub asynchronous: bool,
    pub follow_redirects: bool,
    pub train: bool,
    pub update_cookies: bool,
    pub method: Option<Method>,
    pub body: Option<Bytes>,
    /// Skip the cookie jar lookup entirely.
    pub no_cookie_jar: bool,
    pub(crate) callbacks: Vec<CompletionHook>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            cookies: Vec::new(),
            headers: Vec::new(),
            timeout: None,
            asynchronous: true,
            follow_redirects: false,
            train: false,
            update_cookies: false,
            method: None,
            body: None,
            no_cookie_jar: false,
            callbacks: Vec::new(),
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("params", &self.params)
            .field("cookies", &self.cookies)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("asynchronous", &self.asynchronous)
            .field("follow_redirects", &self.follow_redirects)
            .field("train", &self.train)
            .field("update_cookies", &self.update_cookies)
            .field("method", &self.method)
            .field("no_cookie_jar", &self.no_cookie_jar)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        upsert(&mut self.params, name.into(), value.into());
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in params {
            upsert(&mut self.params, name.into(), value.into());
        }
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        upsert(&mut self.cookies, name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        upsert(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Route the request through the 1-wide sync pool; the submitting call
    /// blocks until it has completed.
    pub fn synchronous(mut self) -> Self {
        self.asynchronous = false;
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn train(mut self) -> Self {
        self.train = true;
        self
    }

    pub fn update_cookies(mut self) -> Self {
        self.update_cookies = true;
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn no_cookie_jar(mut self) -> Self {
        self.no_cookie_jar = true;
        self
    }

    /// Attach a completion callback, fired once per request produced by this
    /// submission (on-queue hooks may fan one submission out).
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }
}

/// Replace the value of an existing key, or append it.
pub(crate) fn upsert(pairs: &mut Vec<(String, String)>, name: String, value: String) {
    match pairs.iter_mut().find(|(key, _)| *key == name) {
        Some(entry) => entry.1 = value,
        None => pairs.push((name, value)),
    }
}

/// Handle returned for every submission.
///
/// Responses are delivered through a channel as the requests complete, so an
/// asynchronous submission only yields responses once a wave has run.
#[derive(Debug)]
pub struct RequestHandle {
    ids: Vec<RequestId>,
    responses: mpsc::UnboundedReceiver<Arc<Response>>,
}

impl RequestHandle {
    pub(crate) fn new(ids: Vec<RequestId>, responses: mpsc::UnboundedReceiver<Arc<Response>>) -> Self {
        Self { ids, responses }
    }

    /// Ids of the requests actually queued for this submission.
    pub fn ids(&self) -> &[RequestId] {
        &self.ids
    }

    /// `true` when on-queue hooks discarded every request.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Wait for the next response. Returns `None` once every request of the
    /// submission has completed or was dropped by an abort.
    pub async fn next_response(&mut self) -> Option<Arc<Response>> {
        self.responses.recv().await
    }

    /// Non-blocking variant of [`next_response`](Self::next_response).
    pub fn try_next_response(&mut self) -> Option<Arc<Response>> {
        self.responses.try_recv().ok()
    }
}
