//! Transport abstraction.
//!
//! The dispatcher never talks to a concrete HTTP client; it hands prepared
//! [`Request`]s to a [`Transport`] and turns the outcome into a terminal
//! [`Response`](super::Response). Swapping the transport does not change any
//! engine contract.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use super::types::Request;

/// Contract implemented by the underlying asynchronous transport.
///
/// Implementations must honour `request.timeout` and
/// `request.follow_redirects`, and must be safe to call concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn perform(&self, request: &Request) -> Result<TransportResponse, TransportError>;
}

/// Raw response produced by a transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
    pub start_transfer_time: Duration,
    pub total_time: Duration,
}

impl TransportResponse {
    pub fn new(status: u16, url: Url) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url,
            start_transfer_time: Duration::ZERO,
            total_time: Duration::ZERO,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_timing(mut self, start_transfer_time: Duration, total_time: Duration) -> Self {
        self.start_transfer_time = start_transfer_time;
        self.total_time = total_time;
        self
    }
}

/// Per-request transport failure. Never fatal to the surrounding wave.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("redirect handling failed: {0}")]
    Redirect(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("http transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_redirect() {
            TransportError::Redirect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}
