#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use probe_engine::{
    Engine, EngineConfig, Request, Transport, TransportError, TransportResponse,
};

type Responder = Box<dyn Fn(&Request) -> Result<TransportResponse, TransportError> + Send + Sync>;
type Delay = Box<dyn Fn(&Request) -> Duration + Send + Sync>;

/// Transport answering from a closure, recording every request and the
/// highest number of concurrent transfers it observed.
pub struct ScriptedTransport {
    responder: Responder,
    delay: Delay,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<Request>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Request) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: Box::new(|_: &Request| Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with `200 ok`.
    pub fn ok() -> Self {
        Self::new(|request: &Request| {
            Ok(TransportResponse::new(200, request.url.clone()).with_body("ok"))
        })
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_by(move |_: &Request| delay)
    }

    /// Per-request transfer time.
    pub fn with_delay_by<F>(mut self, delay: F) -> Self
    where
        F: Fn(&Request) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn perform(&self, request: &Request) -> Result<TransportResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = (self.delay)(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(request)
    }
}

pub fn seeded_config() -> EngineConfig {
    EngineConfig {
        url: Some("http://example.com/app/".into()),
        ..EngineConfig::default()
    }
}

pub fn engine(transport: &Arc<ScriptedTransport>, config: EngineConfig) -> Engine {
    Engine::with_transport(config, transport.clone()).unwrap()
}

/// Shared counter for hooks and callbacks.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
