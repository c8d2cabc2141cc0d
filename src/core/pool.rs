//! Request pools and the cancellation signal used by waves.
//!
//! A pool is only a pending FIFO plus a concurrency bound; the wave driver in
//! [`Engine`](crate::Engine) pulls from it and keeps at most
//! `max_concurrency` transport futures in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Notify, mpsc};

use super::transport::Transport;
use super::types::{Request, Response};
use crate::modules::hooks::CompletionHook;

/// A request waiting in a pool together with its per-request callbacks.
pub(crate) struct PendingRequest {
    pub request: Arc<Request>,
    pub callbacks: Vec<CompletionHook>,
    pub notifier: Option<mpsc::UnboundedSender<Arc<Response>>>,
}

/// Bounded pool with its own pending queue.
pub(crate) struct RequestPool {
    queue: Mutex<VecDeque<PendingRequest>>,
    max_concurrency: AtomicUsize,
}

impl RequestPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_concurrency: AtomicUsize::new(max_concurrency.max(1)),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, pending: PendingRequest) {
        self.queue().push_back(pending);
    }

    pub fn pop(&self) -> Option<PendingRequest> {
        self.queue().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Drops every pending request and reports how many were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::Acquire)
    }

    pub fn set_max_concurrency(&self, concurrency: usize) {
        self.max_concurrency
            .store(concurrency.max(1), Ordering::Release);
    }
}

/// Best-effort abort flag for the async wave.
#[derive(Default)]
pub(crate) struct AbortSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn triggered(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Runs a single request through the transport, turning failures into a
/// terminal response.
pub(crate) async fn execute(
    transport: Arc<dyn Transport>,
    pending: PendingRequest,
) -> (PendingRequest, Response) {
    let started = Instant::now();
    let response = match transport.perform(&pending.request).await {
        Ok(payload) => Response::from_transport(pending.request.clone(), payload),
        Err(err) => Response::failed(pending.request.clone(), err, started.elapsed()),
    };
    (pending, response)
}
