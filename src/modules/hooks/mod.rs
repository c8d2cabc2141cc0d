//! Observer hooks for the request engine.
//!
//! Hooks run synchronously, in registration order, on the task driving the
//! event. A panicking hook is caught, logged and ignored.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;

use crate::core::{Request, Response};
use crate::modules::cookies::Cookie;

/// Decision returned by an on-queue hook.
#[derive(Debug, Clone)]
pub enum QueueAction {
    /// Queue the request unchanged.
    Keep,
    /// Queue these requests instead; an empty list drops the request.
    Replace(Vec<Request>),
}

pub type QueueHook = Arc<dyn Fn(&Request, bool) -> QueueAction + Send + Sync>;
pub type CompletionHook = Arc<dyn Fn(&Response) + Send + Sync>;
pub type NewCookiesHook = Arc<dyn Fn(&[Cookie], &Response) + Send + Sync>;
pub type AfterRunHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Queue,
    Complete,
    NewCookies,
    AfterRun,
    AfterRunPersistent,
    NotFoundVerdict,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::Queue => "on-queue",
            HookKind::Complete => "on-complete",
            HookKind::NewCookies => "on-new-cookies",
            HookKind::AfterRun => "after-run",
            HookKind::AfterRunPersistent => "after-run-persistent",
            HookKind::NotFoundVerdict => "custom-404 verdict",
        };
        f.write_str(name)
    }
}

/// A hook panicked. Logged and suppressed, never propagated.
#[derive(Debug, Clone, Error)]
#[error("{kind} hook failed: {message}")]
pub struct ObserverError {
    pub kind: HookKind,
    pub message: String,
}

/// Runs `f`, converting a panic into a logged [`ObserverError`].
pub fn guarded<T>(kind: HookKind, f: impl FnOnce() -> T) -> Result<T, ObserverError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let err = ObserverError {
            kind,
            message: panic_message(payload.as_ref()),
        };
        log::error!("{err}");
        err
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Table of registered hooks. Cloning is cheap (reference-counted entries),
/// which is what lets the engine snapshot it for `sandbox` and invoke hooks
/// without holding its state lock.
#[derive(Clone, Default)]
pub struct HookRegistry {
    on_queue: Vec<QueueHook>,
    on_complete: Vec<CompletionHook>,
    on_new_cookies: Vec<NewCookiesHook>,
    after_run: Vec<AfterRunHook>,
    after_run_persistent: Vec<AfterRunHook>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("on_queue", &self.on_queue.len())
            .field("on_complete", &self.on_complete.len())
            .field("on_new_cookies", &self.on_new_cookies.len())
            .field("after_run", &self.after_run.len())
            .field("after_run_persistent", &self.after_run_persistent.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_on_queue(&mut self, hook: QueueHook) {
        self.on_queue.push(hook);
    }

    pub fn add_on_complete(&mut self, hook: CompletionHook) {
        self.on_complete.push(hook);
    }

    pub fn add_on_new_cookies(&mut self, hook: NewCookiesHook) {
        self.on_new_cookies.push(hook);
    }

    pub fn add_after_run(&mut self, hook: AfterRunHook) {
        self.after_run.push(hook);
    }

    pub fn add_after_run_persistent(&mut self, hook: AfterRunHook) {
        self.after_run_persistent.push(hook);
    }

    pub fn len(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::Queue => self.on_queue.len(),
            HookKind::Complete => self.on_complete.len(),
            HookKind::NewCookies => self.on_new_cookies.len(),
            HookKind::AfterRun => self.after_run.len(),
            HookKind::AfterRunPersistent => self.after_run_persistent.len(),
            HookKind::NotFoundVerdict => 0,
        }
    }

    /// Removes the one-shot after-run hooks, returning them for invocation.
    pub fn take_after_run(&mut self) -> Vec<AfterRunHook> {
        std::mem::take(&mut self.after_run)
    }

    pub fn after_run_persistent(&self) -> Vec<AfterRunHook> {
        self.after_run_persistent.clone()
    }

    pub fn on_complete(&self) -> Vec<CompletionHook> {
        self.on_complete.clone()
    }

    pub fn on_new_cookies(&self) -> Vec<NewCookiesHook> {
        self.on_new_cookies.clone()
    }

    pub fn on_queue(&self) -> Vec<QueueHook> {
        self.on_queue.clone()
    }
}

/// Passes a request through the on-queue hooks in order. Each hook sees the
/// output of the previous one; a failing hook leaves its input untouched.
pub fn dispatch_queue(hooks: &[QueueHook], request: Request, asynchronous: bool) -> Vec<Request> {
    let mut requests = vec![request];
    for hook in hooks {
        let mut next = Vec::with_capacity(requests.len());
        for request in requests {
            match guarded(HookKind::Queue, || hook(&request, asynchronous)) {
                Ok(QueueAction::Replace(replacements)) => next.extend(replacements),
                Ok(QueueAction::Keep) | Err(_) => next.push(request),
            }
        }
        requests = next;
    }
    requests
}

pub fn dispatch_complete(hooks: &[CompletionHook], response: &Response) {
    for hook in hooks {
        let _ = guarded(HookKind::Complete, || hook(response));
    }
}

pub fn dispatch_new_cookies(hooks: &[NewCookiesHook], cookies: &[Cookie], response: &Response) {
    for hook in hooks {
        let _ = guarded(HookKind::NewCookies, || hook(cookies, response));
    }
}

pub fn dispatch_after_run(kind: HookKind, hooks: &[AfterRunHook]) {
    for hook in hooks {
        let _ = guarded(kind, || hook());
    }
}
