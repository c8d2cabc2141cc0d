//! Services plugged into the engine
//!
//! Hooks, cookie synchronization, statistics and soft-404 detection. Each
//! module is usable on its own; the engine only wires them together.

pub mod cookies;
pub mod hooks;
pub mod metrics;
pub mod not_found;

// Re-export commonly used types
pub use cookies::{Cookie, CookieJar, CookieStore};
pub use hooks::{
    AfterRunHook, CompletionHook, HookKind, HookRegistry, NewCookiesHook, ObserverError,
    QueueAction, QueueHook,
};
pub use metrics::Statistics;
pub use not_found::{FingerprintError, Lookup, NotFoundConfig, NotFoundDetector, Resolution};
