//! # probe-engine
//!
//! The HTTP request engine of a web security scanner: bounded-concurrency
//! request waves, an exclusive synchronous lane, observer hooks, cookie
//! synchronization and soft-404 fingerprinting.
//!
//! ## Features
//!
//! - Async pool drained in waves, refilled as requests fan out mid-wave
//! - 1-wide sync pool for requests that must complete before continuing
//! - Emergency drain once too many requests pile up
//! - On-queue, on-complete, on-new-cookies and after-run hooks
//! - Cookie jar synchronized from `Set-Cookie` headers
//! - Custom 404 detection through random-resource probing
//! - `sandbox` to run throwaway work without leaking hooks or cookies
//!
//! ## Example
//!
//! ```no_run
//! use probe_engine::{Engine, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::builder()
//!         .with_url("https://example.com/")
//!         .with_max_concurrency(10)
//!         .build()?;
//!
//!     engine
//!         .get("https://example.com/admin/", RequestOptions::new().on_complete(|res| {
//!             println!("{} -> {}", res.url(), res.status());
//!         }))
//!         .await?;
//!     engine.run().await;
//!
//!     println!("{} responses", engine.response_count());
//!     Ok(())
//! }
//! ```

mod engine;

pub mod config;
pub mod core;
pub mod modules;

pub use crate::engine::{Engine, EngineBuilder, EngineError, EngineResult};

pub use crate::config::{ConfigError, EngineConfig, ProxyKind, ProxySettings};

pub use crate::core::{
    DEFAULT_TIMEOUT,
    Request,
    RequestHandle,
    RequestId,
    RequestOptions,
    ReqwestTransport,
    Response,
    Transport,
    TransportError,
    TransportResponse,
};

pub use crate::modules::{
    Cookie,
    CookieJar,
    CookieStore,
    FingerprintError,
    HookKind,
    NotFoundConfig,
    NotFoundDetector,
    ObserverError,
    QueueAction,
    Statistics,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
