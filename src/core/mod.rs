//! Core request plumbing shared by the dispatcher and the transport.

pub mod options;
pub(crate) mod pool;
pub mod reqwest_transport;
pub mod transport;
pub mod types;

pub use options::{RequestHandle, RequestOptions};
pub use reqwest_transport::ReqwestTransport;
pub use transport::{Transport, TransportError, TransportResponse};
pub use types::{DEFAULT_TIMEOUT, Request, RequestId, Response};
