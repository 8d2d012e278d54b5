//! Authenticated request pipeline for the Bizdesk API
//!
//! Attaches the stored access credential to every request and recovers from
//! expired sessions: when the API answers 401, one refresh cycle runs no matter
//! how many requests fail at once, every parked request is replayed with the
//! new credential, and a failed refresh signs the session out.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod request;
pub mod transport;

pub use client::{DEFAULT_REQUEST_TIMEOUT, SessionClient, SessionClientBuilder};
pub use coordinator::{DEFAULT_REFRESH_TIMEOUT, RefreshCoordinator, RefreshOutcome};
pub use error::{Error, RefreshError, Result, TransportError};
pub use executor::{
    FnExecutor, FnNotifier, HttpRefreshExecutor, RefreshExecutor, UnauthorizedNotifier,
    executor_fn, notifier_fn,
};
pub use request::{RequestDescriptor, RequestInterceptor};
pub use transport::{ApiResponse, ReqwestTransport, Transport};
