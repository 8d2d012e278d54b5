//! Refresh executor and unauthorized notifier strategies
//!
//! Both are injected when the client is built. The executor mints a new
//! credential pair; the notifier is told when the session is unrecoverable so
//! the host can sign the user out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use session_auth::{CredentialStore, REFRESH_TOKEN_KEY, TokenPair};
use tracing::debug;

use crate::error::RefreshError;

/// Boxed future returned by `RefreshExecutor::refresh`.
pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TokenPair, RefreshError>> + Send + 'a>>;

/// Exchanges the refresh credential for a new access/refresh pair.
pub trait RefreshExecutor: Send + Sync {
    fn refresh(&self) -> RefreshFuture<'_>;
}

/// Told when authorization fails for good (refresh failed, or a replayed
/// request was rejected again).
pub trait UnauthorizedNotifier: Send + Sync {
    fn notify(&self);
}

/// Default executor: `POST` the stored refresh credential to the refresh
/// endpoint.
///
/// Talks to `reqwest` directly so the exchange never re-enters the
/// authenticated pipeline.
pub struct HttpRefreshExecutor {
    client: reqwest::Client,
    url: String,
    store: Arc<dyn CredentialStore>,
}

impl HttpRefreshExecutor {
    pub fn new(client: reqwest::Client, url: String, store: Arc<dyn CredentialStore>) -> Self {
        Self { client, url, store }
    }
}

impl RefreshExecutor for HttpRefreshExecutor {
    fn refresh(&self) -> RefreshFuture<'_> {
        Box::pin(async move {
            let refresh = self
                .store
                .get(REFRESH_TOKEN_KEY)
                .await?
                .filter(|token| !token.is_blank())
                .ok_or(RefreshError::MissingCredential)?;

            debug!(url = %self.url, "exchanging refresh credential");
            let pair = session_auth::refresh_session(&self.client, &self.url, refresh.expose())
                .await
                .map_err(|e| RefreshError::Executor(e.to_string()))?;
            Ok(pair)
        })
    }
}

/// Adapter turning an async closure into a `RefreshExecutor`.
pub struct FnExecutor<F>(F);

/// Wrap `f` as a refresh executor.
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<TokenPair, RefreshError>> + Send + 'static,
{
    FnExecutor(f)
}

impl<F, Fut> RefreshExecutor for FnExecutor<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<TokenPair, RefreshError>> + Send + 'static,
{
    fn refresh(&self) -> RefreshFuture<'_> {
        Box::pin((self.0)())
    }
}

/// Adapter turning a closure into an `UnauthorizedNotifier`.
pub struct FnNotifier<F>(F);

/// Wrap `f` as an unauthorized notifier.
pub fn notifier_fn<F>(f: F) -> FnNotifier<F>
where
    F: Fn() + Send + Sync,
{
    FnNotifier(f)
}

impl<F> UnauthorizedNotifier for FnNotifier<F>
where
    F: Fn() + Send + Sync,
{
    fn notify(&self) {
        (self.0)()
    }
}
