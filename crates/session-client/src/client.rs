//! Authenticated API client
//!
//! `SessionClient` is the only surface business code sees. A request flows:
//!
//! 1. `RequestInterceptor` normalizes the URL and attaches the stored credential
//! 2. `Transport` sends it
//! 3. any status other than 401, and anything from the refresh endpoint, is
//!    returned untouched
//! 4. a first 401 marks the request as retried and joins (or starts) the
//!    coordinator's refresh cycle, then replays once with the new credential
//! 5. a 401 on a request already retried is terminal
//!
//! Transport failures never enter the refresh path.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use session_auth::{CredentialStore, DEFAULT_REFRESH_PATH, MemoryCredentialStore};
use tracing::{debug, instrument, warn};

use crate::coordinator::{DEFAULT_REFRESH_TIMEOUT, RefreshCoordinator};
use crate::error::{Error, Result};
use crate::executor::{HttpRefreshExecutor, RefreshExecutor, UnauthorizedNotifier};
use crate::request::{RequestDescriptor, RequestInterceptor, authorize, join_url};
use crate::transport::{ApiResponse, ReqwestTransport, Transport};

/// Default per-request timeout for the built-in transport.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SessionClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    interceptor: RequestInterceptor,
    coordinator: RefreshCoordinator,
}

impl SessionClient {
    pub fn builder(base_url: impl Into<String>) -> SessionClientBuilder {
        SessionClientBuilder::new(base_url.into())
    }

    /// Send `method path` with optional extra headers and body.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<Bytes>,
    ) -> Result<ApiResponse> {
        let mut request = RequestDescriptor::new(method, join_url(&self.base_url, path));
        if let Some(headers) = headers {
            request = request.with_headers(headers);
        }
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::GET, path, None, None).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::DELETE, path, None, None).await
    }

    pub async fn post(&self, path: &str, body: impl Into<Bytes>) -> Result<ApiResponse> {
        self.request(Method::POST, path, None, Some(body.into()))
            .await
    }

    pub async fn put(&self, path: &str, body: impl Into<Bytes>) -> Result<ApiResponse> {
        self.request(Method::PUT, path, None, Some(body.into()))
            .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse> {
        self.json_request(Method::POST, path, body).await
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse> {
        self.json_request(Method::PUT, path, body).await
    }

    async fn json_request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse> {
        let body = serde_json::to_vec(body)
            .map_err(|e| Error::InvalidRequest(format!("serializing request body: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.request(method, path, Some(headers), Some(Bytes::from(body)))
            .await
    }

    /// Run a prepared descriptor through the full pipeline.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    pub async fn send(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        let request = self.interceptor.prepare(request).await;
        let response = self.transport.send(request.clone()).await?;
        self.handle_response(request, response).await
    }

    async fn handle_response(
        &self,
        mut request: RequestDescriptor,
        response: ApiResponse,
    ) -> Result<ApiResponse> {
        if response.status() != StatusCode::UNAUTHORIZED
            || self.interceptor.is_refresh_request(&request.url)
        {
            return Ok(response);
        }

        if request.retried {
            return Err(self.terminal_unauthorized());
        }

        request.retried = true;
        let access = self.coordinator.refresh().await?;
        authorize(&mut request.headers, &access)
            .map_err(|e| Error::InvalidRequest(format!("refreshed credential: {e}")))?;

        debug!("replaying request with refreshed credential");
        let replay = self.transport.send(request).await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            return Err(self.terminal_unauthorized());
        }
        Ok(replay)
    }

    fn terminal_unauthorized(&self) -> Error {
        warn!("request rejected again after refresh, giving up");
        self.coordinator.notify_unauthorized();
        Error::Unauthorized
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential_store(&self) -> &Arc<dyn CredentialStore> {
        self.interceptor.store()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }
}

enum ExecutorChoice {
    None,
    Http,
    Custom(Arc<dyn RefreshExecutor>),
}

/// Builder wiring the store, transport and strategies into a `SessionClient`.
pub struct SessionClientBuilder {
    base_url: String,
    refresh_path: String,
    http_client: Option<reqwest::Client>,
    request_timeout: Duration,
    refresh_timeout: Duration,
    store: Option<Arc<dyn CredentialStore>>,
    transport: Option<Arc<dyn Transport>>,
    executor: ExecutorChoice,
    notifier: Option<Arc<dyn UnauthorizedNotifier>>,
}

impl SessionClientBuilder {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            http_client: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            store: None,
            transport: None,
            executor: ExecutorChoice::None,
            notifier: None,
        }
    }

    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn refresh_executor(mut self, executor: impl RefreshExecutor + 'static) -> Self {
        self.executor = ExecutorChoice::Custom(Arc::new(executor));
        self
    }

    /// Use `HttpRefreshExecutor` against `{base_url}{refresh_path}`.
    pub fn http_refresh_executor(mut self) -> Self {
        self.executor = ExecutorChoice::Http;
        self
    }

    pub fn unauthorized_notifier(mut self, notifier: impl UnauthorizedNotifier + 'static) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn build(self) -> SessionClient {
        let http_client = self.http_client.unwrap_or_default();
        let store: Arc<dyn CredentialStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                http_client.clone(),
                self.request_timeout,
            )),
        };
        let refresh_url = join_url(&self.base_url, &self.refresh_path);

        let executor: Option<Arc<dyn RefreshExecutor>> = match self.executor {
            ExecutorChoice::None => None,
            ExecutorChoice::Http => Some(Arc::new(HttpRefreshExecutor::new(
                http_client,
                refresh_url.clone(),
                store.clone(),
            ))),
            ExecutorChoice::Custom(executor) => Some(executor),
        };

        SessionClient {
            interceptor: RequestInterceptor::new(store.clone(), &refresh_url),
            coordinator: RefreshCoordinator::new(
                store,
                executor,
                self.notifier,
                self.refresh_timeout,
            ),
            transport,
            base_url: self.base_url,
        }
    }
}
