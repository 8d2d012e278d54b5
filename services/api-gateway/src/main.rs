//! Bizdesk API gateway
//!
//! Local sidecar that:
//! 1. Loads the session credentials (credential file and/or env seed)
//! 2. Forwards every business API call through `SessionClient`, which attaches
//!    the access credential and recovers from expired sessions
//! 3. Serves `/health` and `/metrics` next to the forwarding routes
//! 4. Serves the session admin API on its own listener

mod admin;
mod config;
mod metrics;
mod proxy;
mod session;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::{CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenPair};
use session_client::SessionClient;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, SessionConfig};
use crate::proxy::ProxyState;
use crate::session::SessionState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    session: SessionState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(client: SessionClient, session: SessionState, prometheus: PrometheusHandle) -> Self {
        Self {
            proxy: ProxyState {
                client: Arc::new(client),
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
            },
            session,
            started_at: Instant::now(),
            prometheus,
        }
    }
}

/// Build the forwarding router.
///
/// `max_connections` caps concurrently handled requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Open the configured store and apply the env seed, if any.
async fn open_store(session: &SessionConfig) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match &session.credential_file {
        Some(path) => {
            let store = FileCredentialStore::load(path.clone())
                .await
                .with_context(|| format!("failed to open credential file {}", path.display()))?;
            info!(path = %path.display(), "using credential file");
            Arc::new(store)
        }
        None => {
            warn!("no credential_file configured, session will not survive a restart");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    if let Some(seed) = &session.seed {
        let pair = TokenPair {
            access: seed.access.clone(),
            refresh: seed.refresh.clone(),
        };
        session_auth::persist_pair(store.as_ref(), &pair)
            .await
            .context("failed to seed session credentials from environment")?;
        info!("session credentials seeded from environment");
    }

    Ok(store)
}

fn build_client(
    config: &Config,
    store: Arc<dyn CredentialStore>,
    session: &SessionState,
) -> SessionClient {
    SessionClient::builder(config.api.base_url.clone())
        .refresh_path(config.api.refresh_path.clone())
        .request_timeout(config.api.timeout())
        .refresh_timeout(config.api.refresh_timeout())
        .credential_store(store)
        .http_refresh_executor()
        .unauthorized_notifier(session.notifier())
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL, then RUST_LOG, then info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting bizdesk-api-gateway");

    // Install before anything records
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        admin_listen_addr = %config.gateway.admin_listen_addr,
        base_url = %config.api.base_url,
        refresh_path = %config.api.refresh_path,
        "configuration loaded"
    );

    let store = open_store(&config.session).await?;
    let session = SessionState::new(store.clone());
    if !session.is_active().await {
        warn!("no session credentials stored, install them via PUT /admin/session");
    }

    let client = build_client(&config, store, &session);
    let app = build_router(
        AppState::new(client, session.clone(), prometheus_handle),
        config.gateway.max_connections,
    );
    let admin_app = admin::build_admin_router(session);

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;
    let admin_listener = TcpListener::bind(config.gateway.admin_listen_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind admin listener to {}",
                config.gateway.admin_listen_addr
            )
        })?;

    info!(
        addr = %config.gateway.listen_addr,
        admin_addr = %config.gateway.admin_listen_addr,
        "accepting requests"
    );

    // Drain timer starts at signal receipt, not at startup.
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server_handle = tokio::spawn(serve(listener, app, shutdown_rx.clone()));
    let admin_handle = tokio::spawn(serve(admin_listener, admin_app, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, async {
        tokio::join!(server_handle, admin_handle)
    })
    .await
    {
        Ok((gateway, admin)) => {
            report_server_exit("gateway", gateway);
            report_server_exit("admin", admin);
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

fn report_server_exit(
    name: &str,
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => info!(server = name, "all in-flight requests drained"),
        Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
        Err(e) => error!(server = name, error = %e, "server task panicked"),
    }
}

/// 200 while a session is active, 503 once signed out.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.proxy.requests_total.load(Ordering::Relaxed);
    let errors = state.proxy.errors_total.load(Ordering::Relaxed);

    let (status_code, status, session) = if state.session.is_active().await {
        (StatusCode::OK, "healthy", "active")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "signed_out")
    };

    let body = serde_json::json!({
        "status": status,
        "session": session,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Forwards everything that is not `/health` or `/metrics`.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use session_auth::ACCESS_TOKEN_KEY;
    use std::sync::atomic::AtomicUsize;
    use tower::ServiceExt;

    /// Render handle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    struct MockUpstream {
        url: String,
        refresh_calls: Arc<AtomicUsize>,
    }

    /// Business API stand-in.
    ///
    /// Data routes accept `Bearer at_valid` or `Bearer at_fresh` and echo the
    /// request; `/missing` answers 404. `POST /auth/refresh` trades `rt_valid`
    /// for `at_fresh` and rejects anything else.
    async fn start_mock_upstream() -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let refresh_calls = Arc::new(AtomicUsize::new(0));

        let counter = refresh_calls.clone();
        let app = Router::new()
            .route(
                "/auth/refresh",
                post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if body["refreshToken"] == "rt_valid" {
                            (
                                StatusCode::OK,
                                axum::Json(serde_json::json!({
                                    "token": "at_fresh",
                                    "refreshToken": "rt_next",
                                })),
                            )
                        } else {
                            (
                                StatusCode::UNAUTHORIZED,
                                axum::Json(serde_json::json!({"message": "revoked"})),
                            )
                        }
                    }
                }),
            )
            .fallback(|request: Request<Body>| async move {
                let authorization = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if authorization != "Bearer at_valid" && authorization != "Bearer at_fresh" {
                    return (
                        StatusCode::UNAUTHORIZED,
                        [("x-upstream", "true")],
                        axum::Json(serde_json::json!({"message": "expired"})),
                    );
                }

                let status = if request.uri().path() == "/missing" {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::OK
                };
                let mut headers = serde_json::Map::new();
                for (name, value) in request.headers() {
                    headers.insert(
                        name.to_string(),
                        serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                    );
                }
                let method = request.method().to_string();
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or("").to_string();
                let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                    .await
                    .unwrap();
                (
                    status,
                    [("x-upstream", "true")],
                    axum::Json(serde_json::json!({
                        "echoed_headers": headers,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": String::from_utf8_lossy(&body),
                    })),
                )
            });

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockUpstream {
            url: format!("http://{addr}"),
            refresh_calls,
        }
    }

    fn test_app_state(base_url: &str, store: Arc<dyn CredentialStore>) -> AppState {
        let session = SessionState::new(store.clone());
        let client = SessionClient::builder(base_url)
            .credential_store(store)
            .http_refresh_executor()
            .unauthorized_notifier(session.notifier())
            .request_timeout(Duration::from_secs(5))
            .build();
        AppState::new(client, session, test_prometheus_handle())
    }

    fn seeded(access: &str, refresh: &str) -> Arc<dyn CredentialStore> {
        Arc::new(MemoryCredentialStore::with_pair(access, refresh))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_active_session() {
        let state = test_app_state("http://unused", seeded("at_valid", "rt_valid"));
        state.proxy.requests_total.fetch_add(5, Ordering::Relaxed);

        let response = build_router(state, 1000)
            .oneshot(get_request("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["session"], "active");
        assert_eq!(json["requests_served"], 5);
        assert_eq!(json["errors_total"], 0);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_without_session_returns_503() {
        let state = test_app_state("http://unused", Arc::new(MemoryCredentialStore::new()));
        let response = build_router(state, 1000)
            .oneshot(get_request("/health"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["session"], "signed_out");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state("http://unused", seeded("at_valid", "rt_valid"));
        let response = build_router(state, 1000)
            .oneshot(get_request("/metrics"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn proxy_attaches_session_credential_and_forwards() {
        let upstream = start_mock_upstream().await;
        let state = test_app_state(&upstream.url, seeded("at_valid", "rt_valid"));

        let response = build_router(state, 1000)
            .oneshot(
                Request::builder()
                    .uri("/invoices?page=2")
                    .method("POST")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer caller-supplied")
                    .header("connection", "keep-alive")
                    .header("x-tenant", "acme")
                    .body(Body::from(r#"{"total":42}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "true");
        let json = body_json(response).await;
        assert_eq!(json["echoed_headers"]["authorization"], "Bearer at_valid");
        assert_eq!(json["echoed_headers"]["x-tenant"], "acme");
        assert!(json["echoed_headers"].get("connection").is_none());
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/invoices");
        assert_eq!(json["query"], "page=2");
        assert_eq!(json["body"], r#"{"total":42}"#);
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn proxy_returns_upstream_errors_verbatim() {
        let upstream = start_mock_upstream().await;
        let state = test_app_state(&upstream.url, seeded("at_valid", "rt_valid"));

        let response = build_router(state, 1000)
            .oneshot(get_request("/missing"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["path"], "/missing");
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_transparently() {
        let upstream = start_mock_upstream().await;
        let store = seeded("at_stale", "rt_valid");
        let state = test_app_state(&upstream.url, store.clone());
        let app = build_router(state, 1000);

        let response = app.clone().oneshot(get_request("/clients")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["echoed_headers"]["authorization"], "Bearer at_fresh");
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap().expose(),
            "at_fresh"
        );

        let health = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failed_refresh_returns_401_and_signs_out() {
        let upstream = start_mock_upstream().await;
        let store = seeded("at_stale", "rt_revoked");
        let state = test_app_state(&upstream.url, store.clone());
        let app = build_router(state, 1000);

        let response = app.clone().oneshot(get_request("/clients")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "session_expired");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert!(store.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());

        let health = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(health).await;
        assert_eq!(json["session"], "signed_out");
        assert_eq!(json["errors_total"], 1);
    }

    #[tokio::test]
    async fn proxy_returns_502_for_dead_upstream() {
        let state = test_app_state("http://127.0.0.1:1", seeded("at_valid", "rt_valid"));
        let response = build_router(state, 1000)
            .oneshot(get_request("/fail"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
        assert!(json["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn open_store_applies_env_seed_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = SessionConfig {
            credential_file: Some(path.clone()),
            seed: Some(config::SessionSeed {
                access: "at_seed".into(),
                refresh: "rt_seed".into(),
            }),
        };

        let store = open_store(&session).await.unwrap();
        assert_eq!(
            store.get(ACCESS_TOKEN_KEY).await.unwrap().unwrap().expose(),
            "at_seed"
        );
        assert!(path.exists());
    }

    #[tokio::test]
    async fn open_store_without_file_is_in_memory() {
        let store = open_store(&SessionConfig::default()).await.unwrap();
        assert!(store.get(ACCESS_TOKEN_KEY).await.unwrap().is_none());
    }
}
