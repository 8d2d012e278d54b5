//! Admin API for the session credentials
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is never exposed
//! alongside the forwarding port.
//!
//! Endpoints:
//! - GET    /admin/session  presence of each credential, never the values
//! - PUT    /admin/session  install a `{"token","refreshToken"}` pair
//! - DELETE /admin/session  clear both credentials and sign out

use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use session_auth::{TokenPair, TokenResponse};
use tracing::warn;

use crate::session::SessionState;

/// Build the admin axum router.
pub fn build_admin_router(state: SessionState) -> Router {
    Router::new()
        .route(
            "/admin/session",
            get(session_status).put(install_session).delete(clear_session),
        )
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

async fn session_status(State(state): State<SessionState>) -> impl IntoResponse {
    let status = state.status().await;
    json(StatusCode::OK, serde_json::json!(status))
}

/// PUT /admin/session: replace the stored pair and clear any sign-out.
async fn install_session(
    State(state): State<SessionState>,
    body: Result<axum::Json<TokenResponse>, JsonRejection>,
) -> impl IntoResponse {
    let axum::Json(tokens) = match body {
        Ok(body) => body,
        Err(e) => {
            return json(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": format!("invalid session body: {}", e.body_text()) }),
            );
        }
    };

    let pair = TokenPair::from(tokens);
    if pair.access.is_blank() || pair.refresh.is_blank() {
        return json(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "token and refreshToken must be non-empty" }),
        );
    }

    if let Err(e) = state.sign_in(&pair).await {
        warn!(error = %e, "failed to store session credentials");
        return json(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("failed to store credentials: {e}") }),
        );
    }

    let status = state.status().await;
    json(StatusCode::OK, serde_json::json!(status))
}

/// DELETE /admin/session: wipe both credentials.
async fn clear_session(State(state): State<SessionState>) -> impl IntoResponse {
    match state.sign_out().await {
        Ok(()) => json(StatusCode::OK, serde_json::json!({ "cleared": true })),
        Err(e) => {
            warn!(error = %e, "failed to clear session credentials");
            json(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": format!("failed to clear credentials: {e}") }),
            )
        }
    }
}
