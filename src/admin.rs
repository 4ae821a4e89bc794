//! Admin/operational HTTP surface (C10, `http-surfaces` feature): health
//! check, stats reporting, and manual cache control for operators who'd
//! rather curl an endpoint than redeploy.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::client::Client;
use crate::config::FlagrOptions;
use crate::webhook::{self, WebhookState};

/// Builds the admin/health routes per `options`, then merges in the webhook
/// receiver when `options.webhook_enabled`. `/health` is always mounted; the
/// rest of the admin surface and the webhook receiver are each individually
/// gated, since a host may want liveness probing without exposing control
/// endpoints. This crate never binds a port — the caller serves the
/// returned `Router` itself.
pub fn router(state: WebhookState, options: &FlagrOptions) -> Router {
    let mut router = Router::new().route("/health", get(health));

    if options.admin_enabled {
        let prefix = options.admin_path.trim_end_matches('/');
        router = router
            .route(&format!("{prefix}/stats"), get(stats))
            .route(&format!("{prefix}/refresh"), post(refresh))
            .route(&format!("{prefix}/invalidate"), post(invalidate))
            .route(&format!("{prefix}/invalidate-all"), post(invalidate_all));
    }

    if options.webhook_enabled {
        router = router.merge(webhook::router(state.clone(), &options.webhook_path));
    }

    router.with_state(state)
}

fn ok_body() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Plain liveness probe — does not touch the client, just confirms the
/// process is serving requests. Use `/admin/stats` for backend health.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, ok_body())
}

async fn stats(State(state): State<WebhookState>) -> impl IntoResponse {
    Json(state.client.get_stats().await)
}

#[instrument(skip(state))]
async fn refresh(State(state): State<WebhookState>) -> impl IntoResponse {
    match state.client.refresh_flags().await {
        Ok(()) => (StatusCode::OK, ok_body()).into_response(),
        Err(err) => {
            warn!(error = %err, "admin-triggered refresh failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Accepts either a single `flag_key` or a `flag_keys` array, matching the
/// design's `{flag_key|flag_keys}` request shape.
#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    flag_key: Option<String>,
    #[serde(default)]
    flag_keys: Vec<String>,
}

impl InvalidateRequest {
    fn keys(&self) -> Vec<String> {
        self.flag_key.iter().cloned().chain(self.flag_keys.iter().cloned()).collect()
    }
}

#[instrument(skip(state))]
async fn invalidate(State(state): State<WebhookState>, Json(body): Json<InvalidateRequest>) -> impl IntoResponse {
    let keys = body.keys();
    if keys.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    for key in &keys {
        if let Err(err) = state.client.invalidate_flag(key).await {
            warn!(error = %err, flag_key = %key, "admin-triggered invalidation failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    (StatusCode::OK, ok_body()).into_response()
}

#[instrument(skip(state))]
async fn invalidate_all(State(state): State<WebhookState>) -> impl IntoResponse {
    match state.client.invalidate_all().await {
        Ok(()) => (StatusCode::OK, ok_body()).into_response(),
        Err(err) => {
            warn!(error = %err, "admin-triggered invalidate-all failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Convenience constructor bundling the webhook and admin routers behind a
/// single [`Client`], for a binary that wants both surfaces on one listener.
/// Path/enabled settings come from `options`; pass the same `FlagrOptions`
/// the `Client` was built with to keep the two in sync.
pub fn full_router(client: Arc<Client>, options: &FlagrOptions) -> Router {
    let webhook_secret = options.webhook_secret.clone().map(Arc::from);
    router(WebhookState { client, webhook_secret }, options)
}
