//! Webhook receiver (C10, `http-surfaces` feature): an axum router that
//! accepts upstream-pushed `flag.updated`/`flag.deleted` events and turns
//! them into targeted cache invalidation.
//!
//! Signature verification follows the HMAC-SHA256 scheme used for webhook
//! payloads elsewhere in this ecosystem: a hex-encoded `X-Webhook-Signature`
//! header computed over the raw request body with a shared secret.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{instrument, warn};

use crate::client::Client;
use crate::refresh::InvalidationEvent;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-webhook-signature";

fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookPayload {
    #[serde(rename = "flag.updated")]
    FlagUpdated { flag_keys: Vec<String>, #[allow(dead_code)] timestamp: Option<i64> },
    #[serde(rename = "flag.deleted")]
    FlagDeleted { flag_keys: Vec<String>, #[allow(dead_code)] timestamp: Option<i64> },
}

impl From<WebhookPayload> for InvalidationEvent {
    fn from(payload: WebhookPayload) -> Self {
        match payload {
            WebhookPayload::FlagUpdated { flag_keys, .. } => InvalidationEvent::FlagsUpdated(flag_keys),
            WebhookPayload::FlagDeleted { flag_keys, .. } => InvalidationEvent::FlagsDeleted(flag_keys),
        }
    }
}

/// State shared by the webhook and admin routers.
#[derive(Clone)]
pub struct WebhookState {
    pub client: Arc<Client>,
    pub webhook_secret: Option<Arc<str>>,
}

pub fn router(state: WebhookState, path: &str) -> Router {
    Router::new().route(path, post(handle_webhook)).with_state(state)
}

#[instrument(skip(state, headers, body))]
async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.webhook_secret {
        let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            warn!("webhook request missing signature header");
            return StatusCode::UNAUTHORIZED.into_response();
        };
        if !verify_signature(secret.as_bytes(), &body, signature) {
            warn!("webhook signature verification failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "malformed webhook payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match state.client.apply_invalidation_event(payload.into()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            warn!(error = %err, "failed to apply webhook invalidation event");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_roundtrip(
            secret in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
            payload in proptest::collection::vec(proptest::num::u8::ANY, 0..512)
        ) {
            let sig = compute_signature(&secret, &payload);
            prop_assert!(verify_signature(&secret, &payload, &sig));
        }

        #[test]
        fn prop_wrong_secret_fails(
            secret_a in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
            secret_b in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
            payload in proptest::collection::vec(proptest::num::u8::ANY, 1..256)
        ) {
            if secret_a != secret_b {
                let sig = compute_signature(&secret_a, &payload);
                prop_assert!(!verify_signature(&secret_b, &payload, &sig));
            }
        }
    }
}
