//! HTTP ingress for push notifications.
//!
//! `POST /webhooks/{connector}` authenticates the body with the connector's
//! shared secret, parses it as JSON and hands it to
//! [`Engine::handle_push`]. Vendors retry on 5xx, so only store failures
//! map to a server error; unmatched or non-terminal events are acknowledged.

use crate::PushEvent;
use crate::runtime::{Engine, EngineError, PushOutcome};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex hmac of the raw body>`.
pub const SIGNATURE_HEADER: &str = "x-opwatch-signature";

/// Router exposing the webhook endpoint.
pub fn webhook_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/webhooks/:connector", post(receive))
        .with_state(engine)
}

/// Signature header value for `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn verify(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, axum::Json(body)).into_response()
}

async fn receive(
    State(engine): State<Arc<Engine>>,
    Path(connector_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(connector) = engine.connectors().get(&connector_name) else {
        return reply(StatusCode::NOT_FOUND, json!({"error": "unknown connector"}));
    };

    if let Some(secret) = connector.webhook_secret() {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify(secret, &body, header) {
            warn!(connector = %connector_name, "Rejected webhook with invalid signature");
            return reply(StatusCode::UNAUTHORIZED, json!({"error": "invalid signature"}));
        }
    }

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return reply(StatusCode::BAD_REQUEST, json!({"error": format!("invalid JSON body: {e}")}));
        }
    };

    match engine.handle_push(&PushEvent::new(connector_name.clone(), parsed)).await {
        Ok(outcome) => {
            let status = match outcome {
                PushOutcome::Terminated(_) | PushOutcome::Forwarded => "accepted",
                _ => "ignored",
            };
            reply(StatusCode::ACCEPTED, json!({"status": status}))
        }
        Err(EngineError::UnknownConnector(_)) => reply(StatusCode::NOT_FOUND, json!({"error": "unknown connector"})),
        Err(e) if e.is_retryable() => {
            warn!(connector = %connector_name, error = %e, "Push handling failed; vendor should retry");
            reply(StatusCode::SERVICE_UNAVAILABLE, json!({"error": e.to_string()}))
        }
        Err(e) => {
            error!(connector = %connector_name, error = %e, "Push handling failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()}))
        }
    }
}
