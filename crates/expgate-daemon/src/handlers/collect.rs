use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::RngCore;
use serde_json::Value;

use expgate_core::error::{GateError, GateResult};

use crate::server::{json_error, GatewayState};
use crate::session::client_fingerprint;

/// `POST /data/collect` — telemetry sink for the capture agent. Accepts
/// anything JSON-shaped, wraps it with request metadata and writes it to the
/// blob store under the experiment's namespace.
pub async fn collect(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match collect_impl(&state, &headers, &body) {
        Ok(value) => Json(value).into_response(),
        Err(err) => json_error(&err),
    }
}

fn collect_impl(state: &GatewayState, headers: &HeaderMap, body: &[u8]) -> GateResult<Value> {
    let blobs = state
        .blobs
        .as_deref()
        .ok_or(GateError::StoreUnconfigured("object"))?;

    // A body that is not JSON still gets stored; the envelope metadata alone
    // is worth keeping for debugging a broken agent.
    let payload: Value = serde_json::from_slice(body).unwrap_or_else(|_| Value::Object(Default::default()));
    let prefix = payload
        .get("prefix")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let token = payload
        .get("access_token")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let prefix_slug = sanitize_slug(prefix);
    if prefix_slug.is_empty() {
        return Err(GateError::MissingPrefix);
    }
    let token_slug = {
        let slug = sanitize_slug(token);
        if slug.is_empty() {
            "anonymous".to_string()
        } else {
            slug
        }
    };

    let now = state.now_ms();
    let fingerprint = client_fingerprint(headers);
    // The stored payload is the agent's `payload` field when present, so the
    // trial data round-trips unchanged; a free-form body is kept whole.
    let inner = payload
        .get("payload")
        .cloned()
        .unwrap_or_else(|| payload.clone());
    let envelope = serde_json::json!({
        "received_at": now,
        "ip": fingerprint.ip,
        "user_agent": fingerprint.user_agent,
        "prefix": prefix,
        "access_token": token,
        "download_policy": payload.get("download_policy").and_then(Value::as_str),
        "event": payload.get("event").and_then(Value::as_str),
        "payload": inner,
    });
    let encoded =
        serde_json::to_vec(&envelope).map_err(|err| GateError::Store(err.to_string()))?;

    let key = format!("{prefix_slug}/{token_slug}/{now}_{}.json", submission_nonce());
    blobs
        .put(&key, &encoded, "application/json")
        .map_err(|err| GateError::Store(err.to_string()))?;
    tracing::info!(key = %key, bytes = encoded.len(), "telemetry stored");
    Ok(serde_json::json!({ "ok": true, "key": key }))
}

/// Collapses untrusted identifiers into storage-safe slugs.
fn sanitize_slug(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(64)
        .collect()
}

fn submission_nonce() -> String {
    let mut buf = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
