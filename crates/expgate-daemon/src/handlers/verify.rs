use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use expgate_core::error::{GateError, GateResult};
use expgate_core::lifecycle;

use crate::records::{load_token, save_token};
use crate::server::{json_error, GatewayState};
use crate::session::client_fingerprint;

#[derive(Debug, Default, Deserialize)]
struct VerifyRequest {
    token: Option<String>,
}

/// `POST /token/verify` — re-validate and/or claim a token. The waiting page
/// retries this on a timer/click; the gateway itself never retries.
pub async fn verify(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match verify_impl(&state, &headers, &body) {
        Ok(value) => Json(value).into_response(),
        Err(err) => json_error(&err),
    }
}

fn verify_impl(state: &GatewayState, headers: &HeaderMap, body: &[u8]) -> GateResult<Value> {
    // A malformed body degrades to an empty request, which fails on the
    // missing token rather than on the parse.
    let request: VerifyRequest = serde_json::from_slice(body).unwrap_or_default();
    let token = request
        .token
        .filter(|t| !t.is_empty())
        .ok_or(GateError::MissingToken)?;

    let now = state.now_ms();
    let mut record =
        load_token(state.records.as_ref(), &token, now)?.ok_or(GateError::NotFound)?;
    let fingerprint = client_fingerprint(headers);
    let accept = lifecycle::verify(&mut record, &fingerprint, now)?;
    if accept.dirty {
        save_token(state.records.as_ref(), &token, &record, now)?;
    }
    tracing::info!(token = %token, start_at_ms = accept.start_at_ms, "token verified");
    Ok(serde_json::json!({ "ok": true, "start_at_ms": accept.start_at_ms }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    token: Option<String>,
}

/// `GET /token/status?token=` — read-only record dump.
pub async fn status(
    State(state): State<GatewayState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match status_impl(&state, query.token.as_deref()) {
        Ok(value) => Json(value).into_response(),
        Err(err) => json_error(&err),
    }
}

fn status_impl(state: &GatewayState, token: Option<&str>) -> GateResult<Value> {
    let token = token.filter(|t| !t.is_empty()).ok_or(GateError::MissingToken)?;
    let now = state.now_ms();
    let record =
        load_token(state.records.as_ref(), token, now)?.ok_or(GateError::NotFound)?;
    let data = serde_json::to_value(&record).map_err(|err| GateError::Store(err.to_string()))?;
    Ok(serde_json::json!({ "ok": true, "data": data }))
}
