use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use expgate_core::capture::{self, CaptureParams};
use expgate_core::error::{GateError, GateResult};
use expgate_core::lifecycle;
use expgate_core::token::DownloadPolicy;

use crate::records::{load_token, save_token};
use crate::server::{text_error, GatewayState};
use crate::session::client_fingerprint;
use crate::store::{Blob, BlobStore};

/// Virtual asset path under every bundle; never read from the blob store.
const CAPTURE_PATH: &str = "_capture.js";

#[derive(Debug, Default, Deserialize)]
pub struct HostedQuery {
    access_token: Option<String>,
    dl: Option<String>,
}

/// `GET /exp/:prefix/` — bundle entry document.
pub async fn hosted_root(
    State(state): State<GatewayState>,
    Path(prefix): Path<String>,
    Query(query): Query<HostedQuery>,
    headers: HeaderMap,
) -> Response {
    match hosted_impl(&state, &prefix, "", query, &headers) {
        Ok(resp) => resp,
        Err(err) => text_error(&err),
    }
}

/// `GET /exp/:prefix/*rest` — bundle asset.
pub async fn hosted_asset(
    State(state): State<GatewayState>,
    Path((prefix, rest)): Path<(String, String)>,
    Query(query): Query<HostedQuery>,
    headers: HeaderMap,
) -> Response {
    match hosted_impl(&state, &prefix, &rest, query, &headers) {
        Ok(resp) => resp,
        Err(err) => text_error(&err),
    }
}

fn hosted_impl(
    state: &GatewayState,
    prefix: &str,
    rest: &str,
    query: HostedQuery,
    headers: &HeaderMap,
) -> GateResult<Response> {
    let blobs = state
        .blobs
        .as_deref()
        .ok_or(GateError::StoreUnconfigured("object"))?;
    let rel = resolve_rel(rest);

    if rel == CAPTURE_PATH {
        let token = query.access_token.unwrap_or_default();
        let policy = query
            .dl
            .as_deref()
            .and_then(DownloadPolicy::parse)
            .unwrap_or_default();
        let script = capture::capture_script(&CaptureParams {
            prefix,
            token: &token,
            download_policy: policy,
            collect_url: &state.cfg.collect_url(),
        });
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
            script,
        )
            .into_response());
    }

    let now = state.now_ms();
    let token = query.access_token.filter(|t| !t.is_empty());
    let is_document = is_document_request(headers);

    // A document fetch must carry a token and consumes the hosted binding.
    // Sub-resources are only lifecycle-checked, and only when the experiment
    // runtime happened to forward the token.
    let mut capture_target = None;
    if is_document {
        let token = token.ok_or(GateError::MissingToken)?;
        let mut record =
            load_token(state.records.as_ref(), &token, now)?.ok_or(GateError::NotFound)?;
        let fingerprint = client_fingerprint(headers);
        let access = lifecycle::authorize_hosted(&mut record, &fingerprint, now, true)?;
        if access.dirty {
            save_token(state.records.as_ref(), &token, &record, now)?;
            tracing::info!(token = %token, prefix = %prefix, "hosted document bound");
        }
        capture_target = Some((token, record.download_policy()));
    } else if let Some(token) = token {
        if let Some(mut record) = load_token(state.records.as_ref(), &token, now)? {
            let fingerprint = client_fingerprint(headers);
            lifecycle::authorize_hosted(&mut record, &fingerprint, now, false)?;
        }
    }

    let blob = fetch_bundle(blobs, prefix, &rel, &state.cfg.legacy_bundle_prefix)?;

    if let Some((token, policy)) = capture_target {
        if blob.content_type.contains("text/html") {
            let script_src = format!(
                "/exp/{prefix}/{CAPTURE_PATH}?access_token={token}&dl={}",
                policy.as_str()
            );
            let html = String::from_utf8_lossy(&blob.body);
            let body = capture::inject_capture_script(&html, &script_src);
            return Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, blob.content_type)],
                body,
            )
                .into_response());
        }
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, blob.content_type)],
        blob.body,
    )
        .into_response())
}

/// Empty and directory-shaped paths resolve to the bundle's entry document.
fn resolve_rel(rest: &str) -> String {
    if rest.is_empty() || rest.ends_with('/') {
        format!("{rest}index.html")
    } else {
        rest.to_string()
    }
}

/// Browsers mark top-level navigations with `Sec-Fetch-Dest: document`; the
/// Accept fallback covers clients that omit fetch metadata.
fn is_document_request(headers: &HeaderMap) -> bool {
    if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
        return dest == "document";
    }
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |accept| accept.contains("text/html"))
}

/// Prefixed key first, then the shared legacy bundle namespace.
fn fetch_bundle(
    blobs: &dyn BlobStore,
    prefix: &str,
    rel: &str,
    legacy_prefix: &str,
) -> GateResult<Blob> {
    let direct = blobs
        .get(&format!("{prefix}/{rel}"))
        .map_err(|err| GateError::Store(err.to_string()))?;
    if let Some(blob) = direct {
        return Ok(blob);
    }
    blobs
        .get(&format!("{legacy_prefix}/{rel}"))
        .map_err(|err| GateError::Store(err.to_string()))?
        .ok_or(GateError::AssetNotFound)
}
