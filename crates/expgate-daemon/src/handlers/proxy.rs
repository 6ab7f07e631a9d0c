use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use axum::response::Response;

use expgate_core::error::{GateError, GateResult};
use expgate_core::lifecycle;
use expgate_core::rewrite;

use crate::records::{load_token, save_token};
use crate::server::{text_error, GatewayState};
use crate::session::{client_fingerprint, new_session_id, session_set_cookie};

/// Hop-scoped or recomputed headers, never forwarded either direction.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "accept-encoding",
];
const SKIP_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// `any /proxy/:token/` — tunnel to the bound target's own path.
pub async fn proxy_root(
    State(state): State<GatewayState>,
    Path(token): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run(state, token, String::new(), method, uri, headers, body).await
}

/// `any /proxy/:token/*rest` — tunnel a sub-path.
pub async fn proxy_subpath(
    State(state): State<GatewayState>,
    Path((token, rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run(state, token, rest, method, uri, headers, body).await
}

async fn run(
    state: GatewayState,
    token: String,
    rest: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match proxy_impl(&state, &token, &rest, &method, &uri, &headers, body).await {
        Ok(resp) => resp,
        Err(err) => text_error(&err),
    }
}

async fn proxy_impl(
    state: &GatewayState,
    token: &str,
    rest: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> GateResult<Response> {
    let now = state.now_ms();
    let mut record =
        load_token(state.records.as_ref(), token, now)?.ok_or(GateError::NotFound)?;

    let fingerprint = client_fingerprint(headers);
    let fresh_session = if fingerprint.session_id.is_empty() {
        Some(new_session_id())
    } else {
        None
    };
    let access =
        lifecycle::authorize_proxy(&mut record, &fingerprint, now, fresh_session.as_deref())?;
    if access.dirty {
        save_token(state.records.as_ref(), token, &record, now)?;
        tracing::info!(token = %token, session = ?record.used_session_id, "proxy binding updated");
    }

    // Sub-path joins the target origin; an empty sub-path falls back to the
    // target's own path. A target URL that fails to parse is forwarded
    // verbatim and rewriting is anchored at the root.
    let (fetch_url, target_path) = match url::Url::parse(&record.target_url) {
        Ok(target) => {
            let path = if rest.is_empty() {
                target.path().to_string()
            } else {
                format!("/{rest}")
            };
            let mut out = target.clone();
            out.set_path(&path);
            out.set_query(uri.query());
            (out.to_string(), target.path().to_string())
        }
        Err(_) => (record.target_url.clone(), "/".to_string()),
    };

    let mut outbound = HeaderMap::new();
    for (name, value) in headers {
        if !SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            outbound.append(name.clone(), value.clone());
        }
    }

    let upstream = state
        .http
        .request(method.clone(), &fetch_url)
        .headers(outbound)
        .body(body.to_vec())
        .send()
        .await
        .map_err(|err| GateError::Upstream(err.to_string()))?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|err| GateError::Upstream(err.to_string()))?;

    let mut response_headers = HeaderMap::new();
    for (name, value) in &upstream_headers {
        if !SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            response_headers.append(name.clone(), value.clone());
        }
    }
    response_headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    if let Some(session_id) = access.established_session.as_deref() {
        let cookie = session_set_cookie(token, session_id, state.cfg.secure_cookies());
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response_headers.append(SET_COOKIE, value);
        }
    }

    let is_html = upstream_headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.contains("text/html"));

    let payload = if is_html {
        let proxy_base = format!("/proxy/{token}");
        let proxy_dir_base = format!(
            "{}{}{}",
            state.cfg.public_base_url,
            proxy_base,
            rewrite::base_dir(&target_path)
        );
        let text = String::from_utf8_lossy(&bytes);
        rewrite::rewrite_html(&text, &proxy_base, &proxy_dir_base).into_bytes()
    } else {
        bytes.to_vec()
    };

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
