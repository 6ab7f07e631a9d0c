use std::sync::Arc;

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use expgate_core::clock::Clock;
use expgate_core::error::GateError;

use crate::config::DaemonConfig;
use crate::handlers;
use crate::store::{BlobStore, RecordStore};

/// Shared, cheaply clonable request context. All cross-request state lives in
/// the injected stores; the gateway itself is stateless.
#[derive(Clone)]
pub struct GatewayState {
    pub cfg: Arc<DaemonConfig>,
    pub records: Arc<dyn RecordStore>,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub clock: Arc<dyn Clock>,
    pub http: reqwest::Client,
}

impl GatewayState {
    pub fn new(
        cfg: DaemonConfig,
        records: Arc<dyn RecordStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        // Redirects from the proxied origin pass through to the caller
        // unfollowed; no timeout beyond the client library's defaults.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            cfg: Arc::new(cfg),
            records,
            blobs,
            clock,
            http,
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

pub fn router(state: GatewayState) -> Router {
    let body_limit = state.cfg.max_body_bytes;
    Router::new()
        .route("/access/:token", get(handlers::access::access_page))
        .route("/access/", get(missing_token))
        .route("/proxy/:token", any(handlers::proxy::proxy_root))
        .route("/proxy/:token/", any(handlers::proxy::proxy_root))
        .route("/proxy/:token/*rest", any(handlers::proxy::proxy_subpath))
        .route("/exp/:prefix", get(handlers::hosted::hosted_root))
        .route("/exp/:prefix/", get(handlers::hosted::hosted_root))
        .route("/exp/:prefix/*rest", get(handlers::hosted::hosted_asset))
        .route("/data/collect", post(handlers::collect::collect))
        .route("/token/verify", post(handlers::verify::verify))
        .route("/token/status", get(handlers::verify::status))
        .layer(middleware::from_fn(cors_and_preflight))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: GatewayState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Every response carries permissive CORS headers; `OPTIONS` is answered with
/// 204 and no body before routing.
async fn cors_and_preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        apply_cors(resp.headers_mut());
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_cors(resp.headers_mut());
    resp
}

pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type"),
    );
}

async fn missing_token() -> Response {
    text_error(&GateError::MissingToken)
}

pub fn status_of(err: &GateError) -> StatusCode {
    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Plain-text rejection, used by the page-serving route families.
pub fn text_error(err: &GateError) -> Response {
    tracing::info!(error = %err, status = err.http_status(), "request rejected");
    (status_of(err), err.to_string()).into_response()
}

/// JSON rejection, used by the token and collector endpoints.
pub fn json_error(err: &GateError) -> Response {
    tracing::info!(error = %err, status = err.http_status(), "request rejected");
    let mut body = serde_json::json!({ "error": err.to_string() });
    if let GateError::TooEarly { start_at_ms } = err {
        body["start_at_ms"] = (*start_at_ms).into();
    }
    (status_of(err), Json(body)).into_response()
}
