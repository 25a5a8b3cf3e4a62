//! RPC Router
//!
//! Exposes the plugin services as JSON over HTTP:
//!
//! - `POST /csi.v1.Identity/<Operation>`
//! - `POST /csi.v1.Controller/<Operation>`
//! - `POST /csi.v1.Node/<Operation>`
//! - `GET /healthz`, `GET /readyz`, `GET /metrics`
//!
//! Request bodies are the protocol messages; an empty body is an empty
//! message. Failures answer with an HTTP status derived from the error code
//! and a `{code, message}` body.

use crate::controller::ControllerService;
use crate::error::{Code, Error, Result};
use crate::identity::IdentityService;
use crate::metrics::RpcMetrics;
use crate::node::NodeService;
use crate::retry::RequestContext;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Per-request deadline supplied by the caller, in milliseconds
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

const SERVICE_PREFIX: &str = "csi.v1.";

// =============================================================================
// Wire Types
// =============================================================================

/// Error body of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: Code,
    pub message: String,
}

fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
        Code::InvalidArgument | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = RpcError {
            code,
            message: self.to_string(),
        };
        (http_status(code), Json(body)).into_response()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Shared state of the RPC handlers
#[derive(Clone)]
pub struct RpcState {
    pub identity: Arc<IdentityService>,
    pub controller: Option<Arc<ControllerService>>,
    pub node: Option<Arc<NodeService>>,
    pub metrics: RpcMetrics,
    /// Cancelled on shutdown; every request context derives from it
    pub shutdown: CancellationToken,
    /// Deadline for callers that send none
    pub default_timeout: Duration,
}

impl RpcState {
    fn controller(&self) -> Result<&ControllerService> {
        self.controller
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("controller service not enabled".into()))
    }

    fn node(&self) -> Result<&NodeService> {
        self.node
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("node service not enabled".into()))
    }

    fn request_context(&self, headers: &HeaderMap) -> RequestContext {
        let timeout = headers
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        RequestContext::child_of(&self.shutdown).with_timeout(timeout)
    }
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/:service/:operation", post(call))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<RpcState>) -> impl IntoResponse {
    if state.identity.is_ready().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not probed")
    }
}

async fn metrics(State(state): State<RpcState>) -> Response {
    match state.metrics.render() {
        Ok((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn call(
    State(state): State<RpcState>,
    Path((service, operation)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(service) = service.strip_prefix(SERVICE_PREFIX) else {
        return Error::Unimplemented(format!("unknown service {}", service)).into_response();
    };

    let ctx = state.request_context(&headers);
    let started = Instant::now();
    let result = dispatch(&state, &ctx, service, &operation, &body).await;
    let code = match &result {
        Ok(_) => Code::Ok,
        Err(e) => e.code(),
    };
    state.metrics.observe(&operation, code, started.elapsed());

    match result {
        Ok(value) => {
            debug!("{}/{} ok in {:?}", service, operation, started.elapsed());
            Json(value).into_response()
        }
        Err(e) => {
            warn!("{}/{} failed: {}", service, operation, e);
            e.into_response()
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidArgument(format!("malformed request: {}", e)))
}

fn encode<T: Serialize>(response: T) -> Result<Value> {
    Ok(serde_json::to_value(response)?)
}

async fn dispatch(
    state: &RpcState,
    ctx: &RequestContext,
    service: &str,
    operation: &str,
    body: &[u8],
) -> Result<Value> {
    match (service, operation) {
        // Identity
        ("Identity", "GetPluginInfo") => encode(state.identity.get_plugin_info()),
        ("Identity", "GetPluginCapabilities") => encode(state.identity.get_plugin_capabilities()),
        ("Identity", "Probe") => encode(state.identity.probe(ctx).await?),

        // Controller
        ("Controller", "CreateVolume") => {
            encode(state.controller()?.create_volume(ctx, decode(body)?).await?)
        }
        ("Controller", "DeleteVolume") => {
            encode(state.controller()?.delete_volume(ctx, decode(body)?).await?)
        }
        ("Controller", "ControllerPublishVolume") => encode(
            state
                .controller()?
                .controller_publish_volume(ctx, decode(body)?)
                .await?,
        ),
        ("Controller", "ControllerUnpublishVolume") => encode(
            state
                .controller()?
                .controller_unpublish_volume(ctx, decode(body)?)
                .await?,
        ),
        ("Controller", "ValidateVolumeCapabilities") => encode(
            state
                .controller()?
                .validate_volume_capabilities(ctx, decode(body)?)
                .await?,
        ),
        ("Controller", "ListVolumes") => {
            encode(state.controller()?.list_volumes(ctx, decode(body)?).await?)
        }
        ("Controller", "ListSnapshots") => {
            encode(state.controller()?.list_snapshots(ctx, decode(body)?).await?)
        }
        ("Controller", "CreateSnapshot") => {
            encode(state.controller()?.create_snapshot(ctx, decode(body)?).await?)
        }
        ("Controller", "DeleteSnapshot") => {
            encode(state.controller()?.delete_snapshot(ctx, decode(body)?).await?)
        }
        ("Controller", "GetCapacity") => {
            encode(state.controller()?.get_capacity(ctx, decode(body)?).await?)
        }
        ("Controller", "ControllerGetCapabilities") => {
            encode(state.controller()?.controller_get_capabilities())
        }
        ("Controller", "ControllerExpandVolume") => encode(
            state
                .controller()?
                .controller_expand_volume(ctx, decode(body)?)
                .await?,
        ),

        // Node
        ("Node", "NodePublishVolume") => {
            encode(state.node()?.node_publish_volume(ctx, decode(body)?).await?)
        }
        ("Node", "NodeUnpublishVolume") => {
            encode(state.node()?.node_unpublish_volume(ctx, decode(body)?).await?)
        }
        ("Node", "NodeGetInfo") => encode(state.node()?.node_get_info(ctx).await?),
        ("Node", "NodeGetCapabilities") => encode(state.node()?.node_get_capabilities()),
        ("Node", "NodeStageVolume") => {
            encode(state.node()?.node_stage_volume(ctx, decode(body)?).await?)
        }
        ("Node", "NodeUnstageVolume") => {
            encode(state.node()?.node_unstage_volume(ctx, decode(body)?).await?)
        }
        ("Node", "NodeExpandVolume") => {
            encode(state.node()?.node_expand_volume(ctx, decode(body)?).await?)
        }
        ("Node", "NodeGetVolumeStats") => {
            encode(state.node()?.node_get_volume_stats(ctx, decode(body)?).await?)
        }

        _ => Err(Error::Unimplemented(format!(
            "unknown method {}/{}",
            service, operation
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::gateway::{SimulatedArray, SimulatedArrayConfig};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn state_with(array: Arc<SimulatedArray>) -> RpcState {
        let controller = Arc::new(ControllerService::new(ControllerConfig::default(), array));
        RpcState {
            identity: Arc::new(IdentityService::new(
                "csi-test",
                Some(controller.clone()),
                None,
            )),
            controller: Some(controller),
            node: None,
            metrics: RpcMetrics::new().unwrap(),
            shutdown: CancellationToken::new(),
            default_timeout: Duration::from_secs(5),
        }
    }

    fn state() -> RpcState {
        let array = Arc::new(SimulatedArray::new(SimulatedArrayConfig::default()));
        array.add_pool("p1");
        state_with(array)
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get_text(app: &Router, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_create_volume_over_http() {
        let app = router(state());
        let (status, body) = post_json(
            &app,
            "/csi.v1.Controller/CreateVolume",
            json!({
                "name": "pvc-1",
                "capacity_range": {"required_bytes": 1073741824i64},
                "parameters": {"storagepool": "p1"}
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["volume"]["capacity_bytes"], json!(8i64 * 1024 * 1024 * 1024));
    }

    #[tokio::test]
    async fn test_errors_carry_code() {
        let app = router(state());

        let (status, body) = post_json(&app, "/csi.v1.Controller/CreateVolume", json!({"name": ""})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("INVALID_ARGUMENT"));

        let (status, body) = post_json(&app, "/csi.v1.Node/NodeGetInfo", json!({})).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["code"], json!("UNIMPLEMENTED"));

        let (status, _) = post_json(&app, "/csi.v1.Controller/Frobnicate", json!({})).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

        let (status, _) = post_json(&app, "/other.Service/Call", json!({})).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let app = router(state());
        let req = Request::builder()
            .method("POST")
            .uri("/csi.v1.Controller/DeleteVolume")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_identity_and_readiness() {
        let app = router(state());

        let (status, _) = get_text(&app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = post_json(&app, "/csi.v1.Identity/Probe", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], json!(true));

        let (status, _) = get_text(&app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        let (_, info) = post_json(&app, "/csi.v1.Identity/GetPluginInfo", json!({})).await;
        assert_eq!(info["name"], json!("csi-test"));

        let (status, text) = get_text(&app, "/healthz").await;
        assert_eq!((status, text.as_str()), (StatusCode::OK, "ok"));
    }

    #[tokio::test]
    async fn test_metrics_count_operations() {
        let app = router(state());
        post_json(&app, "/csi.v1.Controller/ControllerGetCapabilities", json!({})).await;
        post_json(&app, "/csi.v1.Controller/DeleteVolume", json!({"volume_id": ""})).await;

        let (status, text) = get_text(&app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains(
            "flexblock_csi_operations_total{code=\"OK\",operation=\"ControllerGetCapabilities\"} 1"
        ));
        assert!(text.contains(
            "flexblock_csi_operations_total{code=\"INVALID_ARGUMENT\",operation=\"DeleteVolume\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_timeout_header_sets_deadline() {
        let state = state();
        let mut headers = HeaderMap::new();
        headers.insert(TIMEOUT_HEADER, "250".parse().unwrap());

        let before = tokio::time::Instant::now();
        let ctx = state.request_context(&headers);
        let deadline = ctx.deadline().unwrap();
        assert!(deadline <= before + Duration::from_millis(300));

        let ctx = state.request_context(&HeaderMap::new());
        assert!(ctx.deadline().unwrap() > before + Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_requests() {
        let state = state();
        let ctx = state.request_context(&HeaderMap::new());
        state.shutdown.cancel();
        assert!(ctx.cancellation().is_cancelled());
    }
}
