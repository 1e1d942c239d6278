//! HTTP / WebSocket surface (§6 "External Interfaces"). Thin axum
//! handlers over [`AtmosphereNode`]; every handler's job is request
//! parsing and response shaping, nothing more — the node does the work.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::AtmosphereError;
use crate::AtmosphereNode;

mod capabilities;
mod compat;
mod mesh;
mod ws;

/// Shared application state injected into every handler via
/// [`axum::extract::State`], mirroring `RouterState` in the gateway
/// example this module is grounded on.
pub type AppState = Arc<AtmosphereNode>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

/// Maps every core error onto the §7 "User-visible behavior" status
/// table and a JSON body carrying the taxonomy tag.
impl IntoResponse for AtmosphereErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

/// Newtype so `AtmosphereError` (defined in another module) can
/// implement axum's `IntoResponse` here without an orphan-rule
/// violation, and so handlers can write `.map_err(AtmosphereErrorResponse)?`.
pub struct AtmosphereErrorResponse(pub AtmosphereError);

impl From<AtmosphereError> for AtmosphereErrorResponse {
    fn from(err: AtmosphereError) -> Self {
        Self(err)
    }
}

pub type HttpResult<T> = std::result::Result<T, AtmosphereErrorResponse>;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

/// Assembles the full router (§6's endpoint table). The binary mounts
/// this under whatever listener it opens; nothing here is
/// transport-specific.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/mesh/status", get(mesh::status))
        .route("/api/mesh/token", post(mesh::issue_token))
        .route("/api/mesh/join", post(mesh::join))
        .route("/api/mesh/peers", get(mesh::peers))
        .route("/api/mesh/topology", get(mesh::topology))
        .route("/api/capabilities", get(capabilities::list))
        .route("/api/route", post(capabilities::route_intent))
        .route("/api/execute", post(capabilities::execute_intent))
        .route("/api/cost/current", get(capabilities::current_cost))
        .route(
            "/api/approval/config",
            get(capabilities::get_approval_config).post(capabilities::set_approval_config),
        )
        .route("/v1/chat/completions", post(compat::chat_completions))
        .route("/v1/embeddings", post(compat::embeddings))
        .route("/v1/ml/anomaly", post(compat::ml_anomaly))
        .route("/v1/ml/classify", post(compat::ml_classify))
        .route("/api/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalConfig;
    use crate::config::NodeConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(AtmosphereNode::new(dir.path(), NodeConfig::default(), ApprovalConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn topology_endpoint_reflects_the_crdt_snapshot_not_a_live_scan() {
        let state = test_state();
        let local = state.local_node_id().to_string();
        let app = build_router(state.clone());

        let response = app
            .oneshot(Request::builder().uri("/api/mesh/topology").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let topology: serde_json::Value = serde_json::from_slice(&body).unwrap();

        // Populated by AtmosphereNode::new()'s initial refresh, proving
        // the handler reads state.topology rather than an empty registry.
        let node_ids: Vec<&str> = topology["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["node_id"].as_str().unwrap())
            .collect();
        assert!(node_ids.contains(&local.as_str()));
    }
}
