//! `/api/capabilities`, `/api/route`, `/api/execute`, `/api/cost/current`,
//! and `/api/approval/config` handlers (§6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use atmosphere_core::Capability;

use super::{AppState, HttpResult};
use crate::approval::ApprovalConfig;
use crate::cost::WorkType;
use crate::executor::ExecuteOutcome;
use crate::router::Intent;

pub async fn list(State(state): State<AppState>) -> Json<Vec<Capability>> {
    Json(state.registry.all_online())
}

#[derive(Deserialize)]
pub struct RouteRequest {
    /// `"cap_id"` or `"node_id:label"` direct path, else free text routed
    /// by type (if `cap_type` is set) or natural language.
    pub intent: String,
    #[serde(default)]
    pub cap_type: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, String>,
    #[serde(default)]
    pub explicit: bool,
}

impl RouteRequest {
    fn into_intent(self) -> Intent {
        if self.explicit {
            return Intent::ExplicitPath(self.intent);
        }
        match self.cap_type {
            Some(cap_type) => Intent::Typed {
                cap_type: Some(cap_type),
                text: self.intent,
                preferences: self.preferences,
            },
            None => Intent::NaturalLanguage(self.intent),
        }
    }
}

#[derive(Serialize)]
pub struct RouteResponse {
    pub cap_id: String,
    pub node_id: String,
    pub score: f64,
    pub reasoning: String,
    pub alternatives: Vec<(String, f64)>,
}

impl From<crate::router::RouteResult> for RouteResponse {
    fn from(result: crate::router::RouteResult) -> Self {
        Self {
            cap_id: result.chosen_cap.cap_id.clone(),
            node_id: result.chosen_cap.node_id.clone(),
            score: result.score,
            reasoning: result.reasoning,
            alternatives: result.alternatives,
        }
    }
}

pub async fn route_intent(
    State(state): State<AppState>,
    Json(request): Json<RouteRequest>,
) -> HttpResult<Json<RouteResponse>> {
    let result = state.route(&request.into_intent())?;
    Ok(Json(result.into()))
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub intent: String,
    #[serde(default)]
    pub cap_type: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, String>,
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Deadline override in milliseconds; falls back to the executor's
    /// per-capability-type default (§4.6) when absent.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub result: serde_json::Value,
    pub elapsed_ms: u128,
    pub used_fallback: bool,
}

impl From<ExecuteOutcome> for ExecuteResponse {
    fn from(outcome: ExecuteOutcome) -> Self {
        Self {
            result: outcome.result,
            elapsed_ms: outcome.elapsed.as_millis(),
            used_fallback: outcome.used_fallback,
        }
    }
}

pub async fn execute_intent(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> HttpResult<Json<ExecuteResponse>> {
    let intent = RouteRequest {
        intent: request.intent,
        cap_type: request.cap_type,
        preferences: request.preferences,
        explicit: request.explicit,
    }
    .into_intent();
    let deadline = Instant::now() + request.deadline_ms.map(Duration::from_millis).unwrap_or(Duration::from_secs(30));
    let outcome = state
        .route_and_execute(&intent, request.tool_name.as_deref(), request.payload, deadline)
        .await?;
    Ok(Json(outcome.into()))
}

#[derive(Serialize)]
pub struct CostSnapshot {
    pub factors: atmosphere_core::CostFactors,
    pub general: f64,
    pub inference: f64,
    pub sensor_read: f64,
}

pub async fn current_cost(State(state): State<AppState>) -> Json<CostSnapshot> {
    let factors = state.cost.latest().await;
    Json(CostSnapshot {
        general: crate::cost::cost_for(&factors, WorkType::General),
        inference: crate::cost::cost_for(&factors, WorkType::Inference),
        sensor_read: crate::cost::cost_for(&factors, WorkType::SensorRead),
        factors,
    })
}

pub async fn get_approval_config(State(state): State<AppState>) -> Json<ApprovalConfig> {
    Json(state.approval.config())
}

pub async fn set_approval_config(
    State(state): State<AppState>,
    Json(config): Json<ApprovalConfig>,
) -> HttpResult<Json<ApprovalConfig>> {
    state.approval.reload(config.clone());
    let path = crate::config::approval_config_path(&crate::config::config_root()?);
    config.save(&path)?;
    Ok(Json(config))
}
