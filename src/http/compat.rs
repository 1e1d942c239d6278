//! OpenAI-compatible surface (§6): `/v1/chat/completions`, `/v1/embeddings`,
//! and a small ML extension (`/v1/ml/anomaly`, `/v1/ml/classify`) so
//! existing OpenAI-client tooling can talk to the mesh without changes
//! beyond the base URL. Every handler routes through the same
//! [`crate::router::Router`] and [`crate::executor::Executor`] the
//! native `/api/*` surface uses; this module only translates shapes.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AppState, HttpResult};
use crate::router::Intent;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the [`Intent`] a `model` field resolves to. `"auto"` (or
/// absent) lets the router pick by natural-language content; anything
/// else is tried as an explicit `cap_id` or `node_id:label` path
/// first, falling back to a typed route against `cap_type` (scored
/// against `text`, not the model string) so unknown model names still
/// resolve to *some* capability of the right category rather than 404.
fn model_intent(model: &str, cap_type: &str, text: String) -> Intent {
    if model.is_empty() || model.eq_ignore_ascii_case("auto") {
        return Intent::Typed {
            cap_type: Some(cap_type.to_string()),
            text,
            preferences: Default::default(),
        };
    }
    Intent::ExplicitPathWithFallback {
        path: model.to_string(),
        cap_type: cap_type.to_string(),
        text,
    }
}

#[derive(Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatChoiceMessage,
    pub finish_reason: &'static str,
}

#[derive(Serialize)]
pub struct ChatChoiceMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> HttpResult<Json<ChatCompletionResponse>> {
    let prompt = request
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let intent = model_intent(&request.model, "llm/chat", prompt.clone());
    let payload = json!({
        "messages": request.messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
    });
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    let outcome = state.route_and_execute(&intent, None, payload, deadline).await?;

    let content = outcome
        .result
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(Json(ChatCompletionResponse {
        id: format!("atmosphere-{}", uuid::Uuid::new_v4()),
        object: "chat.completion",
        model: request.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage { role: "assistant", content },
            finish_reason: "stop",
        }],
    }))
}

#[derive(Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Serialize)]
pub struct EmbeddingEntry {
    pub index: usize,
    pub embedding: Vec<f32>,
    pub object: &'static str,
}

#[derive(Serialize)]
pub struct EmbeddingsResponse {
    pub object: &'static str,
    pub model: String,
    pub data: Vec<EmbeddingEntry>,
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(request): Json<EmbeddingsRequest>,
) -> HttpResult<Json<EmbeddingsResponse>> {
    let mut data = Vec::with_capacity(request.input.len());
    for (index, text) in request.input.iter().enumerate() {
        let intent = model_intent(&request.model, "llm/embed", text.clone());
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        let outcome = state
            .route_and_execute(&intent, None, json!({"input": text}), deadline)
            .await?;
        let embedding: Vec<f32> = outcome
            .result
            .get("embedding")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        data.push(EmbeddingEntry { index, embedding, object: "embedding" });
    }
    Ok(Json(EmbeddingsResponse {
        object: "list",
        model: request.model,
        data,
    }))
}

#[derive(Deserialize)]
pub struct MlAnomalyRequest {
    #[serde(default)]
    pub model: String,
    pub data: serde_json::Value,
    /// `"detect"` | `"fit"` | `"score"`, forwarded to the handling tool.
    #[serde(default = "default_anomaly_action")]
    pub action: String,
}

fn default_anomaly_action() -> String {
    "detect".to_string()
}

pub async fn ml_anomaly(
    State(state): State<AppState>,
    Json(request): Json<MlAnomalyRequest>,
) -> HttpResult<Json<serde_json::Value>> {
    let intent = model_intent(&request.model, "ml/anomaly", request.action.clone());
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    let outcome = state
        .route_and_execute(
            &intent,
            Some(request.action.as_str()),
            json!({"data": request.data, "action": request.action}),
            deadline,
        )
        .await?;
    Ok(Json(outcome.result))
}

#[derive(Deserialize)]
pub struct MlClassifyRequest {
    #[serde(default)]
    pub model: String,
    pub data: serde_json::Value,
    /// `"predict"` | `"fit"`, forwarded to the handling tool.
    #[serde(default = "default_classify_action")]
    pub action: String,
}

fn default_classify_action() -> String {
    "predict".to_string()
}

pub async fn ml_classify(
    State(state): State<AppState>,
    Json(request): Json<MlClassifyRequest>,
) -> HttpResult<Json<serde_json::Value>> {
    let intent = model_intent(&request.model, "ml/classify", request.action.clone());
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    let outcome = state
        .route_and_execute(
            &intent,
            Some(request.action.as_str()),
            json!({"data": request.data, "action": request.action}),
            deadline,
        )
        .await?;
    Ok(Json(outcome.result))
}
