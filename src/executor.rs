//! Executor (§4.6): invokes the capability a [`crate::router::RouteResult`]
//! selected, locally or over the mesh, under an absolute deadline, and
//! classifies every failure into the §7 taxonomy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AtmosphereError, Result};
use crate::router::RouteResult;

/// Default deadlines by work category (§4.6 "Timeouts").
pub const DEFAULT_DEADLINE_LLM: Duration = Duration::from_secs(30);
pub const DEFAULT_DEADLINE_TOOL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEADLINE_SENSOR: Duration = Duration::from_secs(2);

pub fn default_deadline_for(cap_type: &str) -> Duration {
    match cap_type.split('/').next() {
        Some("llm") | Some("vision") | Some("ml") => DEFAULT_DEADLINE_LLM,
        Some("sensor") => DEFAULT_DEADLINE_SENSOR,
        _ => DEFAULT_DEADLINE_TOOL,
    }
}

/// A locally registered handler for a `(cap_id, tool_name)` pair. The
/// Executor owns classification (validation vs. handler error vs.
/// timeout); a handler just does the work and returns its own error as
/// a plain message.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn invoke(&self, tool_name: &str, payload: Value) -> std::result::Result<Value, String>;
}

/// Sends a `capability_invoke` request to the node that owns a remote
/// capability and awaits the matching response (§4.6 "Remote path").
/// Kept as a trait so the executor doesn't depend on a concrete
/// transport/session type directly.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke_remote(
        &self,
        owner_node_id: &str,
        cap_id: &str,
        tool_name: Option<&str>,
        payload: Value,
        request_id: &str,
        deadline: Instant,
    ) -> std::result::Result<Value, RemoteInvokeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteInvokeError {
    TransportFailure,
    Unavailable,
    HandlerError,
}

pub struct ExecuteOutcome {
    pub result: Value,
    pub elapsed: Duration,
    pub used_fallback: bool,
}

/// Bridges a `tool/*` capability whose handler is a WASM module to the
/// [`LocalHandler`] contract (SPEC_FULL §B "WASM-sandboxed tool
/// execution"). One instance backs one capability: the module bytes
/// and fuel budget are fixed at construction and registered under that
/// capability's `cap_id` the same way any other `LocalHandler` is
/// (see [`crate::AtmosphereNode::register_wasm_tool_capability`]).
pub struct WasmToolHandler {
    runtime: Arc<dyn atmosphere_compute::ComputeRuntime>,
    module: Vec<u8>,
    fuel_budget: u64,
}

impl WasmToolHandler {
    pub fn new(runtime: Arc<dyn atmosphere_compute::ComputeRuntime>, module: Vec<u8>, fuel_budget: u64) -> Self {
        Self {
            runtime,
            module,
            fuel_budget,
        }
    }
}

#[async_trait]
impl LocalHandler for WasmToolHandler {
    async fn invoke(&self, _tool_name: &str, payload: Value) -> std::result::Result<Value, String> {
        let input = serde_json::to_vec(&payload).map_err(|e| e.to_string())?;
        let output = self
            .runtime
            .execute(&self.module, &input, self.fuel_budget)
            .await
            .map_err(|e| e.to_string())?;
        if output.data.is_empty() {
            Ok(serde_json::json!({ "fuel_consumed": output.fuel_consumed }))
        } else {
            serde_json::from_slice(&output.data)
                .map_err(|e| format!("wasm module returned non-JSON output: {e}"))
        }
    }
}

/// Ties a local handler registry and a remote invoker together behind
/// the single `execute` contract §4.6 names.
pub struct Executor {
    local_node_id: String,
    handlers: HashMap<String, Arc<dyn LocalHandler>>,
    remote: Arc<dyn RemoteInvoker>,
}

impl Executor {
    pub fn new(local_node_id: String, remote: Arc<dyn RemoteInvoker>) -> Self {
        Self {
            local_node_id,
            handlers: HashMap::new(),
            remote,
        }
    }

    /// Registers the handler backing a local capability's tools, keyed
    /// by `cap_id`. A capability without tools (pure sensor/trigger) has
    /// no handler and can only be routed to, not invoked.
    pub fn register_handler(&mut self, cap_id: String, handler: Arc<dyn LocalHandler>) {
        self.handlers.insert(cap_id, handler);
    }

    fn validate_payload(payload: &Value, schema: &Value) -> Result<()> {
        // A full JSON Schema validator is out of scope; the invariant
        // we must hold is the cheap one callers actually rely on --
        // required top-level properties are present.
        let (Value::Object(schema), Value::Object(payload)) = (schema, payload) else {
            return Ok(());
        };
        let Some(Value::Array(required)) = schema.get("required") else {
            return Ok(());
        };
        for field in required {
            let Value::String(name) = field else { continue };
            if !payload.contains_key(name) {
                return Err(AtmosphereError::Validation(format!(
                    "missing required field `{name}`"
                )));
            }
        }
        Ok(())
    }

    /// §4.6 contract: `execute(route_result, payload, timeout) -> Result`.
    /// `timeout` is an absolute deadline, not a duration, per §5
    /// "Every public operation accepts an absolute deadline."
    pub async fn execute(
        &self,
        route_result: &RouteResult,
        tool_name: Option<&str>,
        payload: Value,
        deadline: Instant,
    ) -> Result<ExecuteOutcome> {
        let cap = &route_result.chosen_cap;
        let started = Instant::now();

        let outcome = if cap.node_id == self.local_node_id {
            self.execute_local(cap, tool_name, payload.clone(), deadline).await
        } else {
            self.execute_remote(cap, tool_name, payload.clone(), deadline).await
        };

        match outcome {
            Ok(result) => Ok(ExecuteOutcome {
                result,
                elapsed: started.elapsed(),
                used_fallback: false,
            }),
            Err(primary_err) => {
                if let Some((alt_cap_id, _)) = route_result.alternatives.first() {
                    if self.fallback_eligible(&primary_err, cap, tool_name) {
                        debug!(cap_id = %cap.cap_id, alt = %alt_cap_id, "falling back to alternative capability");
                        // The caller is responsible for re-resolving alt_cap_id into a
                        // full Capability via the registry and re-invoking; the executor
                        // itself only decides *whether* a fallback is eligible (§4.6
                        // "at most 1 fallback per call" is enforced by the caller not
                        // looping back into this same route_result).
                        return Err(AtmosphereError::TransportFailure(format!(
                            "primary capability {} failed ({primary_err}); fallback to {alt_cap_id} eligible",
                            cap.cap_id
                        )));
                    }
                }
                Err(primary_err)
            }
        }
    }

    fn fallback_eligible(
        &self,
        err: &AtmosphereError,
        cap: &atmosphere_core::Capability,
        tool_name: Option<&str>,
    ) -> bool {
        let failure_class_ok = matches!(
            err,
            AtmosphereError::TransportFailure(_) | AtmosphereError::NoCapability
        );
        if failure_class_ok {
            return true;
        }
        tool_name
            .and_then(|name| cap.tools.iter().find(|t| t.name == name))
            .map(|t| t.idempotent)
            .unwrap_or(false)
    }

    async fn execute_local(
        &self,
        cap: &atmosphere_core::Capability,
        tool_name: Option<&str>,
        payload: Value,
        deadline: Instant,
    ) -> Result<Value> {
        let handler = self
            .handlers
            .get(&cap.cap_id)
            .ok_or_else(|| AtmosphereError::HandlerError(format!("no local handler for {}", cap.cap_id)))?;

        if let Some(name) = tool_name {
            if let Some(tool) = cap.tools.iter().find(|t| t.name == name) {
                Self::validate_payload(&payload, &tool.param_schema)?;
            } else {
                return Err(AtmosphereError::Validation(format!("unknown tool `{name}`")));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AtmosphereError::Timeout(Duration::from_secs(0)));
        }

        let tool = tool_name.unwrap_or("").to_string();
        match tokio::time::timeout(remaining, handler.invoke(&tool, payload)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(AtmosphereError::HandlerError(message)),
            Err(_) => Err(AtmosphereError::Timeout(remaining)),
        }
    }

    async fn execute_remote(
        &self,
        cap: &atmosphere_core::Capability,
        tool_name: Option<&str>,
        payload: Value,
        deadline: Instant,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        match self
            .remote
            .invoke_remote(&cap.node_id, &cap.cap_id, tool_name, payload, &request_id, deadline)
            .await
        {
            Ok(value) => Ok(value),
            Err(RemoteInvokeError::TransportFailure) => Err(AtmosphereError::TransportFailure(format!(
                "transport failure invoking {} on {}",
                cap.cap_id, cap.node_id
            ))),
            Err(RemoteInvokeError::Unavailable) => Err(AtmosphereError::NoCapability),
            Err(RemoteInvokeError::HandlerError) => {
                Err(AtmosphereError::HandlerError(format!("remote handler error for {}", cap.cap_id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::{Capability, CapabilityStatus, CapabilityType, Tool};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn capability(node_id: &str, cap_id: &str, idempotent: bool) -> Capability {
        Capability {
            cap_id: cap_id.to_string(),
            node_id: node_id.to_string(),
            cap_type: CapabilityType::llm_chat(),
            label: "chat".into(),
            description: "".into(),
            embedding_vector: vec![],
            topics: vec![],
            tools: vec![Tool {
                name: "chat".into(),
                description: "".into(),
                param_schema: serde_json::json!({"type":"object","required":["prompt"]}),
                return_schema: serde_json::json!({}),
                idempotent,
            }],
            triggers: vec![],
            metadata: Default::default(),
            status: CapabilityStatus::Online,
            last_heartbeat: 0.0,
        }
    }

    struct EchoHandler;
    #[async_trait]
    impl LocalHandler for EchoHandler {
        async fn invoke(&self, _tool_name: &str, payload: Value) -> std::result::Result<Value, String> {
            Ok(payload)
        }
    }

    struct SlowHandler;
    #[async_trait]
    impl LocalHandler for SlowHandler {
        async fn invoke(&self, _tool_name: &str, _payload: Value) -> std::result::Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    struct FailingRemote {
        kind: RemoteInvokeError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RemoteInvoker for FailingRemote {
        async fn invoke_remote(
            &self,
            _owner_node_id: &str,
            _cap_id: &str,
            _tool_name: Option<&str>,
            _payload: Value,
            _request_id: &str,
            _deadline: Instant,
        ) -> std::result::Result<Value, RemoteInvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.kind)
        }
    }

    fn route_result(cap: Capability) -> RouteResult {
        RouteResult {
            chosen_cap: cap,
            score: 1.0,
            reasoning: "test".into(),
            alternatives: vec![],
        }
    }

    #[tokio::test]
    async fn local_execute_succeeds_and_reports_elapsed() {
        let remote = Arc::new(FailingRemote {
            kind: RemoteInvokeError::TransportFailure,
            calls: AtomicU32::new(0),
        });
        let mut executor = Executor::new("node-a".into(), remote);
        executor.register_handler("node-a:chat".into(), Arc::new(EchoHandler));

        let cap = capability("node-a", "node-a:chat", false);
        let result = route_result(cap);
        let deadline = Instant::now() + Duration::from_secs(5);
        let payload = serde_json::json!({"prompt": "hi"});

        let outcome = executor
            .execute(&result, Some("chat"), payload.clone(), deadline)
            .await
            .unwrap();
        assert_eq!(outcome.result, payload);
        assert!(!outcome.used_fallback);
    }

    #[tokio::test]
    async fn missing_required_field_is_validation_error() {
        let remote = Arc::new(FailingRemote {
            kind: RemoteInvokeError::TransportFailure,
            calls: AtomicU32::new(0),
        });
        let mut executor = Executor::new("node-a".into(), remote);
        executor.register_handler("node-a:chat".into(), Arc::new(EchoHandler));

        let cap = capability("node-a", "node-a:chat", false);
        let result = route_result(cap);
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = executor
            .execute(&result, Some("chat"), serde_json::json!({}), deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn local_handler_timeout_classified_as_timeout() {
        let remote = Arc::new(FailingRemote {
            kind: RemoteInvokeError::TransportFailure,
            calls: AtomicU32::new(0),
        });
        let mut executor = Executor::new("node-a".into(), remote);
        executor.register_handler("node-a:chat".into(), Arc::new(SlowHandler));

        let cap = capability("node-a", "node-a:chat", false);
        let result = route_result(cap);
        let deadline = Instant::now() + Duration::from_millis(20);

        let err = executor
            .execute(&result, Some("chat"), serde_json::json!({"prompt": "hi"}), deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn non_idempotent_remote_transport_failure_allows_fallback() {
        let remote = Arc::new(FailingRemote {
            kind: RemoteInvokeError::TransportFailure,
            calls: AtomicU32::new(0),
        });
        let executor = Executor::new("node-a".into(), remote);

        let cap = capability("node-b", "node-b:chat", false);
        let mut result = route_result(cap);
        result.alternatives.push(("node-c:chat".into(), 0.9));
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = executor
            .execute(&result, Some("chat"), serde_json::json!({"prompt": "hi"}), deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transport_failure");
        assert!(err.to_string().contains("fallback"));
    }

    #[tokio::test]
    async fn non_idempotent_handler_error_has_no_fallback_hint() {
        let remote = Arc::new(FailingRemote {
            kind: RemoteInvokeError::HandlerError,
            calls: AtomicU32::new(0),
        });
        let executor = Executor::new("node-a".into(), remote);

        let cap = capability("node-b", "node-b:chat", false);
        let mut result = route_result(cap);
        result.alternatives.push(("node-c:chat".into(), 0.9));
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = executor
            .execute(&result, Some("chat"), serde_json::json!({"prompt": "hi"}), deadline)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "handler_error");
        assert!(!err.to_string().contains("fallback"));
    }

    #[tokio::test]
    async fn idempotent_tool_allows_fallback_even_on_handler_error() {
        let remote = Arc::new(FailingRemote {
            kind: RemoteInvokeError::HandlerError,
            calls: AtomicU32::new(0),
        });
        let executor = Executor::new("node-a".into(), remote);

        let cap = capability("node-b", "node-b:chat", true);
        let mut result = route_result(cap);
        result.alternatives.push(("node-c:chat".into(), 0.9));
        let deadline = Instant::now() + Duration::from_secs(5);

        let err = executor
            .execute(&result, Some("chat"), serde_json::json!({"prompt": "hi"}), deadline)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fallback"));
    }

    #[test]
    fn default_deadlines_match_spec_budget() {
        assert_eq!(default_deadline_for("llm/chat"), DEFAULT_DEADLINE_LLM);
        assert_eq!(default_deadline_for("sensor/camera"), DEFAULT_DEADLINE_SENSOR);
        assert_eq!(default_deadline_for("tool/weather"), DEFAULT_DEADLINE_TOOL);
    }

    struct FakeComputeRuntime;
    #[async_trait]
    impl atmosphere_compute::ComputeRuntime for FakeComputeRuntime {
        fn name(&self) -> &str {
            "fake"
        }
        async fn execute(
            &self,
            _module: &[u8],
            input: &[u8],
            fuel_budget: u64,
        ) -> std::result::Result<atmosphere_compute::ComputeOutput, atmosphere_compute::ComputeError> {
            Ok(atmosphere_compute::ComputeOutput {
                data: input.to_vec(),
                fuel_consumed: fuel_budget / 2,
            })
        }
    }

    #[tokio::test]
    async fn wasm_tool_handler_round_trips_json_payload_through_compute_runtime() {
        let handler = WasmToolHandler::new(Arc::new(FakeComputeRuntime), vec![0u8; 4], 1000);
        let payload = serde_json::json!({"x": 1});

        let result = handler.invoke("run", payload.clone()).await.unwrap();
        assert_eq!(result, payload);
    }

    #[tokio::test]
    async fn wasm_tool_handler_reports_fuel_consumed_when_module_has_no_output() {
        struct SilentRuntime;
        #[async_trait]
        impl atmosphere_compute::ComputeRuntime for SilentRuntime {
            fn name(&self) -> &str {
                "silent"
            }
            async fn execute(
                &self,
                _module: &[u8],
                _input: &[u8],
                fuel_budget: u64,
            ) -> std::result::Result<atmosphere_compute::ComputeOutput, atmosphere_compute::ComputeError> {
                Ok(atmosphere_compute::ComputeOutput {
                    data: Vec::new(),
                    fuel_consumed: fuel_budget - 1,
                })
            }
        }

        let handler = WasmToolHandler::new(Arc::new(SilentRuntime), vec![0u8; 4], 1000);
        let result = handler.invoke("run", serde_json::json!({})).await.unwrap();
        assert_eq!(result["fuel_consumed"], 999);
    }
}
