//! The capability vocabulary: what a node can advertise, and the
//! tool/trigger shapes that make a capability invokable or reactive.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// The closed set of capability categories a node may advertise.
///
/// Kept as a string newtype rather than a fixed enum: the mesh is meant
/// to carry categories this crate doesn't know about yet (new sensor
/// kinds, new `tool/*` or `agent/*` namespaces) without a protocol
/// version bump. Well-known prefixes get constructors for convenience
/// and typo-resistance at call sites.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapabilityType(pub String);

impl CapabilityType {
    pub fn llm_chat() -> Self {
        Self(String::from("llm/chat"))
    }
    pub fn llm_embed() -> Self {
        Self(String::from("llm/embed"))
    }
    pub fn vision_classify() -> Self {
        Self(String::from("vision/classify"))
    }
    pub fn vision_detect() -> Self {
        Self(String::from("vision/detect"))
    }
    pub fn audio_transcribe() -> Self {
        Self(String::from("audio/transcribe"))
    }
    pub fn audio_speak() -> Self {
        Self(String::from("audio/speak"))
    }
    pub fn ml_anomaly() -> Self {
        Self(String::from("ml/anomaly"))
    }
    pub fn ml_classify() -> Self {
        Self(String::from("ml/classify"))
    }
    pub fn sensor_camera() -> Self {
        Self(String::from("sensor/camera"))
    }
    pub fn sensor_microphone() -> Self {
        Self(String::from("sensor/microphone"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace before the first `/`, e.g. `"llm"` for `"llm/chat"`.
    pub fn namespace(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }
}

impl From<&str> for CapabilityType {
    fn from(s: &str) -> Self {
        Self(String::from(s))
    }
}

impl core::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness state of a capability record, local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Online,
    Degraded,
    Offline,
}

/// A callable aspect of a capability, invoked via the Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema describing accepted parameters.
    pub param_schema: serde_json::Value,
    /// JSON Schema describing the return value.
    pub return_schema: serde_json::Value,
    /// If true, the Executor may retry this tool against an alternative
    /// capability on transport failure even though the call already reached
    /// a remote node (§4.6 idempotency rule).
    #[serde(default)]
    pub idempotent: bool,
}

/// An event-producing aspect of a capability. When `event_name` fires
/// locally, an intent is synthesized from `intent_template` and routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub event_name: String,
    pub description: String,
    pub intent_template: String,
    /// Glob pattern (case-sensitive) used by the router's keyword boost
    /// and by `find_by_route_hint`.
    pub route_hint: String,
    pub priority: u8,
    pub throttle_ms: u64,
}

/// Free-form metadata describing models, resources, and physical
/// location backing a capability. Left as a JSON object rather than a
/// fixed struct: the fields vary wildly by capability type (an `llm/chat`
/// capability cares about model name and context window; a
/// `sensor/camera` capability cares about resolution and facing
/// direction) and new node/capability kinds must not require a schema
/// change here.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The unit of advertised work in the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Globally unique within a mesh, conventionally `"{node_id}:{label}"`.
    pub cap_id: String,
    /// The node that owns this capability; only the owner may heartbeat,
    /// remove, or locally execute it.
    pub node_id: String,
    pub cap_type: CapabilityType,
    pub label: String,
    pub description: String,
    /// Fixed-dimensional embedding vector computed once at registration.
    /// Re-embedding requires minting a new `cap_id`.
    pub embedding_vector: Vec<f32>,
    /// Keywords that earn a fixed similarity boost in the router (§4.5
    /// step 5), distinct from `triggers[].route_hint` globs.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: CapabilityStatus,
    /// Unix seconds of the last heartbeat or announcement carrying this
    /// capability.
    pub last_heartbeat: f64,
}

impl Capability {
    pub fn dimension(&self) -> usize {
        self.embedding_vector.len()
    }
}
