//! Approval Gate (§4.8): owner policy filtering every "expose" and
//! "accept" decision. Nothing crosses the mesh boundary — outbound
//! announcement or inbound invoke — without passing through here.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use globset::Glob;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::write_owner_only;
use crate::error::{AtmosphereError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshAccessMode {
    Allowlist,
    Denylist,
    All,
}

impl Default for MeshAccessMode {
    fn default() -> Self {
        MeshAccessMode::Allowlist
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareLimits {
    pub gpu_enabled: bool,
    pub cpu_enabled: bool,
    pub max_concurrent_jobs: u32,
    pub max_vram_percent: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorExposure {
    #[serde(default)]
    pub camera: bool,
    #[serde(default)]
    pub microphone: bool,
    #[serde(default)]
    pub screen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimits {
    pub global_requests_per_minute: u32,
    pub per_mesh_requests_per_minute: u32,
    pub llm_token_cap_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            global_requests_per_minute: 600,
            per_mesh_requests_per_minute: 300,
            llm_token_cap_per_minute: 50_000,
        }
    }
}

/// Owner policy (§4.8), persisted as YAML at `approval.yaml` with 0600
/// permissions (§6 "Persisted state"). Every field defaults to the
/// conservative choice: nothing exposed, no mesh access, token required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalConfig {
    pub config_version: u32,
    #[serde(default)]
    pub allowed_model_families: Vec<String>,
    #[serde(default)]
    pub hardware: HardwareLimits,
    #[serde(default)]
    pub sensors: SensorExposure,
    #[serde(default)]
    pub mesh_access_mode: MeshAccessMode,
    #[serde(default)]
    pub mesh_allowlist: HashSet<String>,
    #[serde(default)]
    pub mesh_denylist: HashSet<String>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default = "default_true")]
    pub require_auth: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            config_version: crate::config::CONFIG_VERSION,
            allowed_model_families: Vec::new(),
            hardware: HardwareLimits::default(),
            sensors: SensorExposure::default(),
            mesh_access_mode: MeshAccessMode::Allowlist,
            mesh_allowlist: HashSet::new(),
            mesh_denylist: HashSet::new(),
            rate_limits: RateLimits::default(),
            require_auth: true,
        }
    }
}

impl ApprovalConfig {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| AtmosphereError::Internal(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| AtmosphereError::Validation(format!("malformed approval config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| AtmosphereError::Internal(format!("serializing approval config: {e}")))?;
        write_owner_only(path, text.as_bytes())
    }

    fn mesh_node_allowed(&self, node_id: &str) -> bool {
        match self.mesh_access_mode {
            MeshAccessMode::All => true,
            MeshAccessMode::Allowlist => self.mesh_allowlist.contains(node_id),
            MeshAccessMode::Denylist => !self.mesh_denylist.contains(node_id),
        }
    }

    fn model_family_allowed(&self, label: &str) -> bool {
        self.allowed_model_families.iter().any(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher().is_match(label))
                .unwrap_or(false)
        })
    }
}

/// A fixed-window per-minute counter. Matches §4.8's "per-scope rate
/// limits" without pulling in a token-bucket crate the rest of the
/// corpus doesn't use for this kind of bookkeeping.
struct WindowCounter {
    window_start: Instant,
    count: u32,
}

impl WindowCounter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn tick(&mut self, limit: u32, amount: u32) -> bool {
        if self.window_start.elapsed() >= Duration::from_secs(60) {
            self.window_start = Instant::now();
            self.count = 0;
        }
        if self.count + amount > limit {
            return false;
        }
        self.count += amount;
        true
    }
}

/// Stateful gate built from an [`ApprovalConfig`] plus the rolling rate
/// counters §4.8 requires. One instance per node; `reload` swaps in a
/// freshly edited config without resetting in-flight counters more
/// often than the window boundary demands.
pub struct ApprovalGate {
    config: Mutex<ApprovalConfig>,
    global_counter: Mutex<WindowCounter>,
    per_mesh_counters: Mutex<HashMap<String, WindowCounter>>,
    llm_token_counter: Mutex<WindowCounter>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config: Mutex::new(config),
            global_counter: Mutex::new(WindowCounter::new()),
            per_mesh_counters: Mutex::new(HashMap::new()),
            llm_token_counter: Mutex::new(WindowCounter::new()),
        }
    }

    pub fn reload(&self, config: ApprovalConfig) {
        *self.config.lock() = config;
    }

    pub fn config(&self) -> ApprovalConfig {
        self.config.lock().clone()
    }

    /// Decides whether a local capability may be included in outbound
    /// announcements (§3: "private capabilities never appear in
    /// announcements"). Non-model, non-sensor capabilities (tools,
    /// triggers with no hardware/model footprint) are exposed by
    /// default; model and sensor capabilities require explicit opt-in.
    pub fn may_expose(&self, cap_type: &str, label: &str) -> bool {
        let config = self.config.lock();
        if cap_type.starts_with("sensor/") {
            return match cap_type {
                "sensor/camera" => config.sensors.camera,
                "sensor/microphone" => config.sensors.microphone,
                _ => config.sensors.screen,
            };
        }
        if cap_type.starts_with("llm/") || cap_type.starts_with("vision/") || cap_type.starts_with("audio/") {
            if config.allowed_model_families.is_empty() {
                return false;
            }
            return config.model_family_allowed(label);
        }
        true
    }

    /// Decides whether an incoming invoke from `mesh_node_id` is
    /// admitted, applying mesh access mode, auth requirement, and rate
    /// limits together (§4.8: "applies these filters; denied invokes
    /// return `not_authorized`").
    pub fn authorize_invoke(
        &self,
        mesh_node_id: &str,
        mesh_id: &str,
        authenticated: bool,
        llm_tokens_requested: u32,
    ) -> Result<()> {
        let config = self.config.lock();
        if config.require_auth && !authenticated {
            return Err(AtmosphereError::NotAuthorized("anonymous invoke disallowed".into()));
        }
        if !config.mesh_node_allowed(mesh_node_id) {
            return Err(AtmosphereError::NotAuthorized(format!(
                "node {mesh_node_id} not permitted by mesh access policy"
            )));
        }
        let global_limit = config.rate_limits.global_requests_per_minute;
        let per_mesh_limit = config.rate_limits.per_mesh_requests_per_minute;
        let token_limit = config.rate_limits.llm_token_cap_per_minute;
        drop(config);

        if !self.global_counter.lock().tick(global_limit, 1) {
            return Err(AtmosphereError::NotAuthorized("global rate limit exceeded".into()));
        }
        let mesh_ok = self
            .per_mesh_counters
            .lock()
            .entry(mesh_id.to_string())
            .or_insert_with(WindowCounter::new)
            .tick(per_mesh_limit, 1);
        if !mesh_ok {
            return Err(AtmosphereError::NotAuthorized("per-mesh rate limit exceeded".into()));
        }
        if llm_tokens_requested > 0
            && !self.llm_token_counter.lock().tick(token_limit, llm_tokens_requested)
        {
            return Err(AtmosphereError::NotAuthorized("llm token cap exceeded".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_exposes_nothing_sensitive() {
        let config = ApprovalConfig::default();
        let gate = ApprovalGate::new(config);
        assert!(!gate.may_expose("sensor/camera", "builtin-camera"));
        assert!(!gate.may_expose("llm/chat", "llama3-8b"));
        assert!(gate.may_expose("tool/weather", "weather-tool"));
    }

    #[test]
    fn model_family_glob_gates_exposure() {
        let mut config = ApprovalConfig::default();
        config.allowed_model_families.push("llama3-*".to_string());
        let gate = ApprovalGate::new(config);
        assert!(gate.may_expose("llm/chat", "llama3-8b"));
        assert!(!gate.may_expose("llm/chat", "mistral-7b"));
    }

    #[test]
    fn default_allowlist_mode_denies_unlisted_node() {
        let gate = ApprovalGate::new(ApprovalConfig::default());
        let err = gate
            .authorize_invoke("node-b", "mesh-1", true, 0)
            .expect_err("empty allowlist must deny everyone");
        assert_eq!(err.kind(), "not_authorized");
    }

    #[test]
    fn allowlisted_node_is_admitted() {
        let mut config = ApprovalConfig::default();
        config.mesh_allowlist.insert("node-b".to_string());
        let gate = ApprovalGate::new(config);
        assert!(gate.authorize_invoke("node-b", "mesh-1", true, 0).is_ok());
    }

    #[test]
    fn anonymous_invoke_rejected_when_auth_required() {
        let mut config = ApprovalConfig::default();
        config.mesh_allowlist.insert("node-b".to_string());
        let gate = ApprovalGate::new(config);
        let err = gate
            .authorize_invoke("node-b", "mesh-1", false, 0)
            .expect_err("anonymous invoke must be rejected");
        assert_eq!(err.kind(), "not_authorized");
    }

    #[test]
    fn global_rate_limit_trips_after_threshold() {
        let mut config = ApprovalConfig::default();
        config.mesh_allowlist.insert("node-b".to_string());
        config.rate_limits.global_requests_per_minute = 2;
        let gate = ApprovalGate::new(config);
        assert!(gate.authorize_invoke("node-b", "mesh-1", true, 0).is_ok());
        assert!(gate.authorize_invoke("node-b", "mesh-1", true, 0).is_ok());
        let err = gate
            .authorize_invoke("node-b", "mesh-1", true, 0)
            .expect_err("third request should exceed the limit");
        assert_eq!(err.kind(), "not_authorized");
    }

    #[test]
    fn llm_token_cap_is_enforced() {
        let mut config = ApprovalConfig::default();
        config.mesh_allowlist.insert("node-b".to_string());
        config.rate_limits.llm_token_cap_per_minute = 1000;
        let gate = ApprovalGate::new(config);
        assert!(gate.authorize_invoke("node-b", "mesh-1", true, 900).is_ok());
        let err = gate
            .authorize_invoke("node-b", "mesh-1", true, 200)
            .expect_err("cumulative tokens should exceed the cap");
        assert_eq!(err.kind(), "not_authorized");
    }

    #[test]
    fn denylist_mode_blocks_only_listed_nodes() {
        let mut config = ApprovalConfig::default();
        config.mesh_access_mode = MeshAccessMode::Denylist;
        config.mesh_denylist.insert("node-bad".to_string());
        let gate = ApprovalGate::new(config);
        assert!(gate.authorize_invoke("node-good", "mesh-1", true, 0).is_ok());
        let err = gate
            .authorize_invoke("node-bad", "mesh-1", true, 0)
            .expect_err("denylisted node must be rejected");
        assert_eq!(err.kind(), "not_authorized");
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approval.yaml");
        let mut config = ApprovalConfig::default();
        config.mesh_allowlist.insert("node-b".to_string());
        config.save(&path).unwrap();
        let loaded = ApprovalConfig::load_or_default(&path).unwrap();
        assert!(loaded.mesh_allowlist.contains("node-b"));
    }
}
