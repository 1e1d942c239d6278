//! Node configuration and persisted-state paths (SPEC_FULL §A.3, §A.4;
//! spec §6 "Persisted state"). `NodeConfig` covers the tunables a node
//! operator sets once at `init`; [`crate::approval::ApprovalConfig`] is
//! the separately-versioned owner policy loaded/saved alongside it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AtmosphereError, Result};

/// Current `config_version` this build writes and expects to read.
/// Bump when a breaking change to `NodeConfig`'s shape ships.
pub const CONFIG_VERSION: u32 = 1;

/// Tunable cost-model multipliers (§4.3, §9 "Open Questions": the
/// source-provided constants are tunable defaults, not gospel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTunables {
    pub on_battery_multiplier: f64,
    pub low_battery_multiplier: f64,
    pub low_battery_threshold_percent: f64,
    pub thermal_throttled_multiplier: f64,
    pub metered_multiplier: f64,
    pub queue_depth_step_multiplier: f64,
    pub queue_depth_threshold: u32,
    pub min_cost_difference: f64,
}

impl Default for CostTunables {
    fn default() -> Self {
        Self {
            on_battery_multiplier: 1.5,
            low_battery_multiplier: 2.0,
            low_battery_threshold_percent: 20.0,
            thermal_throttled_multiplier: 1.5,
            metered_multiplier: 3.0,
            queue_depth_step_multiplier: 1.2,
            queue_depth_threshold: 10,
            min_cost_difference: 0.20,
        }
    }
}

/// Per-node operator configuration (§A.3), persisted as YAML at
/// `<config_dir>/config.yaml`. Unknown top-level keys are rejected per
/// the spec's design note "reject unknown top-level keys"; nested
/// sections are intentionally permissive so a future section can be
/// added without breaking old configs entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub config_version: u32,
    pub node_name: String,
    pub mesh_name: Option<String>,
    pub listen_addresses: Vec<String>,
    #[serde(default)]
    pub cost: CostTunables,
    #[serde(default = "default_capability_stale_seconds")]
    pub capability_stale_seconds: f64,
    #[serde(default = "default_capability_evict_seconds")]
    pub capability_evict_seconds: f64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Enables the append-only `audit.log` request log (§6). Off by
    /// default: auditing writes one line per routed request and is an
    /// explicit operator opt-in, not a silent default.
    #[serde(default)]
    pub audit_enabled: bool,
}

fn default_capability_stale_seconds() -> f64 {
    90.0
}
fn default_capability_evict_seconds() -> f64 {
    300.0
}
fn default_sweep_interval_seconds() -> u64 {
    30
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            node_name: "atmosphere-node".to_string(),
            mesh_name: None,
            listen_addresses: vec!["/ip4/0.0.0.0/tcp/0".to_string()],
            cost: CostTunables::default(),
            capability_stale_seconds: default_capability_stale_seconds(),
            capability_evict_seconds: default_capability_evict_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            audit_enabled: false,
        }
    }
}

impl NodeConfig {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| AtmosphereError::Internal(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| AtmosphereError::Validation(format!("malformed node config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| AtmosphereError::Internal(format!("serializing node config: {e}")))?;
        write_owner_only(path, text.as_bytes())
    }
}

/// The platform-appropriate root under which all node state lives:
/// `~/.atmosphere/` on Unix, the equivalent per-user config directory
/// elsewhere (§6 "Persisted state").
pub fn config_root() -> Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| AtmosphereError::Internal("could not resolve home directory".into()))?;
    Ok(base.home_dir().join(".atmosphere"))
}

pub fn node_config_path(root: &Path) -> PathBuf {
    root.join("config.yaml")
}

pub fn approval_config_path(root: &Path) -> PathBuf {
    root.join("approval.yaml")
}

pub fn identity_key_path(root: &Path) -> PathBuf {
    root.join("identity.key")
}

pub fn revoked_tokens_path(root: &Path) -> PathBuf {
    root.join("tokens").join("revoked.json")
}

pub fn embeddings_cache_path(root: &Path) -> PathBuf {
    root.join("cache").join("embeddings.bin")
}

pub fn audit_log_path(root: &Path) -> PathBuf {
    root.join("audit.log")
}

pub fn storage_path(root: &Path) -> PathBuf {
    root.join("storage")
}

/// Writes `contents` to `path` with 0600 permissions on Unix, creating
/// parent directories as needed. Used for `identity.key` and
/// `config.yaml` alike (§6: "Persisted state" names 0600 for the key;
/// we hold the owner policy to the same bar since it also gates
/// exposure decisions).
pub fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AtmosphereError::Internal(format!("creating {}: {e}", parent.display())))?;
    }
    std::fs::write(path, contents)
        .map_err(|e| AtmosphereError::Internal(format!("writing {}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| AtmosphereError::Internal(format!("chmod {}: {e}", path.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let dir = tempdir().unwrap();
        let path = node_config_path(dir.path());
        let config = NodeConfig::default();
        config.save(&path).unwrap();

        let loaded = NodeConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.config_version, CONFIG_VERSION);
        assert_eq!(loaded.node_name, "atmosphere-node");
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = node_config_path(dir.path());
        let loaded = NodeConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.node_name, "atmosphere-node");
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = node_config_path(dir.path());
        std::fs::write(&path, "config_version: 1\nnode_name: x\nmesh_name: null\nlisten_addresses: []\nbogus_field: true\n").unwrap();
        let err = NodeConfig::load_or_default(&path).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[cfg(unix)]
    #[test]
    fn written_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = node_config_path(dir.path());
        NodeConfig::default().save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
