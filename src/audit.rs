//! Append-only request audit log (§6 "Persisted state": `audit.log`,
//! "if auditing is enabled"). Off by default; a node operator opts in
//! via [`crate::config::NodeConfig::audit_enabled`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{AtmosphereError, Result};

#[derive(Debug, Serialize)]
pub struct AuditEntry<'a> {
    pub timestamp: f64,
    pub request_id: &'a str,
    pub intent: &'a str,
    pub chosen_cap_id: Option<&'a str>,
    pub outcome: &'a str,
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One append-only writer per node, serialized behind a mutex since
/// several tasks may log a request concurrently (§5 "no global locks
/// on the hot path" doesn't apply here -- auditing is off the routing
/// hot path by construction, logged after the decision is already made).
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AtmosphereError::Internal(format!("creating {}: {e}", parent.display())))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AtmosphereError::Internal(format!("opening audit log {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| AtmosphereError::Internal(format!("chmod {}: {e}", path.display())))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one JSON line. Never fails the caller's request: a write
    /// failure here is logged at `warn` and swallowed, matching the
    /// taxonomy's "never surface ambient plumbing failures" policy.
    pub fn record(&self, request_id: &str, intent: &str, chosen_cap_id: Option<&str>, outcome: &str) {
        let entry = AuditEntry {
            timestamp: now_unix(),
            request_id,
            intent,
            chosen_cap_id,
            outcome,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize audit entry");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{line}") {
            tracing::warn!(%err, path = %self.path.display(), "failed to append audit entry");
        }
    }
}
