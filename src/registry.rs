//! Capability Registry (§4.2): the in-memory map of known capabilities,
//! local and remote, plus the secondary indices the Router needs to
//! answer "all capabilities of type X" without a linear scan.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use atmosphere_core::{Capability, CapabilityStatus};
use dashmap::{DashMap, DashSet};
use globset::Glob;
use tracing::{debug, warn};

use crate::error::{AtmosphereError, Result};

/// Default liveness thresholds (§3 invariants).
pub const CAPABILITY_STALE_SECONDS: f64 = 90.0;
pub const CAPABILITY_EVICT_SECONDS: f64 = 300.0;
pub const SWEEP_INTERVAL_SECONDS: u64 = 30;

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Remote,
}

pub struct CapabilityRecord {
    pub capability: Capability,
    pub source: Source,
    pub last_heartbeat: f64,
    pub known_via_peer: Option<String>,
}

/// A reader-writer map keyed by `cap_id`, with secondary indices
/// maintained alongside it under the same conceptual write section
/// (DashMap gives us per-shard locking rather than one global lock, so
/// the hot routing-read path never blocks on registration).
pub struct Registry {
    by_id: DashMap<String, CapabilityRecord>,
    by_type: DashMap<String, DashSet<String>>,
    by_tool: DashMap<String, DashSet<String>>,
    by_trigger: DashMap<String, DashSet<String>>,
    by_node: DashMap<String, DashSet<String>>,
    stale_streak: AtomicU8,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_type: DashMap::new(),
            by_tool: DashMap::new(),
            by_trigger: DashMap::new(),
            by_node: DashMap::new(),
            stale_streak: AtomicU8::new(0),
        }
    }

    fn index_insert(index: &DashMap<String, DashSet<String>>, key: &str, cap_id: &str) {
        index
            .entry(key.to_string())
            .or_default()
            .insert(cap_id.to_string());
    }

    fn index_remove(index: &DashMap<String, DashSet<String>>, key: &str, cap_id: &str) {
        if let Some(set) = index.get(key) {
            set.remove(cap_id);
            if set.is_empty() {
                drop(set);
                index.remove(key);
            }
        }
    }

    fn reindex(&self, cap: &Capability) {
        Self::index_insert(&self.by_type, cap.cap_type.as_str(), &cap.cap_id);
        Self::index_insert(&self.by_node, &cap.node_id, &cap.cap_id);
        for tool in &cap.tools {
            Self::index_insert(&self.by_tool, &tool.name, &cap.cap_id);
        }
        for trigger in &cap.triggers {
            Self::index_insert(&self.by_trigger, &trigger.event_name, &cap.cap_id);
        }
    }

    fn unindex(&self, cap: &Capability) {
        Self::index_remove(&self.by_type, cap.cap_type.as_str(), &cap.cap_id);
        Self::index_remove(&self.by_node, &cap.node_id, &cap.cap_id);
        for tool in &cap.tools {
            Self::index_remove(&self.by_tool, &tool.name, &cap.cap_id);
        }
        for trigger in &cap.triggers {
            Self::index_remove(&self.by_trigger, &trigger.event_name, &cap.cap_id);
        }
    }

    /// Register a capability owned by this node. Emits nothing itself —
    /// the caller (Node) is responsible for publishing
    /// `capability_available` to the Gossip Engine once this returns Ok.
    pub fn register_local(&self, capability: Capability) -> Result<()> {
        self.register(capability, Source::Local, None)
    }

    /// Register a capability learned via gossip. Idempotent on
    /// `cap_id`; rejects attempts to silently reassign ownership.
    pub fn register_remote(&self, capability: Capability, via_peer: String) -> Result<()> {
        self.register(capability, Source::Remote, Some(via_peer))
    }

    fn register(
        &self,
        capability: Capability,
        source: Source,
        via_peer: Option<String>,
    ) -> Result<()> {
        if capability.cap_id.is_empty() {
            return Err(AtmosphereError::Validation("cap_id must not be empty".into()));
        }
        if capability.node_id.is_empty() {
            return Err(AtmosphereError::Validation("node_id must not be empty".into()));
        }

        if let Some(existing) = self.by_id.get(&capability.cap_id) {
            if existing.capability.node_id != capability.node_id {
                warn!(
                    cap_id = %capability.cap_id,
                    existing_owner = %existing.capability.node_id,
                    attempted_owner = %capability.node_id,
                    "rejecting owner-conflicting capability announcement"
                );
                return Err(AtmosphereError::OwnerConflict {
                    cap_id: capability.cap_id.clone(),
                    existing_owner: existing.capability.node_id.clone(),
                });
            }
        }

        let last_heartbeat = capability.last_heartbeat;
        self.unindex_if_present(&capability.cap_id);
        self.reindex(&capability);
        debug!(cap_id = %capability.cap_id, node_id = %capability.node_id, ?source, "capability registered");
        self.by_id.insert(
            capability.cap_id.clone(),
            CapabilityRecord {
                capability,
                source,
                last_heartbeat,
                known_via_peer: via_peer,
            },
        );
        Ok(())
    }

    fn unindex_if_present(&self, cap_id: &str) {
        if let Some((_, record)) = self.by_id.remove(cap_id) {
            self.unindex(&record.capability);
        }
    }

    pub fn deregister(&self, cap_id: &str) -> Result<()> {
        match self.by_id.remove(cap_id) {
            Some((_, record)) => {
                self.unindex(&record.capability);
                Ok(())
            }
            None => Err(AtmosphereError::NotFound(format!(
                "no capability with id {cap_id}"
            ))),
        }
    }

    /// Updates `last_heartbeat` and flips status back to `online` if it
    /// had been marked `degraded`/`offline` by the sweep.
    pub fn heartbeat(&self, cap_id: &str) -> Result<()> {
        let mut entry = self
            .by_id
            .get_mut(cap_id)
            .ok_or_else(|| AtmosphereError::NotFound(format!("no capability with id {cap_id}")))?;
        let now = now_unix();
        entry.last_heartbeat = now;
        entry.capability.last_heartbeat = now;
        entry.capability.status = CapabilityStatus::Online;
        Ok(())
    }

    pub fn get(&self, cap_id: &str) -> Option<Capability> {
        self.by_id.get(cap_id).map(|r| r.capability.clone())
    }

    pub fn is_online(&self, cap_id: &str) -> bool {
        self.by_id
            .get(cap_id)
            .map(|r| r.capability.status == CapabilityStatus::Online)
            .unwrap_or(false)
    }

    fn collect(&self, ids: impl Iterator<Item = String>) -> Vec<Capability> {
        ids.filter_map(|id| self.by_id.get(&id).map(|r| r.capability.clone()))
            .collect()
    }

    pub fn find_by_type(&self, cap_type: &str) -> Vec<Capability> {
        match self.by_type.get(cap_type) {
            Some(set) => self.collect(set.iter().map(|id| id.clone())),
            None => Vec::new(),
        }
    }

    pub fn find_by_tool(&self, tool_name: &str) -> Vec<Capability> {
        match self.by_tool.get(tool_name) {
            Some(set) => self.collect(set.iter().map(|id| id.clone())),
            None => Vec::new(),
        }
    }

    pub fn find_by_trigger(&self, event_name: &str) -> Vec<Capability> {
        match self.by_trigger.get(event_name) {
            Some(set) => self.collect(set.iter().map(|id| id.clone())),
            None => Vec::new(),
        }
    }

    pub fn find_by_node(&self, node_id: &str) -> Vec<Capability> {
        match self.by_node.get(node_id) {
            Some(set) => self.collect(set.iter().map(|id| id.clone())),
            None => Vec::new(),
        }
    }

    /// Glob match over every registered capability's `route_hint`
    /// triggers, case-sensitive per §4.2.
    pub fn find_by_route_hint(&self, pattern: &str) -> Vec<Capability> {
        let glob = match Glob::new(pattern) {
            Ok(g) => g.compile_matcher(),
            Err(_) => return Vec::new(),
        };
        self.by_id
            .iter()
            .filter(|entry| {
                entry
                    .capability
                    .triggers
                    .iter()
                    .any(|t| glob.is_match(&t.route_hint))
            })
            .map(|entry| entry.capability.clone())
            .collect()
    }

    pub fn all_online(&self) -> Vec<Capability> {
        self.by_id
            .iter()
            .filter(|e| e.capability.status == CapabilityStatus::Online)
            .map(|e| e.capability.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Staleness sweep (§4.2). Degrades remote capabilities past
    /// `capability_stale_seconds`, evicts past `capability_evict_seconds`.
    /// Returns the `cap_id`s evicted so the caller (Router) can drop any
    /// cached routing decisions that pointed at them.
    pub fn sweep(&self) -> Vec<String> {
        let now = now_unix();
        let mut evicted = Vec::new();
        let mut to_evict = Vec::new();

        for mut entry in self.by_id.iter_mut() {
            if entry.source == Source::Local {
                continue;
            }
            let age = now - entry.last_heartbeat;
            if age > CAPABILITY_EVICT_SECONDS {
                to_evict.push(entry.capability.cap_id.clone());
            } else if age > CAPABILITY_STALE_SECONDS
                && entry.capability.status == CapabilityStatus::Online
            {
                entry.capability.status = CapabilityStatus::Offline;
            }
        }

        for cap_id in to_evict {
            if self.deregister(&cap_id).is_ok() {
                evicted.push(cap_id);
            }
        }

        if evicted.is_empty() {
            self.stale_streak.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stale_streak.store(0, Ordering::Relaxed);
        }
        evicted
    }
}
