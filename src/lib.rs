//! Atmosphere node orchestrator: wires the Capability Registry, Cost
//! model, Gossip Engine, Semantic Router, Executor, and Approval Gate
//! into the single `AtmosphereNode` every binary (CLI, HTTP surface,
//! test harness) drives (§2 "System Overview").

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use atmosphere_core::{Announcement, AnnouncementKind, Capability, JoinEndpoints, Token};
use dashmap::DashMap;
use fjall::{Config as FjallConfig, PartitionCreateOptions, PartitionHandle};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

pub mod approval;
pub mod audit;
pub mod config;
pub mod cost;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod executor;
pub mod gossip;
pub mod http;
pub mod identity;
pub mod mesh;
pub mod registry;
pub mod router;
pub mod sync;
pub mod transport;

use approval::{ApprovalConfig, ApprovalGate};
use audit::AuditLog;
use config::NodeConfig;
use cost::{cost_for, CostCollector, WorkType};
use embedding::{Embedder, HashingEmbedder};
use error::{AtmosphereError, Result};
use executor::{Executor, RemoteInvokeError, RemoteInvoker};
use gossip::{build_announcement, GossipEngine};
use identity::{generate_keypair, Identity, NodeRole};
use registry::Registry;
use router::{CostTable, Intent, Locality, LocalityOracle, Router};
use sync::{SharedState, TopologySnapshot};

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Rebuilds a [`TopologySnapshot`] from the live Registry and
/// `NodeCostTable`: the local node plus every node with at least one
/// online capability, each paired with its current
/// [`WorkType::General`] cost score. Free function (rather than a
/// method) so it's usable both from [`AtmosphereNode::refresh_topology_snapshot`]
/// and from the gossip handler closure, which only holds cloned `Arc`s.
fn compute_topology_snapshot(
    local_node_id: &str,
    registry: &Registry,
    cost_table: &NodeCostTable,
) -> TopologySnapshot {
    let mut node_ids: HashSet<String> = HashSet::new();
    node_ids.insert(local_node_id.to_string());
    for cap in registry.all_online() {
        node_ids.insert(cap.node_id);
    }
    let nodes = node_ids
        .into_iter()
        .map(|node_id| {
            let cost = cost_table.cost_for_node(&node_id, WorkType::General);
            (node_id, cost)
        })
        .collect();
    TopologySnapshot { nodes }
}

/// Sync snapshot table the [`Router`] reads directly: the local node's
/// own latest [`atmosphere_core::CostFactors`] plus whatever the gossip
/// engine last learned about each peer via `cost_update` announcements
/// (§4.5 step 6). Kept separate from [`CostCollector`] because the
/// router's scoring pass is synchronous and must not await a lock held
/// across a `.await` point.
pub struct NodeCostTable {
    local_node_id: String,
    local_factors: RwLock<atmosphere_core::CostFactors>,
    peer_factors: DashMap<String, atmosphere_core::CostFactors>,
}

impl NodeCostTable {
    fn new(local_node_id: String) -> Self {
        Self {
            local_node_id,
            local_factors: RwLock::new(atmosphere_core::CostFactors::unknown(now_unix())),
            peer_factors: DashMap::new(),
        }
    }

    pub fn update_local(&self, factors: atmosphere_core::CostFactors) {
        *self.local_factors.write() = factors;
    }

    pub fn update_peer(&self, node_id: &str, factors: atmosphere_core::CostFactors) {
        self.peer_factors.insert(node_id.to_string(), factors);
    }
}

impl CostTable for NodeCostTable {
    fn cost_for_node(&self, node_id: &str, work_type: WorkType) -> f64 {
        if node_id == self.local_node_id {
            cost_for(&self.local_factors.read(), work_type)
        } else {
            self.peer_factors
                .get(node_id)
                .map(|entry| cost_for(&entry, work_type))
                .unwrap_or(1.0)
        }
    }
}

/// No LAN-vs-remote detection primitive is available without a
/// transport RTT tracker (§4.5 locality tiers note only `SameNode` is
/// cheaply knowable up front); everything else is treated as `Remote`
/// until the transport layer supplies better signal.
pub struct NodeLocalityOracle {
    local_node_id: String,
}

impl LocalityOracle for NodeLocalityOracle {
    fn locality_of(&self, node_id: &str) -> Locality {
        if node_id == self.local_node_id {
            Locality::SameNode
        } else {
            Locality::Remote
        }
    }
}

/// Placeholder [`RemoteInvoker`] that reports every remote capability
/// unavailable. A concrete transport-backed invoker is wired in by the
/// binary once a [`transport::MeshTransport`] session exists; nodes
/// running without networking (single-node `serve`, tests) use this.
pub struct NullRemoteInvoker;

#[async_trait::async_trait]
impl RemoteInvoker for NullRemoteInvoker {
    async fn invoke_remote(
        &self,
        _owner_node_id: &str,
        _cap_id: &str,
        _tool_name: Option<&str>,
        _payload: serde_json::Value,
        _request_id: &str,
        _deadline: std::time::Instant,
    ) -> std::result::Result<serde_json::Value, RemoteInvokeError> {
        Err(RemoteInvokeError::Unavailable)
    }
}

const STATE_PARTITION: &str = "atmosphere_state";

/// Ties every component together behind the operations a caller (CLI,
/// HTTP handler, test) actually needs: register/heartbeat a local
/// capability, route an intent, execute it, and keep the mesh state
/// current via gossip.
pub struct AtmosphereNode {
    pub node_config: NodeConfig,
    pub identity: Identity,
    pub registry: Arc<Registry>,
    pub cost: Arc<CostCollector>,
    pub cost_table: Arc<NodeCostTable>,
    pub gossip: Arc<GossipEngine>,
    pub router: Arc<Router>,
    pub executor: AsyncMutex<Executor>,
    pub approval: Arc<ApprovalGate>,
    /// Convergent local replica of the mesh view backing
    /// `/api/mesh/topology` (SPEC_FULL §B "CRDT-based shared state for
    /// mesh topology cache").
    pub topology: Arc<SharedState>,
    /// Present only when `node_config.audit_enabled` (§6 "audit.log ...
    /// if auditing is enabled").
    pub audit: Option<Arc<AuditLog>>,
    db: PartitionHandle,
    pub revoked_tokens: Arc<RwLock<HashSet<String>>>,
}

impl AtmosphereNode {
    /// Opens (or initializes) node state rooted at `storage_root`,
    /// recovering identity and the token revocation set from the
    /// embedded store (§4.1, §6 "Persisted state").
    pub fn new(storage_root: &Path, node_config: NodeConfig, approval_config: ApprovalConfig) -> Result<Self> {
        let storage_path = config::storage_path(storage_root);
        let keyspace = FjallConfig::new(&storage_path)
            .open()
            .map_err(|e| AtmosphereError::Internal(format!("opening storage at {}: {e}", storage_path.display())))?;
        let db = keyspace
            .open_partition(STATE_PARTITION, PartitionCreateOptions::default())
            .map_err(AtmosphereError::from)?;

        let signing_key = if let Some(bytes) = db.get("identity/signing_key").map_err(AtmosphereError::from)? {
            let bytes: [u8; 32] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| AtmosphereError::Internal("corrupt identity key in storage".into()))?;
            ed25519_dalek::SigningKey::from_bytes(&bytes)
        } else {
            let key = generate_keypair();
            db.insert("identity/signing_key", key.to_bytes().to_vec())
                .map_err(AtmosphereError::from)?;
            config::write_owner_only(&config::identity_key_path(storage_root), &key.to_bytes())?;
            key
        };

        // A node is its own mesh founder until it joins another mesh's
        // token chain; `mesh join` downgrades the in-memory role.
        let identity = Identity::new(signing_key, NodeRole::Founder);

        let mut revoked_tokens = HashSet::new();
        for item in db.prefix("tokens/revoked/") {
            let (key, _) = item.map_err(AtmosphereError::from)?;
            if let Some(token_id) = std::str::from_utf8(&key).ok().and_then(|s| s.strip_prefix("tokens/revoked/")) {
                revoked_tokens.insert(token_id.to_string());
            }
        }

        let local_node_id = identity.node_id.clone();
        let registry = Arc::new(Registry::new());
        let cost = Arc::new(CostCollector::new());
        let cost_table = Arc::new(NodeCostTable::new(local_node_id.clone()));
        let gossip = Arc::new(GossipEngine::new(local_node_id.clone()));
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let locality = Arc::new(NodeLocalityOracle {
            local_node_id: local_node_id.clone(),
        });
        let router = Arc::new(Router::new(
            registry.clone(),
            embedder,
            locality,
            cost_table.clone() as Arc<dyn CostTable>,
            local_node_id.clone(),
        ));
        let executor = AsyncMutex::new(Executor::new(local_node_id.clone(), Arc::new(NullRemoteInvoker)));
        let approval = Arc::new(ApprovalGate::new(approval_config));
        let topology = Arc::new(SharedState::new("topology"));
        let audit = if node_config.audit_enabled {
            Some(Arc::new(AuditLog::open(&config::audit_log_path(storage_root))?))
        } else {
            None
        };

        let node = Self {
            node_config,
            identity,
            registry,
            cost,
            cost_table,
            gossip,
            router,
            executor,
            approval,
            topology,
            audit,
            db,
            revoked_tokens: Arc::new(RwLock::new(revoked_tokens)),
        };
        node.load_persisted_capabilities()?;
        node.wire_gossip_handler();
        node.refresh_topology_snapshot();
        Ok(node)
    }

    pub fn local_node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// Installs the single gossip handler that keeps the Registry and
    /// `NodeCostTable` current as announcements arrive (§4.4 "Arrival").
    fn wire_gossip_handler(&self) {
        let registry = self.registry.clone();
        let cost_table = self.cost_table.clone();
        let revoked = self.revoked_tokens.clone();
        let topology = self.topology.clone();
        let local_node_id = self.identity.node_id.clone();

        self.gossip.on_announcement(Arc::new(move |announcement: Announcement| {
            if announcement.from_node == local_node_id {
                return;
            }
            let refreshes_topology = matches!(
                announcement.kind,
                AnnouncementKind::CapabilityAvailable
                    | AnnouncementKind::CapabilityHeartbeat
                    | AnnouncementKind::CapabilityRemoved
                    | AnnouncementKind::CostUpdate
            );
            match announcement.kind {
                AnnouncementKind::CapabilityAvailable | AnnouncementKind::CapabilityHeartbeat => {
                    match serde_json::from_value::<Capability>(announcement.payload.clone()) {
                        Ok(cap) => {
                            if registry.get(&cap.cap_id).is_some() {
                                let _ = registry.heartbeat(&cap.cap_id);
                            } else if let Err(err) =
                                registry.register_remote(cap, announcement.from_node.clone())
                            {
                                warn!(%err, "rejected remote capability announcement");
                            }
                        }
                        Err(err) => warn!(%err, "malformed capability announcement payload"),
                    }
                }
                AnnouncementKind::CapabilityRemoved => {
                    if let Some(cap_id) = announcement.payload.get("cap_id").and_then(|v| v.as_str()) {
                        let _ = registry.deregister(cap_id);
                    }
                }
                AnnouncementKind::CostUpdate => {
                    match serde_json::from_value::<atmosphere_core::CostFactors>(announcement.payload.clone()) {
                        Ok(factors) => cost_table.update_peer(&announcement.from_node, factors),
                        Err(err) => warn!(%err, "malformed cost_update payload"),
                    }
                }
                AnnouncementKind::TokenRevoked => {
                    if let Some(token_id) = announcement.payload.get("token_id").and_then(|v| v.as_str()) {
                        revoked.write().insert(token_id.to_string());
                    }
                }
                AnnouncementKind::NodeJoin | AnnouncementKind::NodeLeave => {
                    debug!(from = %announcement.from_node, kind = ?announcement.kind, "membership announcement");
                }
            }
            if refreshes_topology {
                topology.set_topology_snapshot(&compute_topology_snapshot(&local_node_id, &registry, &cost_table));
            }
        }));
    }

    /// Recomputes the topology snapshot from the current Registry and
    /// `NodeCostTable` and stores it in [`Self::topology`] (SPEC_FULL
    /// §B). Called after every local capability register/deregister and
    /// by [`Self::wire_gossip_handler`] on every announcement that
    /// changes the node/cost view.
    fn refresh_topology_snapshot(&self) {
        self.topology.set_topology_snapshot(&compute_topology_snapshot(
            self.local_node_id(),
            &self.registry,
            &self.cost_table,
        ));
    }

    fn load_persisted_capabilities(&self) -> Result<()> {
        for item in self.db.prefix("cap/") {
            let (_, value) = item.map_err(AtmosphereError::from)?;
            let cap: Capability = serde_json::from_slice(&value)?;
            self.registry.register_local(cap)?;
        }
        Ok(())
    }

    /// Registers a local capability, persists it so it survives
    /// restart (§6 "Persisted state": `cap/` prefix), and announces it
    /// if the Approval Gate permits exposure (§3, §4.8).
    pub fn register_local_capability(&self, cap: Capability) -> Result<()> {
        let cap_type = cap.cap_type.as_str().to_string();
        let label = cap.label.clone();
        let payload = serde_json::to_value(&cap)?;
        let key = format!("cap/{}", cap.cap_id);
        let bytes = serde_json::to_vec(&cap)?;
        self.db.insert(key, bytes).map_err(AtmosphereError::from)?;

        self.registry.register_local(cap)?;
        self.refresh_topology_snapshot();

        if self.approval.may_expose(&cap_type, &label) {
            let announcement = build_announcement(
                AnnouncementKind::CapabilityAvailable,
                self.local_node_id(),
                payload,
            );
            self.gossip.publish(announcement);
        }
        Ok(())
    }

    pub fn heartbeat_local_capability(&self, cap_id: &str) -> Result<()> {
        self.registry.heartbeat(cap_id)?;
        let announcement = build_announcement(
            AnnouncementKind::CapabilityHeartbeat,
            self.local_node_id(),
            serde_json::json!({"cap_id": cap_id}),
        );
        self.gossip.publish(announcement);
        Ok(())
    }

    pub fn deregister_local_capability(&self, cap_id: &str) -> Result<()> {
        let _ = self.registry.deregister(cap_id);
        self.db
            .remove(format!("cap/{cap_id}"))
            .map_err(AtmosphereError::from)?;
        self.refresh_topology_snapshot();
        let announcement = build_announcement(
            AnnouncementKind::CapabilityRemoved,
            self.local_node_id(),
            serde_json::json!({"cap_id": cap_id}),
        );
        self.gossip.publish(announcement);
        Ok(())
    }

    /// Issues a join token for a new mesh this node founds (§4.1).
    pub fn issue_join_token(
        &self,
        mesh_id: &str,
        mesh_name: &str,
        grants: Vec<String>,
        ttl_secs: Option<f64>,
        endpoints: JoinEndpoints,
    ) -> Result<Token> {
        self.identity.issue_token(mesh_id, mesh_name, grants, ttl_secs, endpoints)
    }

    /// Revokes a previously issued token: records it locally and
    /// gossips the revocation so every node's `revoked_tokens` set
    /// converges (§4.1 "revocation").
    pub fn revoke_token(&self, token_id: &str) -> Result<()> {
        self.db
            .insert(format!("tokens/revoked/{token_id}"), b"1".to_vec())
            .map_err(AtmosphereError::from)?;
        self.revoked_tokens.write().insert(token_id.to_string());
        let announcement = build_announcement(
            AnnouncementKind::TokenRevoked,
            self.local_node_id(),
            serde_json::json!({"token_id": token_id}),
        );
        self.gossip.publish(announcement);
        Ok(())
    }

    pub fn is_token_revoked(&self, token_id: &str) -> bool {
        self.revoked_tokens.read().contains(token_id)
    }

    /// Routes an intent to a capability per §4.5, without invoking it.
    pub fn route(&self, intent: &Intent) -> Result<router::RouteResult> {
        self.router.route(intent)
    }

    /// Routes and invokes in one call, pushing the sampled current
    /// queue depth into the cost table first (§4.3 "queue_depth").
    pub async fn route_and_execute(
        &self,
        intent: &Intent,
        tool_name: Option<&str>,
        payload: serde_json::Value,
        deadline: std::time::Instant,
    ) -> Result<executor::ExecuteOutcome> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let route_result = self.router.route(intent);
        let chosen_cap_id = route_result.as_ref().ok().map(|r| r.chosen_cap.cap_id.clone());

        let outcome = async {
            let result = route_result?;
            self.approval.authorize_invoke(
                result.chosen_cap.node_id.as_str(),
                self.node_config.mesh_name.as_deref().unwrap_or(""),
                true,
                0,
            )?;
            let executor = self.executor.lock().await;
            executor.execute(&result, tool_name, payload, deadline).await
        }
        .await;

        if let Some(audit) = &self.audit {
            audit.record(
                &request_id,
                intent.text(),
                chosen_cap_id.as_deref(),
                outcome.as_ref().map(|_| "ok").unwrap_or_else(|e| e.kind()),
            );
        }
        outcome
    }

    /// Replaces the executor's remote invoker, e.g. once a
    /// [`transport::MeshTransport`] session is established.
    pub async fn set_remote_invoker(&self, invoker: Arc<dyn RemoteInvoker>) {
        let mut executor = self.executor.lock().await;
        *executor = Executor::new(self.local_node_id().to_string(), invoker);
    }

    pub async fn register_local_handler(&self, cap_id: String, handler: Arc<dyn executor::LocalHandler>) {
        self.executor.lock().await.register_handler(cap_id, handler);
    }

    /// Registers a `tool/*` capability whose handler is a WASM module
    /// rather than a native in-process implementation (SPEC_FULL §B
    /// "WASM-sandboxed tool execution"): persists/announces `cap` the
    /// same way [`Self::register_local_capability`] does, then wires an
    /// [`executor::WasmToolHandler`] backed by a fresh `wasmtime`
    /// engine so the Executor's local path can invoke it.
    pub async fn register_wasm_tool_capability(
        &self,
        cap: Capability,
        module_bytes: Vec<u8>,
        fuel_budget: u64,
    ) -> Result<()> {
        let cap_id = cap.cap_id.clone();
        self.register_local_capability(cap)?;
        let runtime: Arc<dyn atmosphere_compute::ComputeRuntime> =
            Arc::new(atmosphere_compute::wasm::WasmTimeRuntime::new().map_err(|e| {
                AtmosphereError::Internal(format!("wasmtime engine init: {e}"))
            })?);
        let handler = Arc::new(executor::WasmToolHandler::new(runtime, module_bytes, fuel_budget));
        self.register_local_handler(cap_id, handler).await;
        Ok(())
    }

    /// Runs the staleness sweep on a fixed interval until `shutdown`
    /// resolves (§4.2 "Sweep"). Meant to be spawned as a background
    /// task alongside [`CostCollector::run`] and the gossip transport
    /// loop.
    pub async fn run_sweep(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.node_config.sweep_interval_seconds,
        ));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.registry.sweep();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
