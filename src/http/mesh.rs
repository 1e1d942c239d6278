//! `/api/mesh/*` handlers (§6): status, token issuance, join, peers,
//! topology.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use atmosphere_core::{JoinEndpoints, Token};

use super::{AppState, HttpResult};
use crate::identity::NodeRole;

#[derive(Serialize)]
pub struct MeshStatus {
    pub mesh_id: Option<String>,
    pub mesh_name: Option<String>,
    pub node_id: String,
    pub role: &'static str,
    pub node_count: usize,
    pub peer_count: usize,
    pub capabilities: usize,
}

pub async fn status(State(state): State<AppState>) -> Json<MeshStatus> {
    let node_ids: std::collections::HashSet<String> = state
        .registry
        .all_online()
        .into_iter()
        .map(|cap| cap.node_id)
        .collect();
    let peer_count = node_ids.iter().filter(|id| id.as_str() != state.local_node_id()).count();

    Json(MeshStatus {
        mesh_id: state.node_config.mesh_name.clone(),
        mesh_name: state.node_config.mesh_name.clone(),
        node_id: state.local_node_id().to_string(),
        role: match state.identity.role {
            NodeRole::Founder => "founder",
            NodeRole::Member => "member",
        },
        node_count: node_ids.len(),
        peer_count,
        capabilities: state.registry.len(),
    })
}

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub mesh_id: String,
    pub mesh_name: String,
    #[serde(default)]
    pub grants: Vec<String>,
    pub ttl_secs: Option<f64>,
    pub endpoints: JoinEndpoints,
}

#[derive(Serialize)]
pub struct IssueTokenResponse {
    pub token: Token,
    pub endpoints: JoinEndpoints,
    pub qr_data: String,
}

/// `atmosphere://join?token=<id>&mesh=<id>&endpoints=<url-encoded-JSON>`
/// per §6's QR encoding note. The legacy `&endpoint=<single>` form is a
/// decode-side concern (`join`, below), not something we emit.
fn qr_data(token: &Token) -> String {
    let endpoints_json = serde_json::to_string(&token.endpoints).unwrap_or_default();
    let encoded_endpoints = urlencoding_lite(&endpoints_json);
    format!(
        "atmosphere://join?token={}&mesh={}&endpoints={}",
        token.token_id, token.mesh_id, encoded_endpoints
    )
}

/// Minimal percent-encoding for the handful of characters JSON produces
/// in a query string (`url` crate's `Url` type is for parsing full
/// URLs, not encoding a single component, so this stays hand-rolled).
fn urlencoding_lite(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

pub async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<IssueTokenRequest>,
) -> HttpResult<Json<IssueTokenResponse>> {
    let token = state.issue_join_token(
        &request.mesh_id,
        &request.mesh_name,
        request.grants,
        request.ttl_secs,
        request.endpoints.clone(),
    )?;
    Ok(Json(IssueTokenResponse {
        qr_data: qr_data(&token),
        endpoints: request.endpoints,
        token,
    }))
}

#[derive(Deserialize)]
pub struct JoinRequest {
    pub token: Token,
}

#[derive(Serialize)]
pub struct JoinResponse {
    pub accepted: bool,
    pub node_id: String,
}

/// Verifies the token against this node's recorded mesh public key and
/// revocation set (§4.1). Actual session establishment happens at the
/// transport layer once the token is accepted; this endpoint is the
/// HTTP-facing half of the handshake described in §4.7.
pub async fn join(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> HttpResult<Json<JoinResponse>> {
    crate::identity::verify_token(&request.token, &state.identity.verifying_key(), &state.revoked_tokens.read())?;
    Ok(Json(JoinResponse {
        accepted: true,
        node_id: state.local_node_id().to_string(),
    }))
}

#[derive(Serialize)]
pub struct PeerSummary {
    pub node_id: String,
    pub last_heartbeat: f64,
    pub capabilities: usize,
}

pub async fn peers(State(state): State<AppState>) -> Json<Vec<PeerSummary>> {
    let mut by_node: HashMap<String, (f64, usize)> = HashMap::new();
    for cap in state.registry.all_online() {
        if cap.node_id == state.local_node_id() {
            continue;
        }
        let entry = by_node.entry(cap.node_id).or_insert((0.0, 0));
        entry.0 = entry.0.max(cap.last_heartbeat);
        entry.1 += 1;
    }
    let peers = by_node
        .into_iter()
        .map(|(node_id, (last_heartbeat, capabilities))| PeerSummary {
            node_id,
            last_heartbeat,
            capabilities,
        })
        .collect();
    Json(peers)
}

#[derive(Serialize)]
pub struct TopologyNode {
    pub node_id: String,
    pub cost_summary: f64,
}

#[derive(Serialize)]
pub struct TopologyLink {
    pub from: String,
    pub to: String,
}

#[derive(Serialize)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
    pub links: Vec<TopologyLink>,
}

/// Answers from the converged CRDT topology cache (SPEC_FULL §B), not a
/// live registry/cost-table scan: `state.topology` is kept current by
/// `AtmosphereNode::refresh_topology_snapshot` on every local
/// register/deregister and by the gossip handler on every remote
/// announcement that changes the node or cost view. A node that hasn't
/// registered or heard of any capability yet has no snapshot; fall back
/// to a single-node view of just the local node rather than an empty
/// response.
pub async fn topology(State(state): State<AppState>) -> Json<Topology> {
    let local = state.local_node_id().to_string();
    let snapshot = state.topology.topology_snapshot().unwrap_or_else(|| crate::sync::TopologySnapshot {
        nodes: vec![(local.clone(), 0.0)],
    });

    let nodes = snapshot
        .nodes
        .iter()
        .map(|(node_id, cost)| TopologyNode {
            node_id: node_id.clone(),
            cost_summary: *cost,
        })
        .collect();
    let links = snapshot
        .nodes
        .iter()
        .filter(|(node_id, _)| node_id != &local)
        .map(|(node_id, _)| TopologyLink {
            from: local.clone(),
            to: node_id.clone(),
        })
        .collect();

    Json(Topology { nodes, links })
}
