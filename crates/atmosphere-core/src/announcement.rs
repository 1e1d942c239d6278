//! The gossip envelope (§3 Announcement, §4.4, §6 wire format).

use alloc::string::String;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    CapabilityAvailable,
    CapabilityHeartbeat,
    CapabilityRemoved,
    CostUpdate,
    TokenRevoked,
    NodeJoin,
    NodeLeave,
}

/// A gossip envelope. `payload` is kept as raw JSON so that unknown
/// fields inside it survive forwarding unexamined (§6: "Unknown fields
/// MUST be preserved on forwarding") even though this node's own
/// `serde_json::Value` parse only looks at the fields it recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub kind: AnnouncementKind,
    pub from_node: String,
    pub payload: serde_json::Value,
    /// Unix seconds, float, per §6.
    pub timestamp: f64,
    /// Hops remaining; decremented on each forward, never forwarded at 0.
    pub ttl: u8,
    /// 16-byte value, hex-encoded on the wire; unique per (from_node, kind).
    pub nonce: String,
}

impl Announcement {
    pub const MAX_TTL: u8 = 10;

    /// A copy suitable for re-publishing to the next hop: `ttl` decremented.
    /// Caller must check `self.ttl > 1` before forwarding at all (§4.4).
    pub fn forwarded(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }

    pub fn dedup_key(&self) -> (String, AnnouncementKind, String) {
        (self.from_node.clone(), self.kind, self.nonce.clone())
    }
}
