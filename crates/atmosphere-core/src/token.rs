//! Join credential wire format (§3 Token, §4.1, §6 "Join token wire format").
//!
//! Signing and verification live in the node crate's `identity` module,
//! which is the only place that needs `ed25519-dalek`; this crate only
//! needs to know the shape of the record that gets signed and carried.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// The up-to-three endpoints a node advertises for multi-path join
/// (§4.7). At least one must be present; enforced by the issuer, not
/// by this type, so that a token can still be deserialized for
/// inspection even if it was issued before that rule existed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinEndpoints {
    pub local: Option<String>,
    pub public: Option<String>,
    pub relay: Option<String>,
}

impl JoinEndpoints {
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.public.is_none() && self.relay.is_none()
    }

    /// Attempt order per §4.7: local, then public, then relay.
    pub fn in_preference_order(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::with_capacity(3);
        if let Some(v) = &self.local {
            out.push(("local", v.as_str()));
        }
        if let Some(v) = &self.public {
            out.push(("public", v.as_str()));
        }
        if let Some(v) = &self.relay {
            out.push(("relay", v.as_str()));
        }
        out
    }
}

/// A join credential. `signature_b64` is a base64 Ed25519 signature
/// over the canonical serialization of every other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    pub mesh_id: String,
    pub mesh_name: String,
    pub issuer_node_id: String,
    /// Capability-type globs the bearer is allowed to register/use once
    /// joined, e.g. `["llm/*", "tool/weather"]`.
    pub grants: Vec<String>,
    /// Unix seconds.
    pub issued_at: f64,
    /// Unix seconds. Default 24h from `issued_at` at issuance time.
    pub expires_at: f64,
    pub endpoints: JoinEndpoints,
    pub signature_b64: String,
}

impl Token {
    pub const DEFAULT_TTL_SECS: f64 = 24.0 * 60.0 * 60.0;
    /// Clock-skew tolerance for expiry checks (§4.1).
    pub const CLOCK_SKEW_TOLERANCE_SECS: f64 = 5.0 * 60.0;

    /// The bytes that `signature_b64` signs over: every field except
    /// the signature itself, in a fixed field order so issuer and
    /// verifier always agree on the canonical form.
    pub fn signing_payload(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Unsigned<'a> {
            token_id: &'a str,
            mesh_id: &'a str,
            mesh_name: &'a str,
            issuer_node_id: &'a str,
            grants: &'a [String],
            issued_at: f64,
            expires_at: f64,
            endpoints: &'a JoinEndpoints,
        }
        let unsigned = Unsigned {
            token_id: &self.token_id,
            mesh_id: &self.mesh_id,
            mesh_name: &self.mesh_name,
            issuer_node_id: &self.issuer_node_id,
            grants: &self.grants,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            endpoints: &self.endpoints,
        };
        serde_json::to_string(&unsigned)
            .map(|s| s.into_bytes())
            .unwrap_or_default()
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now > self.expires_at + Self::CLOCK_SKEW_TOLERANCE_SECS
    }
}
