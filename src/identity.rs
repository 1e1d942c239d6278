//! Node identity and join tokens (§4.1).
//!
//! Ed25519 for size and offline verification, with a key persisted
//! locally rather than re-derived each run. `node_id` is a
//! stable prefix of the hash of the node's public key rather than the
//! key itself, so it stays short in logs and gossip payloads.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use atmosphere_core::{JoinEndpoints, Token};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{AtmosphereError, Result};

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// `node_id` is the first 16 hex characters (8 bytes) of SHA-256 of the
/// compressed public key. Stable for the life of the keypair.
pub fn node_id_from_pubkey(pk: &VerifyingKey) -> String {
    let digest = Sha256::digest(pk.as_bytes());
    hex::encode(&digest[..8])
}

/// A node's role within a mesh: only founders may issue tokens unless
/// they hold delegated signing authority (§4.1 "not_authorized" on
/// issuance). Delegation itself is out of scope for the core; a
/// non-founder issuer is always rejected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Founder,
    Member,
}

pub struct Identity {
    pub signing_key: SigningKey,
    pub node_id: String,
    pub role: NodeRole,
}

impl Identity {
    pub fn new(signing_key: SigningKey, role: NodeRole) -> Self {
        let node_id = node_id_from_pubkey(&signing_key.verifying_key());
        Self {
            signing_key,
            node_id,
            role,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issues a join token for this mesh. Fails with `NotAuthorized` if
    /// this node is not the founder (§4.1).
    pub fn issue_token(
        &self,
        mesh_id: &str,
        mesh_name: &str,
        grants: Vec<String>,
        ttl_secs: Option<f64>,
        endpoints: JoinEndpoints,
    ) -> Result<Token> {
        if self.role != NodeRole::Founder {
            return Err(AtmosphereError::NotAuthorized(
                "only the mesh founder may issue join tokens".into(),
            ));
        }
        if endpoints.is_empty() {
            return Err(AtmosphereError::Validation(
                "token must advertise at least one endpoint".into(),
            ));
        }

        let issued_at = now_unix();
        let expires_at = issued_at + ttl_secs.unwrap_or(Token::DEFAULT_TTL_SECS);
        let token_id = uuid::Uuid::new_v4().to_string();

        let mut unsigned = Token {
            token_id,
            mesh_id: mesh_id.to_string(),
            mesh_name: mesh_name.to_string(),
            issuer_node_id: self.node_id.clone(),
            grants,
            issued_at,
            expires_at,
            endpoints,
            signature_b64: String::new(),
        };
        let signature = self.signing_key.sign(&unsigned.signing_payload());
        unsigned.signature_b64 = BASE64.encode(signature.to_bytes());
        Ok(unsigned)
    }
}

/// Verifies a token entirely offline: no network call, no clock
/// service beyond the host clock (§4.1). `revocation_set` holds
/// token_ids revoked via gossip `token_revoked` announcements.
pub fn verify_token(
    token: &Token,
    mesh_pubkey: &VerifyingKey,
    revocation_set: &HashSet<String>,
) -> Result<()> {
    let signature_bytes = BASE64
        .decode(&token.signature_b64)
        .map_err(|_| AtmosphereError::NotAuthorized("invalid_signature".into()))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|_| AtmosphereError::NotAuthorized("invalid_signature".into()))?;

    mesh_pubkey
        .verify(&token.signing_payload(), &signature)
        .map_err(|_| AtmosphereError::NotAuthorized("invalid_signature".into()))?;

    if revocation_set.contains(&token.token_id) {
        return Err(AtmosphereError::NotAuthorized("revoked".into()));
    }

    if token.is_expired(now_unix()) {
        return Err(AtmosphereError::NotAuthorized("expired".into()));
    }

    Ok(())
}
