//! Router (§4.5 "Routing algorithm"): combines semantic score, cost,
//! locality, and availability to choose a capability for an intent.

use std::collections::HashMap;
use std::sync::Arc;

use atmosphere_core::Capability;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cost::{cost_for, WorkType, MIN_COST_DIFFERENCE};
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{AtmosphereError, Result};
use crate::registry::Registry;

/// Minimum cosine similarity for a candidate to be considered at all
/// (§4.5 step 4).
pub const SIMILARITY_THRESHOLD: f32 = 0.5;
/// Fixed boost applied when the intent matches a capability's `topics`
/// or `route_hint` globs (§4.5 step 5), capped at similarity 1.0.
pub const KEYWORD_BOOST: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    SameNode,
    SameLan,
    Remote,
    HighLatency,
}

impl Locality {
    /// §4.5 step 7: same-node x1.3, same-LAN x1.1, >200ms RTT /1.25.
    pub fn multiplier(self) -> f64 {
        match self {
            Locality::SameNode => 1.3,
            Locality::SameLan => 1.1,
            Locality::Remote => 1.0,
            Locality::HighLatency => 1.0 / 1.25,
        }
    }
}

/// One of the three intent shapes the router accepts (§4.5 "Routing algorithm").
#[derive(Debug, Clone)]
pub enum Intent {
    /// `"namespace/project"` or `"node_id:cap_label"` — short-circuits
    /// straight to that capability if it's a known `cap_id`.
    ExplicitPath(String),
    Typed {
        cap_type: Option<String>,
        text: String,
        preferences: HashMap<String, String>,
    },
    NaturalLanguage(String),
    /// Like `ExplicitPath`, but if `path` doesn't resolve to a known
    /// `cap_id`/`node_id:label`, falls through to a typed route against
    /// `cap_type` using `text` rather than treating `path` itself as
    /// the embedding query. Used by the OpenAI-compatible surface
    /// (`src/http/compat.rs`) so an unrecognized `model` string still
    /// resolves to some capability of the right category instead of
    /// having its literal bytes embedded and scored against every type.
    ExplicitPathWithFallback {
        path: String,
        cap_type: String,
        text: String,
    },
}

impl Intent {
    pub fn text(&self) -> &str {
        match self {
            Intent::ExplicitPath(s) => s,
            Intent::Typed { text, .. } => text,
            Intent::NaturalLanguage(s) => s,
            Intent::ExplicitPathWithFallback { text, .. } => text,
        }
    }

    /// SHA-256 of a normalized form of the intent, used as the
    /// hysteresis key (§4.5 step 8).
    pub fn fingerprint(&self) -> String {
        let normalized = self.text().trim().to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        hex::encode(digest)
    }
}

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub chosen_cap: Capability,
    pub score: f64,
    pub reasoning: String,
    pub alternatives: Vec<(String, f64)>,
}

/// Resolves candidate locality relative to the local node. Kept as a
/// trait so the router doesn't need to know about transport-level RTT
/// tracking directly.
pub trait LocalityOracle: Send + Sync {
    fn locality_of(&self, node_id: &str) -> Locality;
}

pub struct AlwaysRemote;
impl LocalityOracle for AlwaysRemote {
    fn locality_of(&self, _node_id: &str) -> Locality {
        Locality::Remote
    }
}

/// Per-owner cost lookup: local collector for the local node, gossip
/// cost table for everyone else (§4.5 step 6).
pub trait CostTable: Send + Sync {
    fn cost_for_node(&self, node_id: &str, work_type: WorkType) -> f64;
}

pub struct Router {
    registry: Arc<Registry>,
    embedder: Arc<dyn Embedder>,
    locality: Arc<dyn LocalityOracle>,
    cost_table: Arc<dyn CostTable>,
    local_node_id: String,
    last_winner: Mutex<HashMap<String, (String, f64)>>,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        embedder: Arc<dyn Embedder>,
        locality: Arc<dyn LocalityOracle>,
        cost_table: Arc<dyn CostTable>,
        local_node_id: String,
    ) -> Self {
        Self {
            registry,
            embedder,
            locality,
            cost_table,
            local_node_id,
            last_winner: Mutex::new(HashMap::new()),
        }
    }

    fn work_type_for(cap_type: &str) -> WorkType {
        match cap_type.split('/').next() {
            Some("llm") | Some("vision") | Some("ml") => WorkType::Inference,
            Some("sensor") => WorkType::SensorRead,
            Some("tool") => WorkType::ToolCall,
            _ => WorkType::General,
        }
    }

    pub fn route(&self, intent: &Intent) -> Result<RouteResult> {
        // Step 1: explicit short-circuit.
        let explicit_path = match intent {
            Intent::ExplicitPath(path) => Some(path.as_str()),
            Intent::ExplicitPathWithFallback { path, .. } => Some(path.as_str()),
            _ => None,
        };
        if let Some(path) = explicit_path {
            if let Some(cap) = self.registry.get(path) {
                return Ok(RouteResult {
                    chosen_cap: cap,
                    score: f64::INFINITY,
                    reasoning: "explicit path match".into(),
                    alternatives: vec![],
                });
            }
            if let Some(cap) = self.resolve_node_label_path(path) {
                return Ok(RouteResult {
                    chosen_cap: cap,
                    score: f64::INFINITY,
                    reasoning: "explicit node_id:label match".into(),
                    alternatives: vec![],
                });
            }
        }

        // Step 2: embed intent. For `ExplicitPathWithFallback`, `text()`
        // is the caller's fallback text, not the unresolved path, so an
        // unrecognized model name never gets embedded as if it were the
        // query itself (§4.5 step 2 operates on the intent's content).
        let query_vector = self.embedder.embed(intent.text());

        // Step 3: candidate filter (online, type-matched if typed).
        let required_type = match intent {
            Intent::Typed {
                cap_type: Some(t), ..
            } => Some(t.clone()),
            Intent::ExplicitPathWithFallback { cap_type, .. } => Some(cap_type.clone()),
            _ => None,
        };
        let candidates: Vec<Capability> = match &required_type {
            Some(t) => self.registry.find_by_type(t),
            None => self.registry.all_online(),
        }
        .into_iter()
        .filter(|c| c.status == atmosphere_core::CapabilityStatus::Online)
        .collect();

        if candidates.is_empty() {
            return Err(AtmosphereError::NoCapability);
        }

        // Steps 4-5: semantic score + keyword boost.
        let text_lower = intent.text().to_lowercase();
        let mut scored: Vec<(Capability, f32)> = candidates
            .into_iter()
            .filter_map(|cap| {
                let similarity = cosine_similarity(&query_vector, &cap.embedding_vector);
                let boosted = if self.matches_keywords(&cap, &text_lower) {
                    (similarity + KEYWORD_BOOST).min(1.0)
                } else {
                    similarity
                };
                if boosted >= SIMILARITY_THRESHOLD {
                    Some((cap, boosted))
                } else {
                    None
                }
            })
            .collect();

        if scored.is_empty() {
            return Err(AtmosphereError::NoCapability);
        }

        // Steps 6-8: cost, locality, combined score.
        let mut combined: Vec<(Capability, f64, f32)> = scored
            .drain(..)
            .map(|(cap, semantic)| {
                let work_type = Self::work_type_for(cap.cap_type.as_str());
                let cost = self.cost_table.cost_for_node(&cap.node_id, work_type);
                let locality = if cap.node_id == self.local_node_id {
                    Locality::SameNode
                } else {
                    self.locality.locality_of(&cap.node_id)
                };
                let score = (semantic as f64) * locality.multiplier() / cost;
                (cap, score, semantic)
            })
            .collect();

        // §8 "Routing determinism": deterministic up to ties, tie-break
        // by `cap_id` lexicographic — candidate order out of the
        // registry's indices is not otherwise guaranteed.
        combined.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cap_id.cmp(&b.0.cap_id)));

        let fingerprint = intent.fingerprint();
        let (winner, winner_score, winner_semantic) = combined[0].clone();

        let final_choice = {
            let mut last_winner = self.last_winner.lock();
            match last_winner.get(&fingerprint) {
                Some((prior_cap_id, prior_score))
                    if winner.cap_id != *prior_cap_id
                        && winner_score < prior_score * (1.0 + MIN_COST_DIFFERENCE) =>
                {
                    // Hysteresis: keep the prior winner unless the new
                    // best clears it by the configured margin.
                    if let Some(prior_cap) = self.registry.get(prior_cap_id) {
                        debug!(
                            fingerprint = %fingerprint,
                            prior = %prior_cap_id,
                            challenger = %winner.cap_id,
                            "hysteresis kept prior routing winner"
                        );
                        (prior_cap, *prior_score)
                    } else {
                        last_winner.insert(fingerprint.clone(), (winner.cap_id.clone(), winner_score));
                        (winner.clone(), winner_score)
                    }
                }
                _ => {
                    last_winner.insert(fingerprint.clone(), (winner.cap_id.clone(), winner_score));
                    (winner.clone(), winner_score)
                }
            }
        };

        let alternatives = combined
            .iter()
            .filter(|(cap, _, _)| cap.cap_id != final_choice.0.cap_id)
            .take(3)
            .map(|(cap, score, _)| (cap.cap_id.clone(), *score))
            .collect();

        Ok(RouteResult {
            chosen_cap: final_choice.0,
            score: final_choice.1,
            reasoning: format!(
                "semantic={winner_semantic:.3} combined={:.3} via {} candidates",
                final_choice.1,
                combined.len()
            ),
            alternatives,
        })
    }

    fn resolve_node_label_path(&self, path: &str) -> Option<Capability> {
        let (node_id, label) = path.split_once(':')?;
        self.registry
            .find_by_node(node_id)
            .into_iter()
            .find(|c| c.label == label)
    }

    fn matches_keywords(&self, cap: &Capability, text_lower: &str) -> bool {
        if cap.topics.iter().any(|t| text_lower.contains(&t.to_lowercase())) {
            return true;
        }
        cap.triggers.iter().any(|t| {
            globset::Glob::new(&t.route_hint)
                .map(|g| g.compile_matcher().is_match(text_lower))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use atmosphere_core::{Capability, CapabilityStatus, CapabilityType};

    struct FixedCost(f64);
    impl CostTable for FixedCost {
        fn cost_for_node(&self, _node_id: &str, _work_type: WorkType) -> f64 {
            self.0
        }
    }

    fn make_cap(cap_id: &str, node_id: &str, label: &str, embedder: &HashingEmbedder, text: &str) -> Capability {
        Capability {
            cap_id: cap_id.into(),
            node_id: node_id.into(),
            cap_type: CapabilityType::llm_chat(),
            label: label.into(),
            description: text.into(),
            embedding_vector: embedder.embed(text),
            topics: vec![],
            tools: vec![],
            triggers: vec![],
            metadata: Default::default(),
            status: CapabilityStatus::Online,
            last_heartbeat: 0.0,
        }
    }

    fn build_router(caps: Vec<Capability>, local_node_id: &str) -> Router {
        let registry = Arc::new(Registry::new());
        for cap in caps {
            registry.register_local(cap).unwrap();
        }
        Router::new(
            registry,
            Arc::new(HashingEmbedder::default()),
            Arc::new(AlwaysRemote),
            Arc::new(FixedCost(1.0)),
            local_node_id.to_string(),
        )
    }

    #[test]
    fn explicit_path_short_circuits() {
        let embedder = HashingEmbedder::default();
        let cap = make_cap("n1:chat", "n1", "chat", &embedder, "a chat assistant");
        let router = build_router(vec![cap], "n1");

        let result = router.route(&Intent::ExplicitPath("n1:chat".into())).unwrap();
        assert_eq!(result.chosen_cap.cap_id, "n1:chat");
        assert!(result.score.is_infinite());
    }

    #[test]
    fn no_capability_found_below_threshold() {
        let embedder = HashingEmbedder::default();
        let cap = make_cap("n1:weather", "n1", "weather", &embedder, "fetch the weather forecast");
        let router = build_router(vec![cap], "n1");

        let result = router.route(&Intent::NaturalLanguage("compose a symphony in D minor".into()));
        assert!(result.is_err());
    }

    #[test]
    fn semantic_match_picks_closest_capability() {
        let embedder = HashingEmbedder::default();
        let chat = make_cap("n1:chat", "n1", "chat", &embedder, "chat with a large language model");
        let vision = make_cap("n2:vision", "n2", "vision", &embedder, "detect objects in an image frame");
        let router = build_router(vec![chat, vision], "n1");

        let result = router
            .route(&Intent::NaturalLanguage("chat with a large language model".into()))
            .unwrap();
        assert_eq!(result.chosen_cap.cap_id, "n1:chat");
    }

    #[test]
    fn hysteresis_keeps_prior_winner_on_marginal_improvement() {
        let embedder = HashingEmbedder::default();
        let a = make_cap("n1:a", "n1", "a", &embedder, "general purpose assistant chat");
        let b = make_cap("n2:b", "n2", "b", &embedder, "general purpose assistant chat helper");
        let router = build_router(vec![a, b], "n1");

        let intent = Intent::NaturalLanguage("general purpose assistant chat".into());
        let first = router.route(&intent).unwrap();
        let second = router.route(&intent).unwrap();
        assert_eq!(first.chosen_cap.cap_id, second.chosen_cap.cap_id);
    }
}
