//! Gossip Engine (§4.4): dedupes and forwards announcements, and drives
//! the periodic fan-out of capability heartbeats and cost updates.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use atmosphere_core::{Announcement, AnnouncementKind};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Bounded nonce cache capacity (§4.4 "Fan-out").
pub const NONCE_CACHE_CAPACITY: usize = 10_000;
/// §4.4 "Ordering": reject out-of-order updates from a single
/// `(from_node, kind)` stream older than this relative to the latest
/// applied timestamp.
pub const CLOCK_SKEW_TOLERANCE_SECS: f64 = 5.0 * 60.0;

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub type AnnouncementHandler = Arc<dyn Fn(Announcement) + Send + Sync>;

/// Single-writer, thread-safe insert-and-check nonce cache (§5 "Gossip
/// nonce cache"). `seen` returns `true` exactly once per distinct
/// `(from_node, kind, nonce)` triple.
struct NonceCache {
    cache: Mutex<LruCache<(String, AnnouncementKind, String), ()>>,
}

impl NonceCache {
    fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity must be nonzero"),
            )),
        }
    }

    fn seen(&self, key: (String, AnnouncementKind, String)) -> bool {
        let mut cache = self.cache.lock();
        if cache.contains(&key) {
            true
        } else {
            cache.put(key, ());
            false
        }
    }
}

/// Tracks the latest-applied timestamp per `(from_node, kind)` stream
/// for the stale-drop ordering rule.
struct OrderingTable {
    latest: Mutex<std::collections::HashMap<(String, AnnouncementKind), f64>>,
}

impl OrderingTable {
    fn new() -> Self {
        Self {
            latest: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Returns `true` if `announcement` is fresh enough to apply, and
    /// if so, records its timestamp as the new high-water mark.
    fn admit(&self, announcement: &Announcement) -> bool {
        let key = (announcement.from_node.clone(), announcement.kind);
        let mut latest = self.latest.lock();
        let entry = latest.entry(key).or_insert(f64::MIN);
        if announcement.timestamp + CLOCK_SKEW_TOLERANCE_SECS < *entry {
            return false;
        }
        if announcement.timestamp > *entry {
            *entry = announcement.timestamp;
        }
        true
    }
}

/// A destination the engine can forward announcements to, abstracting
/// over whatever sits underneath (libp2p gossipsub topic, direct
/// session, test harness channel).
#[async_trait::async_trait]
pub trait Peer: Send + Sync {
    fn peer_id(&self) -> &str;
    async fn send(&self, announcement: Announcement);
}

pub struct GossipEngine {
    node_id: String,
    nonce_cache: NonceCache,
    ordering: OrderingTable,
    handlers: Mutex<Vec<AnnouncementHandler>>,
    outbound: mpsc::UnboundedSender<Announcement>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Announcement>>>,
}

impl GossipEngine {
    pub fn new(node_id: String) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        Self {
            node_id,
            nonce_cache: NonceCache::new(NONCE_CACHE_CAPACITY),
            ordering: OrderingTable::new(),
            handlers: Mutex::new(Vec::new()),
            outbound,
            outbound_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn on_announcement(&self, handler: AnnouncementHandler) {
        self.handlers.lock().push(handler);
    }

    /// Takes ownership of the outbound queue; the transport layer
    /// drains this to actually write bytes to peers. May only be called
    /// once per engine instance.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Announcement>> {
        self.outbound_rx.lock().take()
    }

    /// Publishes a freshly-originated announcement: marks it seen
    /// locally (so an echoed copy doesn't get re-handled) and queues it
    /// for transmission.
    pub fn publish(&self, mut announcement: Announcement) {
        if announcement.from_node.is_empty() {
            announcement.from_node = self.node_id.clone();
        }
        if announcement.nonce.is_empty() {
            announcement.nonce = uuid::Uuid::new_v4().to_string();
        }
        self.nonce_cache.seen(announcement.dedup_key());
        self.ordering.admit(&announcement);
        let _ = self.outbound.send(announcement);
    }

    /// Handles an inbound announcement from a peer: dedupes, checks
    /// ordering, runs handlers, and re-queues a decremented-TTL copy
    /// for forwarding if still alive.
    pub fn receive(&self, announcement: Announcement) {
        let key = announcement.dedup_key();
        if self.nonce_cache.seen(key) {
            trace!(
                from_node = %announcement.from_node,
                kind = ?announcement.kind,
                "dropping duplicate announcement"
            );
            return;
        }

        if !self.ordering.admit(&announcement) {
            trace!(
                from_node = %announcement.from_node,
                kind = ?announcement.kind,
                "dropping stale out-of-order announcement"
            );
            return;
        }

        for handler in self.handlers.lock().iter() {
            handler(announcement.clone());
        }

        if announcement.ttl > 1 {
            let forwarded = announcement.forwarded();
            if self.outbound.send(forwarded).is_err() {
                warn!("gossip outbound channel closed, dropping forward");
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Builds a fresh, unsigned-nonce `capability_available`/`capability_heartbeat`/
/// `capability_removed`/`cost_update`/`token_revoked`/`node_join`/`node_leave`
/// announcement ready for [`GossipEngine::publish`].
pub fn build_announcement(
    kind: AnnouncementKind,
    from_node: &str,
    payload: serde_json::Value,
) -> Announcement {
    Announcement {
        kind,
        from_node: from_node.to_string(),
        payload,
        timestamp: now_unix(),
        ttl: Announcement::MAX_TTL,
        nonce: uuid::Uuid::new_v4().to_string(),
    }
}
