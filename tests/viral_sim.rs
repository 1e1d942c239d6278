use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use atmosphere::gossip::{build_announcement, GossipEngine};
use atmosphere_core::AnnouncementKind;

/// A tiny fully-connected mesh of in-process gossip engines, wired so
/// each engine's outbound queue is drained and re-delivered to every
/// other engine. Stands in for a real transport in these tests.
struct Swarm {
    engines: Vec<Arc<GossipEngine>>,
    outboxes: Vec<std::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<atmosphere_core::Announcement>>>,
}

impl Swarm {
    fn new(n: usize) -> Self {
        let mut engines = Vec::new();
        let mut outboxes = Vec::new();
        for i in 0..n {
            let engine = Arc::new(GossipEngine::new(format!("node-{i}")));
            outboxes.push(std::sync::Mutex::new(engine.take_outbound().unwrap()));
            engines.push(engine);
        }
        Self { engines, outboxes }
    }

    /// Drains every engine's outbound queue and redelivers each message
    /// to every other engine, repeating until nothing moves (the flood
    /// has either died out or saturated the TTL).
    fn settle(&self) {
        loop {
            let mut delivered_any = false;
            for (i, outbox) in self.outboxes.iter().enumerate() {
                let mut rx = outbox.lock().unwrap();
                while let Ok(announcement) = rx.try_recv() {
                    delivered_any = true;
                    for (j, engine) in self.engines.iter().enumerate() {
                        if i != j {
                            engine.receive(announcement.clone());
                        }
                    }
                }
            }
            if !delivered_any {
                break;
            }
        }
    }
}

#[test]
fn a_single_announcement_reaches_every_node_in_a_small_mesh() {
    let swarm = Swarm::new(8);
    let counters: Vec<_> = (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for (engine, counter) in swarm.engines.iter().zip(counters.iter()) {
        let counter = counter.clone();
        engine.on_announcement(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let announcement = build_announcement(
        AnnouncementKind::CapabilityAvailable,
        "node-0",
        serde_json::json!({"cap_id": "node-0:chat"}),
    );
    swarm.engines[0].publish(announcement);
    swarm.settle();

    // The originator already marked it seen via `publish`, so only the
    // other seven nodes' handlers fire.
    let total: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, 7, "every non-originating node should see the announcement exactly once");
}

#[test]
fn a_ttl_one_announcement_does_not_spread_past_the_first_hop() {
    let swarm = Swarm::new(5);
    let counters: Vec<_> = (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for (engine, counter) in swarm.engines.iter().zip(counters.iter()) {
        let counter = counter.clone();
        engine.on_announcement(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let mut announcement = build_announcement(
        AnnouncementKind::CostUpdate,
        "node-0",
        serde_json::json!({}),
    );
    announcement.ttl = 1;
    swarm.engines[0].publish(announcement);
    swarm.settle();

    // ttl=1 is decremented to 0 on receipt and never re-forwarded, so
    // only the direct neighbors (everyone, in a fully-connected mesh)
    // see it once each, but no second wave happens.
    let total: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, 4);
}
