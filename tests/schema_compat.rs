use atmosphere_core::{Capability, CapabilityStatus, CapabilityType, CostFactors, Reading};
use serde_json::json;

#[test]
fn capability_schema_lock() {
    // Ensures the wire shape of `Capability` doesn't drift silently.
    // If this test fails after a field rename, every peer running an
    // older build of this crate will fail to parse gossiped capabilities.
    let legacy_json = json!({
        "cap_id": "node-123:chat",
        "node_id": "node-123",
        "cap_type": "llm/chat",
        "label": "chat",
        "description": "a chat capability",
        "embedding_vector": [0.1, 0.2, 0.3],
        "status": "online",
        "last_heartbeat": 1000.0
    });

    let cap: Capability = serde_json::from_value(legacy_json).expect("schema break: Capability");
    assert_eq!(cap.cap_id, "node-123:chat");
    assert_eq!(cap.cap_type, CapabilityType::llm_chat());
    assert_eq!(cap.status, CapabilityStatus::Online);
    // Optional collections must default rather than require the sender
    // to send them explicitly.
    assert!(cap.topics.is_empty());
    assert!(cap.tools.is_empty());
    assert!(cap.triggers.is_empty());
}

#[test]
fn cost_factors_schema_lock() {
    let legacy_json = json!({
        "on_battery": {"known": true},
        "battery_percent": {"known": 42.0},
        "cpu_load": "unknown",
        "gpu_load": "unknown",
        "memory_pressure": {"known": 0.5},
        "thermal_throttled": {"known": false},
        "bandwidth_mbps": "unknown",
        "is_metered": {"known": false},
        "queue_depth": {"known": 3},
        "timestamp": 12345.0
    });

    let factors: CostFactors =
        serde_json::from_value(legacy_json).expect("schema break: CostFactors");
    assert_eq!(factors.on_battery, Reading::Known(true));
    assert_eq!(factors.cpu_load, Reading::Unknown);
    assert_eq!(factors.queue_depth, Reading::Known(3));
}
