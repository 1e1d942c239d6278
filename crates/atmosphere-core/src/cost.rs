//! Dynamic per-node cost state (§4.3). Pure data here; the sampling
//! cadence, significant-change detection, and the cost formula itself
//! live in the node crate's `cost` module, which owns the clock.

use serde::{Deserialize, Serialize};

/// Power posture of a node, independent of the dynamic [`CostFactors`]
/// that ride alongside it on gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Normal,
    LowBattery,
    Critical,
}

/// A reading that the collector could not obtain a real signal for
/// (§4.3 "Platform-specific sampling"). Carried through instead of a
/// fabricated value; the cost formula treats `Unknown` as a neutral
/// multiplier of `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading<T> {
    Known(T),
    Unknown,
}

impl<T: Copy> Reading<T> {
    pub fn or(self, default: T) -> T {
        match self {
            Reading::Known(v) => v,
            Reading::Unknown => default,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Reading::Known(_))
    }
}

impl<T> Default for Reading<T> {
    fn default() -> Self {
        Reading::Unknown
    }
}

/// Dynamic per-node state sampled every <=10s and broadcast every <=30s
/// or on significant change (§3 CostFactors, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostFactors {
    pub on_battery: Reading<bool>,
    pub battery_percent: Reading<f32>,
    /// 0.0-1.0 normalized.
    pub cpu_load: Reading<f32>,
    pub gpu_load: Reading<f32>,
    pub memory_pressure: Reading<f32>,
    pub thermal_throttled: Reading<bool>,
    pub bandwidth_mbps: Reading<f32>,
    pub is_metered: Reading<bool>,
    pub queue_depth: Reading<u32>,
    /// Unix seconds (float), as carried on the wire elsewhere in the
    /// protocol (§6 Gossip wire format).
    pub timestamp: f64,
}

impl CostFactors {
    /// All factors unknown, stamped "now" by the caller. Used as the
    /// starting point for a fresh sample and as the harmless default
    /// when a peer's cost table entry has gone stale.
    pub fn unknown(timestamp: f64) -> Self {
        Self {
            on_battery: Reading::Unknown,
            battery_percent: Reading::Unknown,
            cpu_load: Reading::Unknown,
            gpu_load: Reading::Unknown,
            memory_pressure: Reading::Unknown,
            thermal_throttled: Reading::Unknown,
            bandwidth_mbps: Reading::Unknown,
            is_metered: Reading::Unknown,
            queue_depth: Reading::Unknown,
            timestamp,
        }
    }

    /// True iff every field the cost formula reads came from a real
    /// sample rather than a platform gap. Recorded as "low confidence"
    /// in outgoing `cost_update` announcements when false (§4.3).
    pub fn is_high_confidence(&self) -> bool {
        self.on_battery.is_known()
            && self.cpu_load.is_known()
            && self.memory_pressure.is_known()
            && self.thermal_throttled.is_known()
            && self.is_metered.is_known()
    }
}
