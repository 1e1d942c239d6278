//! Cost Collector & cost model (§4.3), generalizing a single
//! battery-energy score into the full multi-factor reading set the
//! router scores candidates against.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use atmosphere_core::cost::{CostFactors, Reading};
use sysinfo::System;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

pub const SAMPLE_INTERVAL_SECS: u64 = 10;
pub const BROADCAST_INTERVAL_SECS: u64 = 30;
/// §3 invariant: a CostFactors record is usable iff `now - timestamp <= cost_stale_seconds`.
pub const COST_STALE_SECONDS: f64 = 60.0;
pub const COST_STALE_SECONDS_POWER_DOMINANT: f64 = 30.0;
/// §4.5 step 8: hysteresis threshold before switching routing winners.
pub const MIN_COST_DIFFERENCE: f64 = 0.20;

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Work categories the cost formula discriminates between (only
/// `Inference` currently carries a distinct multiplier, via GPU load).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    Inference,
    ToolCall,
    SensorRead,
    General,
}

/// Cost formula (§4.3). Multiplicative, bounded to `[1.0, 100.0]`,
/// monotonic in each factor. `unknown` readings contribute a neutral
/// multiplier of 1.0 rather than a fabricated value.
pub fn cost_for(factors: &CostFactors, work_type: WorkType) -> f64 {
    let mut cost: f64 = 1.0;

    if let Reading::Known(true) = factors.on_battery {
        cost *= 1.5;
        if let Reading::Known(pct) = factors.battery_percent {
            if pct < 20.0 {
                cost *= 2.0;
            }
        }
    }

    if let Reading::Known(load) = factors.cpu_load {
        cost *= 1.0 + load as f64;
    }

    if work_type == WorkType::Inference {
        if let Reading::Known(load) = factors.gpu_load {
            cost *= 1.0 + 2.0 * load as f64;
        }
    }

    if let Reading::Known(pressure) = factors.memory_pressure {
        cost *= 1.0 + pressure as f64;
    }

    if let Reading::Known(true) = factors.thermal_throttled {
        cost *= 1.5;
    }

    if let Reading::Known(true) = factors.is_metered {
        cost *= 3.0;
    }

    if let Reading::Known(depth) = factors.queue_depth {
        if depth > 10 {
            let steps = ((depth - 10) / 10) + 1;
            cost *= 1.2_f64.powi(steps as i32);
        }
    }

    cost.clamp(1.0, 100.0)
}

/// Significant-change thresholds that trigger an out-of-band broadcast
/// ahead of the 30s timer (§4.3 "Sampling cadence").
fn is_significant_change(prev: &CostFactors, next: &CostFactors) -> bool {
    match (prev.battery_percent, next.battery_percent) {
        (Reading::Known(a), Reading::Known(b)) if (a - b).abs() >= 10.0 => return true,
        _ => {}
    }
    match (prev.cpu_load, next.cpu_load) {
        (Reading::Known(a), Reading::Known(b)) if (a - b).abs() >= 0.2 => return true,
        _ => {}
    }
    if prev.is_metered != next.is_metered {
        return true;
    }
    if prev.thermal_throttled != next.thermal_throttled {
        return true;
    }
    false
}

/// Samples local system state every [`SAMPLE_INTERVAL_SECS`] and
/// broadcasts `CostFactors` snapshots to subscribers (the Gossip Engine
/// wraps these into `cost_update` announcements; the Router reads the
/// latest snapshot directly for local-capability scoring).
pub struct CostCollector {
    latest: RwLock<CostFactors>,
    tx: broadcast::Sender<CostFactors>,
    queue_depth: AtomicU32,
}

impl CostCollector {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(16);
        Self {
            latest: RwLock::new(CostFactors::unknown(now_unix())),
            tx,
            queue_depth: AtomicU32::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CostFactors> {
        self.tx.subscribe()
    }

    pub fn set_queue_depth(&self, depth: u32) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub async fn latest(&self) -> CostFactors {
        self.latest.read().await.clone()
    }

    pub async fn cost_for(&self, work_type: WorkType) -> f64 {
        cost_for(&*self.latest.read().await, work_type)
    }

    /// Reads what this platform can reliably observe. CPU and memory
    /// pressure come from `sysinfo`; battery, GPU, thermal state, and
    /// network metering have no portable primitive available here and
    /// are reported `unknown` rather than guessed, per §4.3.
    pub fn sample(&self, sys: &mut System) -> CostFactors {
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_load = if sys.cpus().is_empty() {
            Reading::Unknown
        } else {
            let avg = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32;
            Reading::Known((avg / 100.0).clamp(0.0, 1.0))
        };

        let memory_pressure = if sys.total_memory() == 0 {
            Reading::Unknown
        } else {
            let used_ratio = sys.used_memory() as f32 / sys.total_memory() as f32;
            Reading::Known(used_ratio.clamp(0.0, 1.0))
        };

        let queue_depth = Reading::Known(self.queue_depth.load(Ordering::Relaxed));

        CostFactors {
            on_battery: Reading::Unknown,
            battery_percent: Reading::Unknown,
            cpu_load,
            gpu_load: Reading::Unknown,
            memory_pressure,
            thermal_throttled: Reading::Unknown,
            bandwidth_mbps: Reading::Unknown,
            is_metered: Reading::Unknown,
            queue_depth,
            timestamp: now_unix(),
        }
    }

    /// Updates the cached snapshot and broadcasts it if a subscriber
    /// exists; returns `true` when the change was significant enough to
    /// warrant an immediate gossip push ahead of the periodic timer.
    pub async fn record(&self, next: CostFactors) -> bool {
        let mut guard = self.latest.write().await;
        let significant = is_significant_change(&guard, &next);
        *guard = next.clone();
        drop(guard);
        let _ = self.tx.send(next);
        if significant {
            debug!("cost factors changed significantly, scheduling immediate broadcast");
        }
        significant
    }

    /// Runs the sample/broadcast loop until `shutdown` resolves. The
    /// caller spawns this as a background task.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut sys = System::new();
        let mut sample_tick = tokio::time::interval(std::time::Duration::from_secs(SAMPLE_INTERVAL_SECS));
        let mut broadcast_tick =
            tokio::time::interval(std::time::Duration::from_secs(BROADCAST_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = sample_tick.tick() => {
                    let next = self.sample(&mut sys);
                    let significant = self.record(next).await;
                    if significant {
                        broadcast_tick.reset();
                    }
                }
                _ = broadcast_tick.tick() => {
                    let current = self.latest().await;
                    let _ = self.tx.send(current);
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

impl Default for CostCollector {
    fn default() -> Self {
        Self::new()
    }
}
