//! Sandboxed compute runtime for `tool/*` capabilities whose handler is
//! a WASM module rather than a native in-process implementation.
//!
//! Kept as a separate crate so embedders that only need native handlers
//! don't pull in a WASM runtime.

use async_trait::async_trait;

/// Error type for compute failures, folded into the node's
/// `AtmosphereError::HandlerError` / `AtmosphereError::Timeout` at the
/// call site.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("wasm runtime error: {0}")]
    Wasm(String),
    #[error("fuel budget exhausted")]
    Exhausted,
    #[error("task validation failed: {0}")]
    Validation(String),
}

pub struct ComputeOutput {
    pub data: Vec<u8>,
    pub fuel_consumed: u64,
}

/// Abstract interface for a compute runtime backing `tool/*` capability
/// invocation.
#[async_trait]
pub trait ComputeRuntime: Send + Sync {
    /// Name of the runtime, e.g. `"wasmtime-v1"`.
    fn name(&self) -> &str;

    /// Execute a WASM module against `input`, metering resource use
    /// against `fuel_budget` (an opaque, runtime-defined unit — the
    /// caller is responsible for mapping its own cost model onto it).
    async fn execute(
        &self,
        module: &[u8],
        input: &[u8],
        fuel_budget: u64,
    ) -> Result<ComputeOutput, ComputeError>;
}

pub mod wasm;
