use crate::{ComputeError, ComputeOutput, ComputeRuntime};
use async_trait::async_trait;
use wasmtime::{Config, Engine, Linker, Module, Store};

pub struct WasmTimeRuntime {
    engine: Engine,
}

impl WasmTimeRuntime {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.consume_fuel(true); // vital for resource limiting

        let engine = Engine::new(&config)?;
        Ok(Self { engine })
    }
}

#[async_trait]
impl ComputeRuntime for WasmTimeRuntime {
    fn name(&self) -> &str {
        "wasmtime"
    }

    async fn execute(
        &self,
        module: &[u8],
        _input: &[u8],
        fuel_budget: u64,
    ) -> Result<ComputeOutput, ComputeError> {
        let module = Module::from_binary(&self.engine, module)
            .map_err(|e| ComputeError::Wasm(e.to_string()))?;

        struct State {}
        let mut store = Store::new(&self.engine, State {});
        store
            .set_fuel(fuel_budget)
            .map_err(|e| ComputeError::Wasm(e.to_string()))?;

        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| ComputeError::Wasm(e.to_string()))?;

        let run = instance
            .get_typed_func::<(), ()>(&mut store, "run")
            .map_err(|e| ComputeError::Wasm(format!("missing 'run' export: {}", e)))?;

        match run.call_async(&mut store, ()).await {
            Ok(()) => {
                let remaining = store.get_fuel().unwrap_or(0);
                let consumed = fuel_budget.saturating_sub(remaining);
                Ok(ComputeOutput {
                    data: Vec::new(),
                    fuel_consumed: consumed,
                })
            }
            // Running out of gas surfaces here as a trap, indistinguishable
            // from any other wasmtime trap at this layer.
            Err(e) => Err(ComputeError::Wasm(e.to_string())),
        }
    }
}
