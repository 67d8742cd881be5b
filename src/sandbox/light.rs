//! In-process Light sandbox: a WASI build of the QuickJS `qjs` interpreter
//! running inside wasmtime.
//!
//! Isolation comes from the Wasm boundary: no preopened directories, no
//! sockets, no inherited environment, a linear-memory ceiling, optional fuel,
//! and epoch interruption for the wall-clock deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use wasmtime::{Engine, Linker, Module, Store, UpdateDeadline};
use wasmtime_wasi::preview1;
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::harness::Program;
use crate::sandbox::io::{RawOutput, SandboxIo};
use crate::sandbox::limits::{install_ceiling, RunState};

/// Compiled interpreter shared by every Light run.
pub struct ScriptSandbox {
    engine: Engine,
    module: Arc<Module>,
    epoch_tick_interval: Duration,
    max_fuel: Option<u64>,
}

impl std::fmt::Debug for ScriptSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSandbox")
            .field("epoch_tick_interval", &self.epoch_tick_interval)
            .field("max_fuel", &self.max_fuel)
            .finish_non_exhaustive()
    }
}

impl ScriptSandbox {
    /// Compile the interpreter named by `config.interpreter_path`.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        if config.epoch_tick_interval.is_zero() {
            return Err(SandboxError::Config(
                "epoch_tick_interval must be greater than zero".to_string(),
            ));
        }

        // Configure the engine with epoch interruption for timeout support
        let mut engine_config = wasmtime::Config::new();
        engine_config.epoch_interruption(true);
        engine_config.consume_fuel(config.max_fuel.is_some());

        let engine = Engine::new(&engine_config).map_err(|e| {
            SandboxError::RuntimeInit(anyhow::anyhow!("failed to create engine: {}", e))
        })?;

        let wasm_bytes = std::fs::read(&config.interpreter_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::InterpreterNotFound(config.interpreter_path.display().to_string())
            } else {
                SandboxError::Io(e)
            }
        })?;

        let module = Module::new(&engine, &wasm_bytes).map_err(|e| {
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to compile module: {}", e))
        })?;

        tracing::info!(
            path = %config.interpreter_path.display(),
            "compiled script interpreter"
        );

        Ok(Self {
            engine,
            module: Arc::new(module),
            epoch_tick_interval: config.epoch_tick_interval,
            max_fuel: config.max_fuel,
        })
    }

    /// Run a harness program under `timeout` and `max_memory`.
    pub async fn run(&self, program: &Program, timeout: Duration, max_memory: u64) -> Result<RawOutput> {
        let source = program.source.clone();
        let input = program.input.clone();
        let max_fuel = self.max_fuel;
        let engine = self.engine.clone();
        let module = Arc::clone(&self.module);

        // Spawn the epoch ticker task
        let ticker_engine = engine.clone();
        let epoch_interval = self.epoch_tick_interval;
        let ticker_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(epoch_interval);
            loop {
                interval.tick().await;
                ticker_engine.increment_epoch();
            }
        });

        let deadline = Instant::now() + timeout;
        let exec_engine = engine.clone();
        let exec_handle = tokio::task::spawn_blocking(move || {
            Self::run_sync(&exec_engine, &module, &source, &input, max_memory, max_fuel, deadline)
        });

        // Race between execution and timeout
        tokio::select! {
            result = exec_handle => {
                ticker_handle.abort();
                match result {
                    Ok(inner) => inner,
                    Err(e) => Err(SandboxError::ExecutionFailed(format!("task panicked: {}", e))),
                }
            }
            _ = tokio::time::sleep(timeout) => {
                ticker_handle.abort();
                engine.increment_epoch(); // wake the store so it sees its deadline
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    /// Synchronous execution (runs in blocking task).
    fn run_sync(
        engine: &Engine,
        module: &Module,
        source: &str,
        input: &str,
        max_memory: u64,
        max_fuel: Option<u64>,
        deadline: Instant,
    ) -> Result<RawOutput> {
        let io = SandboxIo::new(input);

        // No preopened directories, no sockets, nothing inherited.
        let wasi_ctx = WasiCtxBuilder::new()
            .args(&["qjs", "--std", "-e", source])
            .stdin(io.stdin.clone())
            .stdout(io.stdout.clone())
            .stderr(io.stderr.clone())
            .build_p1();

        let mut store = Store::new(engine, RunState::new(max_memory, wasi_ctx));
        install_ceiling(&mut store);

        // The engine epoch is shared by concurrent runs; each store checks its own deadline.
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| {
            if Instant::now() >= deadline {
                Err(wasmtime::Trap::Interrupt.into())
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        if let Some(fuel) = max_fuel {
            store.set_fuel(fuel).map_err(|e| {
                SandboxError::RuntimeInit(anyhow::anyhow!("failed to set fuel: {}", e))
            })?;
        }

        let mut linker = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut RunState| &mut state.wasi)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to link WASI: {}", e)))?;

        let instance = linker.instantiate(&mut store, module).map_err(|e| {
            if store.data().ceiling.exceeded() {
                return SandboxError::MemoryLimitExceeded(
                    "memory limit exceeded during instantiation".to_string(),
                );
            }
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to instantiate: {}", e))
        })?;

        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| {
                SandboxError::ModuleLoad(anyhow::anyhow!("failed to get _start function: {}", e))
            })?;

        let exit_code = match start.call(&mut store, ()) {
            Ok(()) => 0,
            Err(e) => {
                if store.data().ceiling.exceeded() {
                    return Err(SandboxError::MemoryLimitExceeded(format!(
                        "memory limit of {} bytes exceeded",
                        max_memory
                    )));
                }

                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    i64::from(exit.0)
                } else {
                    match e.downcast_ref::<wasmtime::Trap>() {
                        Some(wasmtime::Trap::Interrupt) => {
                            return Err(SandboxError::Timeout(Duration::ZERO));
                        }
                        Some(wasmtime::Trap::OutOfFuel) => {
                            return Err(SandboxError::OutOfFuel { consumed: max_fuel });
                        }
                        _ => return Err(SandboxError::ExecutionFailed(e.to_string())),
                    }
                }
            }
        };

        tracing::debug!(
            exit_code,
            peak_memory_bytes = store.data().ceiling.peak_bytes(),
            "light run finished"
        );
        Ok(io.finish(exit_code))
    }
}
