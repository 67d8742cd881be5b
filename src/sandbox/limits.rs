//! Resource ceilings for the in-process Light strategy.

use wasmtime::{ResourceLimiter, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Table elements a QuickJS instance may grow to.
const MAX_TABLE_ELEMENTS: usize = 20_000;

/// Enforces the per-request memory ceiling on the interpreter instance.
#[derive(Debug)]
pub struct MemoryCeiling {
    max_bytes: usize,
    peak_bytes: usize,
    exceeded: bool,
}

impl MemoryCeiling {
    /// Create a ceiling of `max_bytes`.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes: usize::try_from(max_bytes).unwrap_or(usize::MAX),
            peak_bytes: 0,
            exceeded: false,
        }
    }

    /// Whether a growth request was refused.
    pub fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Largest linear memory size granted so far.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }
}

impl ResourceLimiter for MemoryCeiling {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.max_bytes {
            self.exceeded = true;
            return Ok(false);
        }
        self.peak_bytes = self.peak_bytes.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > MAX_TABLE_ELEMENTS {
            self.exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn instances(&self) -> usize {
        1
    }

    fn memories(&self) -> usize {
        1
    }
}

/// Per-run store state: the ceiling plus the WASI context.
pub struct RunState {
    /// Memory ceiling for this run.
    pub ceiling: MemoryCeiling,
    /// WASI Preview 1 context with no preopens.
    pub wasi: WasiP1Ctx,
}

impl RunState {
    /// Bundle a ceiling of `max_memory` bytes with `wasi`.
    pub fn new(max_memory: u64, wasi: WasiP1Ctx) -> Self {
        Self {
            ceiling: MemoryCeiling::new(max_memory),
            wasi,
        }
    }
}

/// Attach the ceiling to a store.
pub fn install_ceiling(store: &mut Store<RunState>) {
    store.limiter(|state| &mut state.ceiling);
}
