//! Sandbox configuration with builder pattern.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Configuration shared by the executor, the environment manager and the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Timeout applied when an endpoint declares none.
    pub timeout: Duration,
    /// Upper clamp for declared endpoint timeouts.
    pub max_timeout: Duration,
    /// Maximum memory in bytes; declared ceilings are clamped to this.
    pub max_memory: u64,
    /// Maximum fuel (instruction count limit) for the Light strategy.
    pub max_fuel: Option<u64>,
    /// Path to the QuickJS WASI interpreter.
    pub interpreter_path: PathBuf,
    /// Epoch interruption interval for cooperative timeout.
    pub epoch_tick_interval: Duration,
    /// Ceiling on concurrently live Heavy environments.
    pub max_environments: usize,
    /// Container image for Heavy environments.
    pub heavy_image: String,
    /// CPU share for Heavy environments (1.0 = one core).
    pub cpu_quota: f64,
    /// Process ceiling inside Heavy environments.
    pub pids_limit: i64,
    /// Grace period before a stopping container is killed.
    pub stop_grace: Duration,
    /// Environments idle for longer than this are swept.
    pub environment_max_age: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
    /// Maximum code length in characters.
    pub max_code_length: usize,
    /// Maximum number of loop constructs.
    pub max_loops: usize,
    /// Largest static allocation literal accepted by the validator.
    pub max_static_allocation: u64,
    /// Lifetime of cached results.
    pub cache_ttl: Duration,
    /// Executions per user per sliding hour.
    pub rate_limit_per_hour: usize,
    /// Fail instead of downgrading when Heavy is unavailable.
    pub strict_isolation: bool,
    /// Bodies longer than this are truncated in execution logs.
    pub max_logged_body: usize,
    /// Console lines kept per execution.
    pub max_log_lines: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
            max_memory: 128 * 1024 * 1024, // 128MB
            max_fuel: None,
            interpreter_path: PathBuf::from("assets/qjs.wasm"),
            epoch_tick_interval: Duration::from_millis(10),
            max_environments: 20,
            heavy_image: "node:20-alpine".to_string(),
            cpu_quota: 0.5,
            pids_limit: 64,
            stop_grace: Duration::from_secs(2),
            environment_max_age: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_code_length: 50_000,
            max_loops: 10,
            max_static_allocation: 1_000_000,
            cache_ttl: Duration::from_secs(300),
            rate_limit_per_hour: 100,
            strict_isolation: false,
            max_logged_body: 2_000,
            max_log_lines: 100,
        }
    }
}

impl SandboxConfig {
    /// Create a new builder for SandboxConfig.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Load the defaults overlaid with `SANDBOX_*` environment variables.
    ///
    /// Durations are given in milliseconds, memory in bytes.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SandboxConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_MAX_TIMEOUT_MS")? {
            config.max_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_var::<u64>(&lookup, "SANDBOX_MAX_MEMORY")? {
            config.max_memory = bytes;
        }
        if let Some(fuel) = parse_var::<u64>(&lookup, "SANDBOX_MAX_FUEL")? {
            config.max_fuel = Some(fuel);
        }
        if let Some(path) = lookup("SANDBOX_INTERPRETER_PATH") {
            config.interpreter_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_EPOCH_TICK_MS")? {
            config.epoch_tick_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "SANDBOX_MAX_ENVIRONMENTS")? {
            config.max_environments = max;
        }
        if let Some(image) = lookup("SANDBOX_HEAVY_IMAGE") {
            config.heavy_image = image;
        }
        if let Some(cpu) = parse_var::<f64>(&lookup, "SANDBOX_CPU_QUOTA")? {
            config.cpu_quota = cpu;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_ENVIRONMENT_MAX_AGE_MS")? {
            config.environment_max_age = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_SWEEP_INTERVAL_MS")? {
            config.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(len) = parse_var::<usize>(&lookup, "SANDBOX_MAX_CODE_LENGTH")? {
            config.max_code_length = len;
        }
        if let Some(loops) = parse_var::<usize>(&lookup, "SANDBOX_MAX_LOOPS")? {
            config.max_loops = loops;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SANDBOX_CACHE_TTL_MS")? {
            config.cache_ttl = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "SANDBOX_RATE_LIMIT_PER_HOUR")? {
            config.rate_limit_per_hour = limit;
        }
        if let Some(strict) = parse_var::<bool>(&lookup, "SANDBOX_STRICT_ISOLATION")? {
            config.strict_isolation = strict;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_environments == 0 {
            return Err(SandboxError::Config(
                "max_environments must be at least 1".to_string(),
            ));
        }
        if self.epoch_tick_interval.is_zero() {
            return Err(SandboxError::Config(
                "epoch_tick_interval must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(SandboxError::Config(
                "sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp a declared endpoint timeout to the configured window.
    pub fn effective_timeout(&self, declared: Option<Duration>) -> Duration {
        declared
            .filter(|d| !d.is_zero())
            .unwrap_or(self.timeout)
            .min(self.max_timeout)
    }

    /// Clamp a declared memory ceiling to the configured maximum.
    pub fn effective_memory(&self, declared: Option<u64>) -> u64 {
        declared
            .filter(|m| *m > 0)
            .map(|m| m.min(self.max_memory))
            .unwrap_or(self.max_memory)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SandboxError::Config(format!("invalid {}={:?}: {}", key, raw, e))),
    }
}

/// Builder for creating SandboxConfig instances.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the default execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the upper clamp for declared timeouts.
    pub fn max_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_timeout = timeout;
        self
    }

    /// Set the maximum memory limit in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Set the maximum fuel (instruction count).
    pub fn max_fuel(mut self, fuel: u64) -> Self {
        self.config.max_fuel = Some(fuel);
        self
    }

    /// Set the path to the QuickJS wasm interpreter.
    pub fn interpreter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.interpreter_path = path.into();
        self
    }

    /// Set the epoch tick interval for timeout checking.
    pub fn epoch_tick_interval(mut self, interval: Duration) -> Self {
        self.config.epoch_tick_interval = interval;
        self
    }

    /// Set the Heavy environment ceiling.
    pub fn max_environments(mut self, max: usize) -> Self {
        self.config.max_environments = max;
        self
    }

    /// Set the container image for Heavy environments.
    pub fn heavy_image(mut self, image: impl Into<String>) -> Self {
        self.config.heavy_image = image.into();
        self
    }

    /// Set the CPU share for Heavy environments.
    pub fn cpu_quota(mut self, cpus: f64) -> Self {
        self.config.cpu_quota = cpus;
        self
    }

    /// Set the grace period for stopping containers.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Set the idle age after which environments are swept.
    pub fn environment_max_age(mut self, age: Duration) -> Self {
        self.config.environment_max_age = age;
        self
    }

    /// Set the sweeper interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the maximum code length.
    pub fn max_code_length(mut self, len: usize) -> Self {
        self.config.max_code_length = len;
        self
    }

    /// Set the maximum number of loop constructs.
    pub fn max_loops(mut self, loops: usize) -> Self {
        self.config.max_loops = loops;
        self
    }

    /// Set the largest accepted static allocation literal.
    pub fn max_static_allocation(mut self, elements: u64) -> Self {
        self.config.max_static_allocation = elements;
        self
    }

    /// Set the result cache lifetime.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Set the per-user hourly execution ceiling.
    pub fn rate_limit_per_hour(mut self, limit: usize) -> Self {
        self.config.rate_limit_per_hour = limit;
        self
    }

    /// Fail instead of downgrading to Light when Heavy is unavailable.
    pub fn strict_isolation(mut self, strict: bool) -> Self {
        self.config.strict_isolation = strict;
        self
    }

    /// Set the body truncation length for execution logs.
    pub fn max_logged_body(mut self, chars: usize) -> Self {
        self.config.max_logged_body = chars;
        self
    }

    /// Set the number of console lines kept per execution.
    pub fn max_log_lines(mut self, lines: usize) -> Self {
        self.config.max_log_lines = lines;
        self
    }

    /// Build the SandboxConfig.
    pub fn build(self) -> SandboxConfig {
        self.config
    }

    /// Build and [`validate`](SandboxConfig::validate) the SandboxConfig.
    pub fn try_build(self) -> Result<SandboxConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
