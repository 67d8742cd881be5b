//! Isolation strategies and the policy that picks one.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::environment::{EnvironmentManager, HealthStatus};
use crate::error::{Result, SandboxError};
use crate::sandbox::harness::Program;
use crate::sandbox::io::RawOutput;
use crate::sandbox::light::ScriptSandbox;
use crate::types::{ExecutionOptions, Strategy};

/// Constructs that need an event loop the Light interpreter does not drive
/// to completion reliably.
static ASYNC_CONSTRUCT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\basync\b|\bawait\b|\.then\s*\(|\bPromise\b|\bsetTimeout\b|\bsetInterval\b").ok()
});

/// Languages the Light interpreter accepts.
const DEFAULT_LANGUAGES: &[&str] = &["javascript", "js"];

/// Something that can run a harness [`Program`] in isolation.
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> Strategy;

    /// Whether the strategy can accept work right now.
    async fn health(&self) -> HealthStatus;

    /// Run `program` under `timeout` and `max_memory`.
    async fn run(&self, program: &Program, timeout: Duration, max_memory: u64) -> Result<RawOutput>;
}

/// In-process interpreter.
#[derive(Debug)]
pub struct LightStrategy {
    sandbox: ScriptSandbox,
}

impl LightStrategy {
    /// Wrap a compiled interpreter.
    pub fn new(sandbox: ScriptSandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl IsolationStrategy for LightStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Light
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn run(&self, program: &Program, timeout: Duration, max_memory: u64) -> Result<RawOutput> {
        self.sandbox.run(program, timeout, max_memory).await
    }
}

/// One disposable environment per run.
#[derive(Debug)]
pub struct HeavyStrategy {
    manager: Arc<EnvironmentManager>,
}

impl HeavyStrategy {
    /// Run through `manager`.
    pub fn new(manager: Arc<EnvironmentManager>) -> Self {
        Self { manager }
    }

    /// The manager backing this strategy.
    pub fn manager(&self) -> &Arc<EnvironmentManager> {
        &self.manager
    }
}

#[async_trait]
impl IsolationStrategy for HeavyStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Heavy
    }

    async fn health(&self) -> HealthStatus {
        self.manager.health_check().await.status
    }

    async fn run(&self, program: &Program, timeout: Duration, max_memory: u64) -> Result<RawOutput> {
        let handle = self.manager.create(self.manager.spec_for(max_memory)).await?;
        let outcome = self.manager.run(&handle, program, timeout).await;
        if let Err(e) = self.manager.destroy(&handle).await {
            tracing::warn!(environment = %handle.id(), error = %e, "failed to destroy environment");
        }
        outcome.map(|run| run.raw)
    }
}

/// Outcome of [`select_strategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyDecision {
    /// Strategy that will run the code.
    pub strategy: Strategy,
    /// Heavy was wanted but Light was chosen because Heavy is unhealthy.
    pub downgraded: bool,
}

/// Why `code` needs Heavy isolation, if it does.
pub fn heavy_reason(code: &str, options: &ExecutionOptions) -> Option<&'static str> {
    if options.require_isolation {
        return Some("isolation requested");
    }
    if let Some(language) = &options.language {
        if !DEFAULT_LANGUAGES.contains(&language.to_ascii_lowercase().as_str()) {
            return Some("non-default language");
        }
    }
    if ASYNC_CONSTRUCT.as_ref().is_some_and(|re| re.is_match(code)) {
        return Some("asynchronous constructs");
    }
    None
}

/// Pick a strategy for `code`.
///
/// Light unless [`heavy_reason`] says otherwise. When Heavy is wanted but
/// `heavy_health` is unhealthy, strict mode fails with
/// [`SandboxError::IsolationUnavailable`]; otherwise the decision is
/// downgraded to Light and logged.
pub fn select_strategy(
    code: &str,
    options: &ExecutionOptions,
    heavy_health: HealthStatus,
    strict: bool,
) -> Result<StrategyDecision> {
    let Some(reason) = heavy_reason(code, options) else {
        return Ok(StrategyDecision {
            strategy: Strategy::Light,
            downgraded: false,
        });
    };

    match heavy_health {
        HealthStatus::Healthy => Ok(StrategyDecision {
            strategy: Strategy::Heavy,
            downgraded: false,
        }),
        HealthStatus::Unhealthy if strict => Err(SandboxError::IsolationUnavailable(format!(
            "heavy isolation required ({}) but the backend is unhealthy",
            reason
        ))),
        HealthStatus::Unhealthy => {
            tracing::warn!(reason, "heavy backend unhealthy, downgrading to light isolation");
            Ok(StrategyDecision {
                strategy: Strategy::Light,
                downgraded: true,
            })
        }
    }
}
