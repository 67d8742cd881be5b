//! Core execution engine: validate, pick a strategy, run, decode, cache.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::environment::HealthStatus;
use crate::error::{ErrorKind, Result, SandboxError};
use crate::sandbox::cache::{cache_key, ResultCache};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::harness::{ContextBindings, Program};
use crate::sandbox::io::{decode_output, locate_last_json, DecodedOutput};
use crate::sandbox::strategy::{heavy_reason, select_strategy, IsolationStrategy, StrategyDecision};
use crate::sandbox::validator::{validate_code, ValidationLimits};
use crate::types::{ExecutionOptions, ExecutionRequest, ExecutionResult, Strategy};

/// Validates, routes and caches executions.
///
/// The Light strategy is mandatory; Heavy is optional and treated as
/// unhealthy when absent.
pub struct CodeExecutor {
    light: Arc<dyn IsolationStrategy>,
    heavy: Option<Arc<dyn IsolationStrategy>>,
    cache: ResultCache,
    limits: ValidationLimits,
    strict_isolation: bool,
}

impl std::fmt::Debug for CodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExecutor")
            .field("heavy", &self.heavy.is_some())
            .field("cached", &self.cache.len())
            .field("limits", &self.limits)
            .field("strict_isolation", &self.strict_isolation)
            .finish_non_exhaustive()
    }
}

impl CodeExecutor {
    /// Create an executor over the given strategies.
    pub fn new(
        config: &SandboxConfig,
        light: Arc<dyn IsolationStrategy>,
        heavy: Option<Arc<dyn IsolationStrategy>>,
    ) -> Self {
        Self {
            light,
            heavy,
            cache: ResultCache::new(config.cache_ttl),
            limits: ValidationLimits::from(config),
            strict_isolation: config.strict_isolation,
        }
    }

    /// Reject unsafe code before anything is allocated.
    pub fn validate(&self, code: &str) -> Result<()> {
        validate_code(code, &self.limits)
    }

    /// Pick a strategy, probing Heavy only when it is wanted.
    pub async fn select_strategy(&self, code: &str, options: &ExecutionOptions) -> Result<StrategyDecision> {
        let heavy_health = if heavy_reason(code, options).is_some() {
            match &self.heavy {
                Some(heavy) => heavy.health().await,
                None => HealthStatus::Unhealthy,
            }
        } else {
            HealthStatus::Healthy
        };
        select_strategy(code, options, heavy_health, self.strict_isolation)
    }

    fn strategy(&self, kind: Strategy) -> Result<&Arc<dyn IsolationStrategy>> {
        match kind {
            Strategy::Light => Ok(&self.light),
            Strategy::Heavy => self.heavy.as_ref().ok_or_else(|| {
                SandboxError::IsolationUnavailable("no heavy backend configured".to_string())
            }),
        }
    }

    /// Run already-validated code with `decision`.
    ///
    /// A result cached within the TTL is returned as-is. Exceptions thrown by
    /// user code, memory exhaustion and fuel exhaustion come back as an
    /// unsuccessful result; timeouts and infrastructure failures are errors.
    /// Only successful results are cached.
    #[tracing::instrument(
        skip(self, request, bindings),
        fields(strategy = %decision.strategy, execution_id = %bindings.execution_id)
    )]
    pub async fn execute(
        &self,
        decision: StrategyDecision,
        request: &ExecutionRequest,
        bindings: &ContextBindings,
    ) -> Result<Arc<ExecutionResult>> {
        let key = cache_key(decision.strategy, &request.code, bindings);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!("cache hit");
            return Ok(hit);
        }

        let strategy = self.strategy(decision.strategy)?;
        let program = Program::build(decision.strategy, &request.code, bindings)?;

        let started = Instant::now();
        let outcome = strategy.run(&program, request.timeout, request.max_memory).await;
        let elapsed = started.elapsed();

        let decoded = match outcome {
            Ok(raw) => decode_output(&raw, locate_last_json(&raw.stdout)),
            Err(SandboxError::Timeout(_)) => return Err(SandboxError::Timeout(request.timeout)),
            Err(e) if e.kind() == ErrorKind::Runtime => DecodedOutput {
                success: false,
                data: Value::Null,
                error: Some(e.to_string()),
                logs: Vec::new(),
                save_directive: None,
            },
            Err(e) => return Err(e),
        };

        let result = Arc::new(ExecutionResult {
            execution_id: bindings.execution_id.clone(),
            success: decoded.success,
            output: decoded.data,
            error: decoded.error,
            logs: decoded.logs,
            elapsed,
            strategy: decision.strategy,
            downgraded: decision.downgraded,
            save_directive: decoded.save_directive,
        });

        if self.cache.insert(key, Arc::clone(&result)) {
            tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "cached result");
        } else {
            tracing::debug!(error = ?result.error, "execution unsuccessful, not cached");
        }
        Ok(result)
    }

    /// Validate, select and execute in one call.
    pub async fn run(&self, request: &ExecutionRequest, bindings: &ContextBindings) -> Result<Arc<ExecutionResult>> {
        self.validate(&request.code)?;
        let decision = self.select_strategy(&request.code, &request.options).await?;
        self.execute(decision, request, bindings).await
    }

    /// The result cache.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Health of the Heavy strategy, `Unhealthy` when none is configured.
    pub async fn heavy_health(&self) -> HealthStatus {
        match &self.heavy {
            Some(heavy) => heavy.health().await,
            None => HealthStatus::Unhealthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::io::RawOutput;
    use crate::types::RequestDescriptor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Scripted {
        kind: Strategy,
        health: HealthStatus,
        stdout: String,
        error: Option<fn() -> SandboxError>,
        runs: AtomicUsize,
    }

    impl Scripted {
        fn new(kind: Strategy, stdout: &str) -> Self {
            Self {
                kind,
                health: HealthStatus::Healthy,
                stdout: stdout.to_string(),
                error: None,
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IsolationStrategy for Scripted {
        fn kind(&self) -> Strategy {
            self.kind
        }

        async fn health(&self) -> HealthStatus {
            self.health
        }

        async fn run(&self, _program: &Program, _timeout: Duration, _max_memory: u64) -> Result<RawOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(make) = self.error {
                return Err(make());
            }
            Ok(RawOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    fn envelope(success: bool, data: Value) -> String {
        let error = if success { Value::Null } else { json!("Error: boom") };
        json!({ "__envelope": 1, "success": success, "data": data, "error": error, "logs": [] })
            .to_string()
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            timeout: Duration::from_secs(1),
            max_memory: 1 << 20,
            request: RequestDescriptor::default(),
            collection_id: None,
            environment_id: None,
            user_id: "u1".into(),
            options: ExecutionOptions::default(),
        }
    }

    fn bindings(execution_id: &str) -> ContextBindings {
        ContextBindings {
            mock_data: json!([]),
            env: BTreeMap::new(),
            req: RequestDescriptor::default(),
            collection_id: None,
            execution_id: execution_id.into(),
            max_log_lines: 10,
        }
    }

    #[tokio::test]
    async fn second_identical_call_hits_cache() {
        let light = Arc::new(Scripted::new(Strategy::Light, &envelope(true, json!({ "n": 1 }))));
        let exec = CodeExecutor::new(&SandboxConfig::default(), light.clone(), None);

        let first = exec.run(&request("return { n: 1 };"), &bindings("a")).await.unwrap();
        let second = exec.run(&request("return { n: 1 };"), &bindings("b")).await.unwrap();

        assert!(first.success);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(light.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_results_and_not_cached() {
        let light = Arc::new(Scripted::new(Strategy::Light, &envelope(false, Value::Null)));
        let exec = CodeExecutor::new(&SandboxConfig::default(), light.clone(), None);

        let result = exec.run(&request("throw new Error('boom');"), &bindings("a")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Error: boom"));

        exec.run(&request("throw new Error('boom');"), &bindings("b")).await.unwrap();
        assert_eq!(light.runs.load(Ordering::SeqCst), 2);
        assert!(exec.cache().is_empty());
    }

    #[tokio::test]
    async fn memory_exhaustion_is_a_failed_result() {
        let mut light = Scripted::new(Strategy::Light, "");
        light.error = Some(|| SandboxError::MemoryLimitExceeded("64 bytes".into()));
        let exec = CodeExecutor::new(&SandboxConfig::default(), Arc::new(light), None);

        let result = exec.run(&request("return 1;"), &bindings("a")).await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("memory limit"));
    }

    #[tokio::test]
    async fn timeout_propagates() {
        let mut light = Scripted::new(Strategy::Light, "");
        light.error = Some(|| SandboxError::Timeout(Duration::ZERO));
        let exec = CodeExecutor::new(&SandboxConfig::default(), Arc::new(light), None);

        let err = exec.run(&request("return 1;"), &bindings("a")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(d) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn validation_runs_before_any_strategy() {
        let light = Arc::new(Scripted::new(Strategy::Light, ""));
        let exec = CodeExecutor::new(&SandboxConfig::default(), light.clone(), None);

        let err = exec.run(&request("return eval('1');"), &bindings("a")).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(light.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_code_goes_heavy_and_downgrades_without_backend() {
        let light = Arc::new(Scripted::new(Strategy::Light, &envelope(true, json!(1))));
        let heavy = Arc::new(Scripted::new(Strategy::Heavy, &envelope(true, json!(2))));
        let with_heavy = CodeExecutor::new(&SandboxConfig::default(), light.clone(), Some(heavy.clone()));

        let result = with_heavy.run(&request("return await 2;"), &bindings("a")).await.unwrap();
        assert_eq!(result.strategy, Strategy::Heavy);
        assert_eq!(result.output, json!(2));

        let without = CodeExecutor::new(&SandboxConfig::default(), light.clone(), None);
        let result = without.run(&request("return await 2;"), &bindings("a")).await.unwrap();
        assert_eq!(result.strategy, Strategy::Light);
        assert!(result.downgraded);
    }
}
