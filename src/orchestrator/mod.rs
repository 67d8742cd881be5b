//! Per-request pipeline around the [`CodeExecutor`].
//!
//! Stages run strictly in order and short-circuit on failure:
//! resolve, validate, authorize, rate limit, build context, execute, parse
//! output, apply save. Logging runs on every path and never fails the
//! request.

pub mod audit;
pub mod rate_limit;
pub mod save;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::collaborators::{
    AccessControl, EndpointRecord, EndpointStore, EnvironmentStore, MockCollection, MockDataStore,
};
use crate::environment::{EnvironmentManager, HealthStatus};
use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::executor::CodeExecutor;
use crate::sandbox::harness::ContextBindings;
use crate::types::{ExecutionOptions, ExecutionRequest, ExecutionResult, RequestDescriptor, Strategy};

use audit::{truncate_body, AuditSink, ExecutionLogRecord};
use rate_limit::RateLimiter;
use save::{complete_directive, AuthoritativeContext, CompletedSave, SaveOutcome, SavedData};

/// A caller asking for an endpoint to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Endpoint to run.
    pub endpoint_id: String,
    /// Caller.
    pub user_id: String,
    /// Mock-data collection to bind.
    pub collection_id: Option<String>,
    /// Variables environment to bind; the project default when `None`.
    pub environment_id: Option<String>,
    /// Inbound request.
    pub request: RequestDescriptor,
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    /// User code completed without throwing.
    pub success: bool,
    /// Returned value.
    pub data: Value,
    /// Error from user code.
    pub error: Option<String>,
    /// Console lines.
    pub logs: Vec<String>,
    /// Milliseconds spent in the sandbox.
    pub execution_time: u64,
    /// Save results, present when the code asked to save.
    pub saved_data: Option<SavedData>,
    /// Sandbox execution id.
    pub execution_id: String,
}

/// Overall service verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    /// Both strategies available.
    Healthy,
    /// Only Light is available.
    Degraded,
}

/// The health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Service verdict.
    pub status: ServiceStatus,
    /// Live Heavy environments.
    pub active_environments: usize,
    /// Heavy environment ceiling.
    pub max_environments: usize,
    /// Executions that reached the sandbox.
    pub total_executions: u64,
    /// Per-user hourly ceiling.
    pub rate_limit_ceiling: usize,
}

/// External systems the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Permission checks.
    pub access: Arc<dyn AccessControl>,
    /// Endpoint persistence.
    pub endpoints: Arc<dyn EndpointStore>,
    /// Mock-data storage.
    pub mock_data: Arc<dyn MockDataStore>,
    /// Variable resolution.
    pub environments: Arc<dyn EnvironmentStore>,
    /// Execution log.
    pub audit: Arc<dyn AuditSink>,
}

/// Facts gathered along the way, for the log record.
#[derive(Debug, Default)]
struct Trace {
    project_id: Option<String>,
    execution_id: Option<String>,
    strategy: Option<Strategy>,
    downgraded: bool,
    execution_ms: Option<u64>,
    status: Option<u16>,
}

/// Drives one endpoint invocation end to end.
pub struct Orchestrator {
    config: SandboxConfig,
    executor: Arc<CodeExecutor>,
    collaborators: Collaborators,
    environments: Option<Arc<EnvironmentManager>>,
    rate_limiter: RateLimiter,
    total_executions: AtomicU64,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("executor", &self.executor)
            .field("rate_limiter", &self.rate_limiter)
            .field("total_executions", &self.total_executions)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(config: SandboxConfig, executor: Arc<CodeExecutor>, collaborators: Collaborators) -> Self {
        let rate_limiter = RateLimiter::per_hour(config.rate_limit_per_hour);
        Self {
            config,
            executor,
            collaborators,
            environments: None,
            rate_limiter,
            total_executions: AtomicU64::new(0),
        }
    }

    /// Report Heavy environment counts from `manager` in [`Orchestrator::health`].
    pub fn with_environment_manager(mut self, manager: Arc<EnvironmentManager>) -> Self {
        self.environments = Some(manager);
        self
    }

    /// Replace the rate limiter.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Run an endpoint.
    ///
    /// Exceptions from user code come back as `Ok` with `success: false`.
    /// Rejections (validation, access, rate limit, ceiling, timeout) are
    /// errors. Either way exactly one log record is written.
    #[tracing::instrument(skip(self, invocation), fields(endpoint_id = %invocation.endpoint_id, user_id = %invocation.user_id))]
    pub async fn execute(&self, invocation: Invocation) -> Result<ExecutionResponse> {
        let started = Instant::now();
        let timestamp = Utc::now();
        let mut trace = Trace::default();

        let outcome = self.drive(&invocation, &mut trace).await;

        let record = self.log_record(&invocation, &trace, &outcome, started, timestamp);
        if let Err(e) = self.collaborators.audit.append(&record).await {
            tracing::warn!(error = %e, "failed to write execution log");
        }

        outcome
    }

    async fn drive(&self, invocation: &Invocation, trace: &mut Trace) -> Result<ExecutionResponse> {
        let endpoint = self
            .collaborators
            .endpoints
            .endpoint(&invocation.endpoint_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound {
                kind: "endpoint",
                id: invocation.endpoint_id.clone(),
            })?;
        trace.project_id = Some(endpoint.project_id.clone());

        // VALIDATE
        self.executor.validate(&endpoint.code)?;

        // AUTHORIZE
        let collection = self.authorize(invocation, &endpoint).await?;

        let remaining = self.rate_limiter.check(&invocation.user_id)?;
        tracing::debug!(remaining, "rate limit admitted");

        // CONTEXT_BUILD
        let execution_id = Uuid::new_v4().to_string();
        trace.execution_id = Some(execution_id.clone());
        let variables = self
            .collaborators
            .environments
            .variables(&endpoint.project_id, invocation.environment_id.as_deref())
            .await?;
        let bindings = ContextBindings {
            mock_data: collection
                .as_ref()
                .map(|c| Value::Array(c.items.clone()))
                .unwrap_or_else(|| Value::Array(Vec::new())),
            env: variables,
            req: invocation.request.clone(),
            collection_id: invocation.collection_id.clone(),
            execution_id: execution_id.clone(),
            max_log_lines: self.config.max_log_lines,
        };
        let request = ExecutionRequest {
            code: endpoint.code.clone(),
            timeout: self.config.effective_timeout(endpoint.timeout),
            max_memory: self.config.effective_memory(endpoint.memory_limit),
            request: invocation.request.clone(),
            collection_id: invocation.collection_id.clone(),
            environment_id: invocation.environment_id.clone(),
            user_id: invocation.user_id.clone(),
            options: ExecutionOptions {
                language: endpoint.language.clone(),
                require_isolation: endpoint.require_isolation,
            },
        };

        // EXECUTE
        let decision = self.executor.select_strategy(&request.code, &request.options).await?;
        trace.strategy = Some(decision.strategy);
        trace.downgraded = decision.downgraded;
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        let result = self.executor.execute(decision, &request, &bindings).await?;
        trace.execution_ms = Some(result.elapsed.as_millis() as u64);
        trace.status = Some(response_status(&result));

        // OUTPUT_PARSE + APPLY_SAVE
        let saved_data = match &result.save_directive {
            Some(directive) if result.success => {
                let ctx = AuthoritativeContext {
                    collection_id: invocation.collection_id.clone(),
                    execution_id: execution_id.clone(),
                    endpoint_id: endpoint.id.clone(),
                    user_id: invocation.user_id.clone(),
                    project_id: endpoint.project_id.clone(),
                };
                let outcome = match complete_directive(directive.clone(), &ctx) {
                    Ok(save) => self.apply_save(save).await,
                    Err(_) => SaveOutcome {
                        collection_id: None,
                        success: false,
                        version: None,
                        item_count: None,
                        error: Some("no target collection for save".to_string()),
                    },
                };
                Some(SavedData::from_outcomes(vec![outcome]))
            }
            _ => None,
        };

        if result.success {
            if let Err(e) = self
                .collaborators
                .endpoints
                .record_call(&endpoint.id, Utc::now())
                .await
            {
                tracing::warn!(error = %e, "failed to record endpoint call");
            }
        }

        Ok(ExecutionResponse {
            success: result.success,
            data: result.output.clone(),
            error: result.error.clone(),
            logs: result.logs.clone(),
            execution_time: result.elapsed.as_millis() as u64,
            saved_data,
            execution_id,
        })
    }

    /// Edit access on the endpoint's project and on the chosen collection's
    /// project. Returns the collection snapshot.
    async fn authorize(
        &self,
        invocation: &Invocation,
        endpoint: &EndpointRecord,
    ) -> Result<Option<MockCollection>> {
        let access = &self.collaborators.access;
        if !access
            .can_edit_project(&invocation.user_id, &endpoint.project_id)
            .await?
        {
            return Err(SandboxError::AccessDenied(format!(
                "user {} cannot edit project {}",
                invocation.user_id, endpoint.project_id
            )));
        }

        let Some(collection_id) = &invocation.collection_id else {
            return Ok(None);
        };
        let collection = self
            .collaborators
            .mock_data
            .collection(collection_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound {
                kind: "collection",
                id: collection_id.clone(),
            })?;
        if !access
            .can_edit_project(&invocation.user_id, &collection.project_id)
            .await?
        {
            return Err(SandboxError::AccessDenied(format!(
                "user {} cannot edit collection {}",
                invocation.user_id, collection_id
            )));
        }
        Ok(Some(collection))
    }

    async fn apply_save(&self, save: CompletedSave) -> SaveOutcome {
        let collection_id = save.collection_id.clone();
        let failed = |error: SandboxError| {
            tracing::warn!(collection_id = %collection_id, error = %error, "save directive not applied");
            SaveOutcome {
                collection_id: Some(collection_id.clone()),
                success: false,
                version: None,
                item_count: None,
                error: Some(error.to_string()),
            }
        };

        if save.needs_access_check {
            if let Err(e) = self.check_collection_access(&save).await {
                return failed(e);
            }
        }

        match self
            .collaborators
            .mock_data
            .save_from_execution(&save.collection_id, save.items, &save.user_id, &save.context)
            .await
        {
            Ok(receipt) => {
                tracing::info!(
                    collection_id = %receipt.collection_id,
                    version = receipt.version,
                    items = receipt.item_count,
                    "applied save directive"
                );
                SaveOutcome {
                    collection_id: Some(receipt.collection_id),
                    success: true,
                    version: Some(receipt.version),
                    item_count: Some(receipt.item_count),
                    error: None,
                }
            }
            Err(e) => failed(SandboxError::Persistence(e.to_string())),
        }
    }

    async fn check_collection_access(&self, save: &CompletedSave) -> Result<()> {
        let collection = self
            .collaborators
            .mock_data
            .collection(&save.collection_id)
            .await?
            .ok_or_else(|| SandboxError::NotFound {
                kind: "collection",
                id: save.collection_id.clone(),
            })?;
        if self
            .collaborators
            .access
            .can_edit_project(&save.user_id, &collection.project_id)
            .await?
        {
            Ok(())
        } else {
            Err(SandboxError::AccessDenied(format!(
                "user {} cannot edit collection {}",
                save.user_id, save.collection_id
            )))
        }
    }

    fn log_record(
        &self,
        invocation: &Invocation,
        trace: &Trace,
        outcome: &Result<ExecutionResponse>,
        started: Instant,
        timestamp: chrono::DateTime<Utc>,
    ) -> ExecutionLogRecord {
        let max = self.config.max_logged_body;
        let (status_code, response_body, error, error_code) = match outcome {
            Ok(response) => (
                trace.status.unwrap_or(200),
                truncate_body(&response.data, max),
                response.error.clone(),
                (!response.success).then(|| "RUNTIME_ERROR".to_string()),
            ),
            Err(e) => (e.status_code(), None, Some(e.to_string()), Some(e.code().to_string())),
        };

        ExecutionLogRecord {
            id: Uuid::new_v4().to_string(),
            execution_id: trace.execution_id.clone(),
            endpoint_id: invocation.endpoint_id.clone(),
            project_id: trace.project_id.clone(),
            user_id: invocation.user_id.clone(),
            method: invocation.request.method.clone(),
            path: invocation.request.path.clone(),
            status_code,
            request_body: truncate_body(&invocation.request.body, max),
            response_body,
            error,
            error_code,
            strategy: trace.strategy,
            downgraded: trace.downgraded,
            duration_ms: started.elapsed().as_millis() as u64,
            execution_ms: trace.execution_ms,
            timestamp,
        }
    }

    /// Current health.
    pub async fn health(&self) -> HealthReport {
        let (active, max) = match &self.environments {
            Some(manager) => (manager.active_count(), manager.max_environments()),
            None => (0, self.config.max_environments),
        };
        let status = match self.executor.heavy_health().await {
            HealthStatus::Healthy => ServiceStatus::Healthy,
            HealthStatus::Unhealthy => ServiceStatus::Degraded,
        };
        HealthReport {
            status,
            active_environments: active,
            max_environments: max,
            total_executions: self.total_executions.load(Ordering::Relaxed),
            rate_limit_ceiling: self.rate_limiter.limit(),
        }
    }

    /// Executions that reached the sandbox.
    pub fn total_executions(&self) -> u64 {
        self.total_executions.load(Ordering::Relaxed)
    }
}

/// Status for the log: 500 for failures, the `res` helper's status when
/// the code returned one, 200 otherwise.
fn response_status(result: &ExecutionResult) -> u16 {
    if !result.success {
        return 500;
    }
    result
        .output
        .as_object()
        .filter(|o| o.contains_key("body"))
        .and_then(|o| o.get("statusCode"))
        .and_then(Value::as_u64)
        .filter(|s| (100..=599).contains(s))
        .map(|s| s as u16)
        .unwrap_or(200)
}
