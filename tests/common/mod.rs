//! Shared fixtures: a scripted Light strategy, an in-process container
//! backend and a fully wired orchestrator over in-memory collaborators.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use endpoint_sandbox_rs::collaborators::memory::{
    MemoryAccessControl, MemoryEndpointStore, MemoryEnvironmentStore, MemoryMockDataStore,
};
use endpoint_sandbox_rs::collaborators::{EndpointRecord, MockCollection};
use endpoint_sandbox_rs::environment::{EnvironmentSpec, HealthStatus};
use endpoint_sandbox_rs::orchestrator::audit::{AuditSink, ExecutionLogRecord, MemoryAuditSink};
use endpoint_sandbox_rs::orchestrator::Collaborators;
use endpoint_sandbox_rs::prelude::*;
use endpoint_sandbox_rs::sandbox::harness::Program;
use endpoint_sandbox_rs::sandbox::io::RawOutput;

/// What a fake interpreter sees: the user code and the bound context.
#[derive(Debug, Clone)]
pub struct HarnessView {
    pub code: String,
    pub bindings: Value,
}

impl HarnessView {
    fn from_program(program: &Program) -> Self {
        let input: Value = serde_json::from_str(&program.input).unwrap_or(Value::Null);
        Self {
            code: input["code"].as_str().unwrap_or_default().to_string(),
            bindings: input["bindings"].clone(),
        }
    }

    pub fn execution_id(&self) -> &str {
        self.bindings["executionId"].as_str().unwrap_or_default()
    }

    pub fn collection_id(&self) -> Value {
        self.bindings["collectionId"].clone()
    }
}

pub type Responder = Arc<dyn Fn(&HarnessView) -> RawOutput + Send + Sync>;

/// Harness envelope as the real harness prints it.
pub fn envelope(data: Value) -> RawOutput {
    stdout(json!({ "__envelope": 1, "success": true, "data": data, "error": null, "logs": [] }))
}

/// Envelope carrying a save directive for `items`.
pub fn envelope_with_save(view: &HarnessView, data: Value, items: Value) -> RawOutput {
    stdout(json!({
        "__envelope": 1,
        "success": true,
        "data": data,
        "error": null,
        "logs": ["saving"],
        "__saveDirective": {
            "collectionId": view.collection_id(),
            "items": items,
            "executionId": view.execution_id(),
        }
    }))
}

/// Envelope for code that threw.
pub fn thrown(error: &str) -> RawOutput {
    stdout(json!({ "__envelope": 1, "success": false, "data": null, "error": error, "logs": [] }))
}

fn stdout(envelope: Value) -> RawOutput {
    RawOutput {
        stdout: format!("{}\n", envelope),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Light strategy that answers from a closure instead of an interpreter.
pub struct ScriptedStrategy {
    respond: Responder,
    pub runs: AtomicUsize,
}

impl ScriptedStrategy {
    pub fn new(respond: Responder) -> Self {
        Self {
            respond,
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IsolationStrategy for ScriptedStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Light
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn run(&self, program: &Program, _timeout: Duration, _max_memory: u64) -> Result<RawOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok((self.respond)(&HarnessView::from_program(program)))
    }
}

/// Container backend that lives in process memory.
pub struct FakeBackend {
    respond: Responder,
    pub exec_delay: Duration,
    pub healthy: AtomicBool,
    pub provisioned: AtomicUsize,
    pub execs: AtomicUsize,
    pub stopped: AtomicUsize,
    pub killed: AtomicUsize,
}

impl FakeBackend {
    pub fn new(respond: Responder) -> Self {
        Self {
            respond,
            exec_delay: Duration::ZERO,
            healthy: AtomicBool::new(true),
            provisioned: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Environments torn down by either path.
    pub fn torn_down(&self) -> usize {
        self.stopped.load(Ordering::SeqCst) + self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentBackend for FakeBackend {
    async fn provision(&self, name: &str, _spec: &EnvironmentSpec) -> Result<String> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-{}", name))
    }

    async fn exec(&self, _backend_ref: &str, program: &Program) -> Result<RawOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        Ok((self.respond)(&HarnessView::from_program(program)))
    }

    async fn stop(&self, _backend_ref: &str, _grace: Duration) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self, _backend_ref: &str) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> HealthStatus {
        if self.healthy.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Everything wired together.
pub struct Fixture {
    pub access: Arc<MemoryAccessControl>,
    pub endpoints: Arc<MemoryEndpointStore>,
    pub mock_data: Arc<MemoryMockDataStore>,
    pub variables: Arc<MemoryEnvironmentStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub light: Arc<ScriptedStrategy>,
    pub backend: Arc<FakeBackend>,
    pub manager: Arc<EnvironmentManager>,
    pub orchestrator: Orchestrator,
}

impl Fixture {
    pub fn new(config: SandboxConfig, light: Responder, backend: FakeBackend) -> Self {
        Self::build(config, light, backend, None)
    }

    /// Like [`Fixture::new`], but every log record goes to `sink`; `audit` stays empty.
    pub fn with_audit_sink(
        config: SandboxConfig,
        light: Responder,
        backend: FakeBackend,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self::build(config, light, backend, Some(sink))
    }

    fn build(
        config: SandboxConfig,
        light: Responder,
        backend: FakeBackend,
        sink: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let access = Arc::new(MemoryAccessControl::new());
        let endpoints = Arc::new(MemoryEndpointStore::new());
        let mock_data = Arc::new(MemoryMockDataStore::new());
        let variables = Arc::new(MemoryEnvironmentStore::new());
        let audit = Arc::new(MemoryAuditSink::new());

        let light = Arc::new(ScriptedStrategy::new(light));
        let backend = Arc::new(backend);
        let manager = Arc::new(EnvironmentManager::new(backend.clone(), &config));
        let heavy = Arc::new(HeavyStrategy::new(Arc::clone(&manager)));
        let executor = Arc::new(CodeExecutor::new(&config, light.clone(), Some(heavy)));

        let collaborators = Collaborators {
            access: access.clone(),
            endpoints: endpoints.clone(),
            mock_data: mock_data.clone(),
            environments: variables.clone(),
            audit: sink.unwrap_or_else(|| audit.clone()),
        };
        let orchestrator = Orchestrator::new(config, executor, collaborators)
            .with_environment_manager(Arc::clone(&manager));

        access.grant_edit("alice", "proj-1");
        variables.set_default(
            "proj-1",
            BTreeMap::from([("API_URL".to_string(), "https://api.example.test".to_string())]),
        );
        mock_data.insert(MockCollection {
            id: "users".into(),
            project_id: "proj-1".into(),
            name: "Users".into(),
            items: vec![json!({ "id": 1, "name": "ada" })],
            schema: None,
            version: 1,
        });

        Self {
            access,
            endpoints,
            mock_data,
            variables,
            audit,
            light,
            backend,
            manager,
            orchestrator,
        }
    }

    /// Register an endpoint in `proj-1` running `code`.
    pub fn endpoint(&self, id: &str, code: &str) {
        self.endpoints.insert(EndpointRecord {
            id: id.into(),
            project_id: "proj-1".into(),
            method: "POST".into(),
            path: format!("/{}", id),
            code: code.into(),
            timeout: None,
            memory_limit: None,
            language: None,
            require_isolation: false,
            call_count: 0,
            last_called_at: None,
        });
    }

    pub fn light_runs(&self) -> usize {
        self.light.runs.load(Ordering::SeqCst)
    }
}

/// Invocation of `endpoint_id` by `user_id`, optionally bound to a collection.
pub fn invocation(endpoint_id: &str, user_id: &str, collection_id: Option<&str>) -> Invocation {
    Invocation {
        endpoint_id: endpoint_id.into(),
        user_id: user_id.into(),
        collection_id: collection_id.map(str::to_string),
        environment_id: None,
        request: RequestDescriptor {
            method: "POST".into(),
            path: format!("/{}", endpoint_id),
            body: json!({ "name": "grace" }),
            ..Default::default()
        },
    }
}

/// Responder that always returns `data`.
pub fn always(data: Value) -> Responder {
    Arc::new(move |_| envelope(data.clone()))
}

/// Audit sink whose writes always fail.
#[derive(Default)]
pub struct FailingAuditSink {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn append(&self, _record: &ExecutionLogRecord) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SandboxError::Persistence("log store unavailable".into()))
    }
}
