//! Prelude module for convenient imports.

pub use crate::collaborators::{AccessControl, EndpointStore, EnvironmentStore, MockDataStore};
pub use crate::environment::{DockerBackend, EnvironmentBackend, EnvironmentManager};
pub use crate::error::{Result, SandboxError};
pub use crate::orchestrator::{
    audit::AuditSink, Collaborators, ExecutionResponse, Invocation, Orchestrator,
};
pub use crate::sandbox::{
    config::SandboxConfig,
    executor::CodeExecutor,
    light::ScriptSandbox,
    strategy::{HeavyStrategy, IsolationStrategy, LightStrategy},
};
pub use crate::types::{
    ExecutionOptions, ExecutionRequest, ExecutionResult, RequestDescriptor, Strategy,
};
