//! The seam between the lifecycle manager and whatever provides isolation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::harness::Program;
use crate::sandbox::io::RawOutput;

/// Resource ceilings applied to one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCeilings {
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// CPU share (1.0 = one core).
    pub cpus: f64,
    /// Maximum number of processes.
    pub pids: i64,
}

/// What to provision.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSpec {
    /// Container image.
    pub image: String,
    /// Resource ceilings.
    pub ceilings: ResourceCeilings,
}

/// Verdict of a backend health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// The backend answered.
    Healthy,
    /// The backend is unreachable or failing.
    Unhealthy,
}

/// A provider of disposable isolated environments.
///
/// Implementations must provision environments with no network access, a
/// read-only root filesystem and the given ceilings.
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Provision an environment and return the backend's reference to it.
    async fn provision(&self, name: &str, spec: &EnvironmentSpec) -> Result<String>;

    /// Run a harness program inside a provisioned environment.
    async fn exec(&self, backend_ref: &str, program: &Program) -> Result<RawOutput>;

    /// Stop gracefully within `grace`, then remove.
    async fn stop(&self, backend_ref: &str, grace: Duration) -> Result<()>;

    /// Remove immediately.
    async fn kill(&self, backend_ref: &str) -> Result<()>;

    /// Probe the backend.
    async fn ping(&self) -> HealthStatus;
}
