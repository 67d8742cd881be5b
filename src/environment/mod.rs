//! Lifecycle of disposable Heavy environments.
//!
//! The [`EnvironmentManager`] owns an explicit registry of live
//! environments. A slot is reserved under the registry lock before the
//! backend is asked to provision anything, so the ceiling holds under
//! concurrent creation. Removing the record from the registry is the single
//! point where an environment transitions to destroyed; whoever removes it
//! tears it down, everyone else sees a no-op.

pub mod backend;
pub mod docker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use backend::{EnvironmentBackend, EnvironmentSpec, HealthStatus, ResourceCeilings};
pub use docker::DockerBackend;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::harness::Program;
use crate::sandbox::io::{locate_last_json, ParsedOutput, RawOutput};

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvironmentState {
    /// Provisioned (or being provisioned), nothing run yet.
    Created,
    /// At least one program has been started inside it.
    Running,
    /// Torn down. Terminal.
    Destroyed,
}

/// Caller's reference to a registered environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentHandle {
    id: String,
}

impl EnvironmentHandle {
    /// Registry identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Registry snapshot of one environment.
#[derive(Debug, Clone)]
pub struct IsolatedEnvironment {
    /// Registry identifier.
    pub id: String,
    /// Backend reference; `None` while provisioning is in flight.
    pub backend_ref: Option<String>,
    /// When the slot was reserved.
    pub created_at: Instant,
    /// Last time a program was started or finished inside it.
    pub last_used: Instant,
    /// Ceilings it was provisioned with.
    pub ceilings: ResourceCeilings,
    /// Current state.
    pub state: EnvironmentState,
}

/// Output of one in-environment run.
#[derive(Debug, Clone)]
pub struct EnvironmentRun {
    /// Raw captured streams.
    pub raw: RawOutput,
    /// Last JSON value in stdout, or the opaque text.
    pub parsed: ParsedOutput,
}

/// Answer of [`EnvironmentManager::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentHealth {
    /// Live environments.
    pub active: usize,
    /// Configured ceiling.
    pub max: usize,
    /// Backend verdict.
    pub status: HealthStatus,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Environments currently registered.
    pub active: usize,
    /// Environments successfully provisioned.
    pub provisioned: u64,
    /// Environments removed from the registry.
    pub destroyed: u64,
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Creates, runs code inside, and destroys Heavy environments.
pub struct EnvironmentManager {
    backend: Arc<dyn EnvironmentBackend>,
    registry: Mutex<HashMap<String, IsolatedEnvironment>>,
    max_environments: usize,
    stop_grace: Duration,
    max_age: Duration,
    sweep_interval: Duration,
    image: String,
    cpus: f64,
    pids: i64,
    provisioned: AtomicU64,
    destroyed: AtomicU64,
}

impl std::fmt::Debug for EnvironmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentManager")
            .field("max_environments", &self.max_environments)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl EnvironmentManager {
    /// Create a manager over `backend` with the ceilings in `config`.
    pub fn new(backend: Arc<dyn EnvironmentBackend>, config: &SandboxConfig) -> Self {
        Self {
            backend,
            registry: Mutex::new(HashMap::new()),
            max_environments: config.max_environments,
            stop_grace: config.stop_grace,
            max_age: config.environment_max_age,
            sweep_interval: config.sweep_interval,
            image: config.heavy_image.clone(),
            cpus: config.cpu_quota,
            pids: config.pids_limit,
            provisioned: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, IsolatedEnvironment>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What this manager provisions for a run capped at `memory_bytes`.
    pub fn spec_for(&self, memory_bytes: u64) -> EnvironmentSpec {
        EnvironmentSpec {
            image: self.image.clone(),
            ceilings: ResourceCeilings {
                memory_bytes,
                cpus: self.cpus,
                pids: self.pids,
            },
        }
    }

    /// Reserve a slot and provision an environment.
    ///
    /// Fails with [`SandboxError::ResourceExhausted`] when the ceiling is
    /// reached; nothing is provisioned in that case.
    #[tracing::instrument(skip(self, spec), fields(image = %spec.image))]
    pub async fn create(&self, spec: EnvironmentSpec) -> Result<EnvironmentHandle> {
        let id = format!("sandbox-{}", Uuid::new_v4());
        {
            let mut registry = self.registry();
            let active = registry.len();
            if active >= self.max_environments {
                tracing::warn!(active, max = self.max_environments, "environment ceiling reached");
                return Err(SandboxError::ResourceExhausted {
                    active,
                    max: self.max_environments,
                });
            }
            let now = Instant::now();
            registry.insert(
                id.clone(),
                IsolatedEnvironment {
                    id: id.clone(),
                    backend_ref: None,
                    created_at: now,
                    last_used: now,
                    ceilings: spec.ceilings.clone(),
                    state: EnvironmentState::Created,
                },
            );
        }

        match self.backend.provision(&id, &spec).await {
            Ok(backend_ref) => {
                let mut registry = self.registry();
                match registry.get_mut(&id) {
                    Some(record) => {
                        record.backend_ref = Some(backend_ref);
                        record.last_used = Instant::now();
                    }
                    None => {
                        return Err(SandboxError::Internal(format!(
                            "environment {} vanished during provisioning",
                            id
                        )))
                    }
                }
                self.provisioned.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(environment = %id, "environment created");
                Ok(EnvironmentHandle { id })
            }
            Err(e) => {
                self.registry().remove(&id);
                Err(e)
            }
        }
    }

    /// Run `program` inside the environment under a hard deadline.
    ///
    /// On expiry the environment is force-destroyed before
    /// [`SandboxError::Timeout`] is returned.
    #[tracing::instrument(skip(self, program), fields(environment = %handle.id))]
    pub async fn run(
        &self,
        handle: &EnvironmentHandle,
        program: &Program,
        timeout: Duration,
    ) -> Result<EnvironmentRun> {
        let backend_ref = {
            let mut registry = self.registry();
            let record = registry
                .get_mut(&handle.id)
                .ok_or_else(|| SandboxError::NotFound {
                    kind: "environment",
                    id: handle.id.clone(),
                })?;
            let backend_ref = record.backend_ref.clone().ok_or_else(|| {
                SandboxError::Internal(format!("environment {} is not provisioned", handle.id))
            })?;
            record.state = EnvironmentState::Running;
            record.last_used = Instant::now();
            backend_ref
        };

        match tokio::time::timeout(timeout, self.backend.exec(&backend_ref, program)).await {
            Ok(outcome) => {
                if let Some(record) = self.registry().get_mut(&handle.id) {
                    record.last_used = Instant::now();
                }
                let raw = outcome?;
                let parsed = locate_last_json(&raw.stdout);
                Ok(EnvironmentRun { raw, parsed })
            }
            Err(_) => {
                tracing::warn!(?timeout, "execution deadline exceeded, force-destroying");
                self.force_destroy(handle).await;
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    fn take(&self, handle: &EnvironmentHandle) -> Option<IsolatedEnvironment> {
        let taken = self.registry().remove(&handle.id);
        if taken.is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// Stop gracefully, falling back to forced removal. Idempotent.
    #[tracing::instrument(skip(self), fields(environment = %handle.id))]
    pub async fn destroy(&self, handle: &EnvironmentHandle) -> Result<()> {
        let Some(record) = self.take(handle) else {
            return Ok(());
        };
        let Some(backend_ref) = record.backend_ref else {
            return Ok(());
        };

        if let Err(e) = self.backend.stop(&backend_ref, self.stop_grace).await {
            tracing::warn!(error = %e, "graceful stop failed, forcing removal");
            self.backend.kill(&backend_ref).await?;
        }
        tracing::debug!("environment destroyed");
        Ok(())
    }

    async fn force_destroy(&self, handle: &EnvironmentHandle) {
        let Some(backend_ref) = self.take(handle).and_then(|r| r.backend_ref) else {
            return;
        };
        if let Err(e) = self.backend.kill(&backend_ref).await {
            tracing::warn!(environment = %handle.id, error = %e, "forced removal failed");
        }
    }

    /// Current state of `handle`. Unknown handles report `Destroyed`.
    pub fn state(&self, handle: &EnvironmentHandle) -> EnvironmentState {
        self.registry()
            .get(&handle.id)
            .map(|r| r.state)
            .unwrap_or(EnvironmentState::Destroyed)
    }

    /// Active count, ceiling and backend verdict.
    pub async fn health_check(&self) -> EnvironmentHealth {
        EnvironmentHealth {
            active: self.active_count(),
            max: self.max_environments,
            status: self.backend.ping().await,
        }
    }

    /// Destroy every provisioned environment idle for longer than `max_age`.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let stale: Vec<EnvironmentHandle> = self
            .registry()
            .values()
            .filter(|r| r.backend_ref.is_some() && r.last_used.elapsed() > max_age)
            .map(|r| EnvironmentHandle { id: r.id.clone() })
            .collect();

        let mut swept = 0;
        for handle in &stale {
            match self.destroy(handle).await {
                Ok(()) => swept += 1,
                Err(e) => tracing::warn!(environment = %handle.id, error = %e, "sweep failed to destroy"),
            }
        }
        if swept > 0 {
            tracing::warn!(swept, "swept abandoned environments");
        }
        swept
    }

    /// Run [`EnvironmentManager::sweep`] on the configured interval until
    /// the returned handle is aborted.
    ///
    /// A zero interval is raised to one millisecond.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = manager.sweep_interval.max(MIN_SWEEP_INTERVAL);
        if period != manager.sweep_interval {
            tracing::warn!(?period, "sweep_interval of zero raised to the minimum");
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.sweep(manager.max_age).await;
            }
        })
    }

    /// Live environments, including in-flight reservations.
    pub fn active_count(&self) -> usize {
        self.registry().len()
    }

    /// Configured ceiling.
    pub fn max_environments(&self) -> usize {
        self.max_environments
    }

    /// Snapshot of the registry.
    pub fn environments(&self) -> Vec<IsolatedEnvironment> {
        self.registry().values().cloned().collect()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active: self.active_count(),
            provisioned: self.provisioned.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}
