//! Heavy isolation backed by Docker containers through bollard.
//!
//! Each environment is a long-lived idle container (`tail -f /dev/null`)
//! created with networking disabled, a read-only root filesystem, all
//! capabilities dropped and memory/CPU/pid ceilings. Programs run through
//! `docker exec` with the harness input written to the exec's stdin.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    RemoveContainerOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio::io::AsyncWriteExt;

use super::backend::{EnvironmentBackend, EnvironmentSpec, HealthStatus};
use crate::error::{Result, SandboxError};
use crate::sandbox::harness::Program;
use crate::sandbox::io::{RawOutput, MAX_CAPTURED_OUTPUT};

/// Label attached to every container this backend creates.
pub const ENVIRONMENT_LABEL: &str = "endpoint-sandbox.environment";

/// Unprivileged uid:gid the harness runs as.
const SANDBOX_USER: &str = "65534:65534";

/// Docker-backed [`EnvironmentBackend`].
pub struct DockerBackend {
    docker: Docker,
    // images known to be present locally
    ready_images: Mutex<HashSet<String>>,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Backend(anyhow::anyhow!("failed to connect to Docker: {}", e)))?;
        Ok(Self::with_client(docker))
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            ready_images: Mutex::new(HashSet::new()),
        }
    }

    fn is_ready(&self, image: &str) -> bool {
        self.ready_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(image)
    }

    fn mark_ready(&self, image: &str) {
        self.ready_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image.to_string());
    }

    /// Pull `image` unless it is already present.
    ///
    /// Called by [`EnvironmentBackend::provision`]; embedders may call it at
    /// startup to take the pull off the first request.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.is_ready(image) {
            return Ok(());
        }
        if self.docker.inspect_image(image).await.is_ok() {
            self.mark_ready(image);
            return Ok(());
        }

        tracing::info!(image, "pulling sandbox image");
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut pull = self.docker.create_image(options, None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| backend_error("failed to pull image", e))?;
        }
        self.mark_ready(image);
        Ok(())
    }

    fn container_body(spec: &EnvironmentSpec) -> ContainerCreateBody {
        ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some("/tmp".to_string()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(ENVIRONMENT_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                memory: Some(i64::try_from(spec.ceilings.memory_bytes).unwrap_or(i64::MAX)),
                memory_swap: Some(i64::try_from(spec.ceilings.memory_bytes).unwrap_or(i64::MAX)),
                nano_cpus: Some((spec.ceilings.cpus * 1_000_000_000.0) as i64),
                pids_limit: Some(spec.ceilings.pids),
                readonly_rootfs: Some(true),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,noexec,nosuid,size=16m".to_string(),
                )])),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn backend_error(context: &str, e: bollard::errors::Error) -> SandboxError {
    SandboxError::Backend(anyhow::anyhow!("{}: {}", context, e))
}

#[async_trait]
impl EnvironmentBackend for DockerBackend {
    async fn provision(&self, name: &str, spec: &EnvironmentSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(name.to_string()),
            ..Default::default()
        });

        let container = self
            .docker
            .create_container(options, Self::container_body(spec))
            .await
            .map_err(|e| backend_error("failed to create container", e))?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
        {
            if let Err(cleanup) = self.kill(&container.id).await {
                tracing::warn!(container = %container.id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(backend_error("failed to start container", e));
        }

        tracing::debug!(container = %container.id, name, "provisioned environment");
        Ok(container.id)
    }

    async fn exec(&self, backend_ref: &str, program: &Program) -> Result<RawOutput> {
        let exec = self
            .docker
            .create_exec(
                backend_ref,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![
                        "node".to_string(),
                        "-e".to_string(),
                        program.source.clone(),
                    ]),
                    user: Some(SANDBOX_USER.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| backend_error("failed to create exec", e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| backend_error("failed to start exec", e))?;

        let (mut output, mut input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(SandboxError::Backend(anyhow::anyhow!(
                    "exec started detached; no output to collect"
                )))
            }
        };

        input.write_all(program.input.as_bytes()).await?;
        input.shutdown().await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = output.next().await {
            match chunk.map_err(|e| backend_error("failed to read exec output", e))? {
                LogOutput::StdOut { message } if stdout.len() < MAX_CAPTURED_OUTPUT => {
                    stdout.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdErr { message } if stderr.len() < MAX_CAPTURED_OUTPUT => {
                    stderr.push_str(&String::from_utf8_lossy(&message))
                }
                _ => {}
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| backend_error("failed to inspect exec", e))?;

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn stop(&self, backend_ref: &str, grace: Duration) -> Result<()> {
        let stop = StopContainerOptionsBuilder::default()
            .t(i32::try_from(grace.as_secs()).unwrap_or(i32::MAX))
            .build();
        self.docker
            .stop_container(backend_ref, Some(stop))
            .await
            .map_err(|e| backend_error("failed to stop container", e))?;

        let remove = RemoveContainerOptionsBuilder::default().v(true).build();
        self.docker
            .remove_container(backend_ref, Some(remove))
            .await
            .map_err(|e| backend_error("failed to remove container", e))
    }

    async fn kill(&self, backend_ref: &str) -> Result<()> {
        let remove = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(true)
            .build();
        match self.docker.remove_container(backend_ref, Some(remove)).await {
            Ok(()) => Ok(()),
            // already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(backend_error("failed to force-remove container", e)),
        }
    }

    async fn ping(&self) -> HealthStatus {
        match self.docker.ping().await {
            Ok(_) => HealthStatus::Healthy,
            Err(e) => {
                tracing::warn!(error = %e, "docker health check failed");
                HealthStatus::Unhealthy
            }
        }
    }
}
