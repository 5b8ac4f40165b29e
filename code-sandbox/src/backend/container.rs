use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{
    race, truncate_output, BackendOutput, ExecutionBackend, ExecutionContext, ExecutionJob, Raced,
    Termination,
};
use crate::{
    engine::{
        ContainerEngine, ContainerSpec, ContainerStatsSource, ExecOutput, CONTAINER_SCRATCH,
        CONTAINER_WORKSPACE,
    },
    error::Error,
    monitor::ResourceMonitor,
    types::{BackendKind, ProcessHandle, ResourceUsage},
    Result,
};

/// Hardening knobs applied to every container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerLimits {
    pub pids_limit: u32,
    pub tmpfs_size_mb: u64,
    pub user: String,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            pids_limit: 64,
            tmpfs_size_mb: 64,
            user: "65534:65534".to_string(),
        }
    }
}

/// Runs each job in a fresh network-less container with a read-only source mount
pub struct ContainerBackend {
    engine: Arc<dyn ContainerEngine>,
    limits: ContainerLimits,
}

impl ContainerBackend {
    pub fn new(engine: Arc<dyn ContainerEngine>, limits: ContainerLimits) -> Self {
        Self { engine, limits }
    }

    async fn run_in_container(
        &self,
        container: &str,
        job: &ExecutionJob,
        ctx: &ExecutionContext,
    ) -> Result<BackendOutput> {
        let source = format!("{}/{}", CONTAINER_WORKSPACE, job.profile.source_file_name());
        let binary = format!("{}/program", CONTAINER_SCRATCH);
        let mut compile_time = None;

        if let Some(compile) = job.profile.compile_command(&source, &binary) {
            let started = Instant::now();
            let raced = race(
                self.engine.exec(container, &compile),
                job.profile.timeout,
                &ctx.cancel,
            )
            .await;
            let elapsed = started.elapsed().as_secs_f64();
            compile_time = Some(elapsed);

            let usage = ResourceUsage {
                compile_time_secs: compile_time,
                ..Default::default()
            };
            match raced {
                Raced::Finished(output) => {
                    let output = output?;
                    if output.exit_code != 0 {
                        debug!(id = %job.id, exit_code = output.exit_code, "Compilation failed");
                        return Ok(finished(output, Termination::CompileFailed, usage));
                    }
                }
                Raced::TimedOut => {
                    return Ok(BackendOutput::interrupted(Termination::TimedOut, usage))
                }
                Raced::Cancelled => {
                    return Ok(BackendOutput::interrupted(Termination::Cancelled, usage))
                }
            }
        }

        let run = job.profile.run_command(&source, &binary);
        let monitor = ResourceMonitor::spawn(
            ContainerStatsSource::new(self.engine.clone(), container),
            ctx.monitor_interval,
            ctx.cancel.child_token(),
        );

        let started = Instant::now();
        let raced = race(self.engine.exec(container, &run), job.timeout, &ctx.cancel).await;
        let elapsed = started.elapsed().as_secs_f64();

        let mut usage = monitor.stop().await;
        usage.execution_time_secs = elapsed;
        usage.compile_time_secs = compile_time;

        Ok(match raced {
            Raced::Finished(output) => finished(output?, Termination::Exited, usage),
            Raced::TimedOut => BackendOutput::interrupted(Termination::TimedOut, usage),
            Raced::Cancelled => BackendOutput::interrupted(Termination::Cancelled, usage),
        })
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(&self, job: &ExecutionJob, ctx: &ExecutionContext) -> Result<BackendOutput> {
        let workspace = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(|e| Error::Sandbox(format!("Failed to create workspace: {}", e)))?;
        write_source(workspace.path(), &job.profile.source_file_name(), &job.code).await?;

        let spec = ContainerSpec {
            name: job.id.to_string(),
            image: job.profile.image.clone(),
            host_workspace: workspace.path().to_path_buf(),
            memory_limit_mb: job.profile.memory_limit_mb,
            pids_limit: self.limits.pids_limit,
            tmpfs_size_mb: self.limits.tmpfs_size_mb,
            user: self.limits.user.clone(),
        };

        let container = self.engine.create(&spec).await?;
        info!(id = %job.id, %container, image = %spec.image, "Container started");
        (ctx.on_launch)(ProcessHandle::Container {
            id: container.clone(),
        });

        let result = self.run_in_container(&container, job, ctx).await;

        if let Err(e) = self.engine.remove(&container).await {
            warn!(id = %job.id, %container, "Failed to remove container: {}", e);
        }
        result
    }
}

fn finished(output: ExecOutput, termination: Termination, usage: ResourceUsage) -> BackendOutput {
    BackendOutput {
        stdout: truncate_output(output.stdout),
        stderr: truncate_output(output.stderr),
        exit_code: Some(output.exit_code),
        termination,
        usage,
    }
}

/// Write the source where an unprivileged container user can read it
async fn write_source(dir: &Path, file_name: &str, code: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(file_name);
    tokio::fs::write(&path, code)
        .await
        .map_err(|e| Error::Sandbox(format!("Failed to write source file: {}", e)))?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
    Ok(())
}
