use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    race, truncate_output, BackendOutput, ExecutionBackend, ExecutionContext, ExecutionJob, Raced,
    Termination,
};
use crate::{
    error::Error,
    monitor::{ProcStatsSource, ResourceMonitor},
    types::{BackendKind, ProcessHandle, ResourceUsage},
    Result,
};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// rlimits applied to every local child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalLimits {
    pub max_file_size_mb: u64,
}

impl Default for LocalLimits {
    fn default() -> Self {
        Self {
            max_file_size_mb: 64,
        }
    }
}

/// Runs each job as a direct child process in its own process group.
///
/// This offers far weaker isolation than [`super::ContainerBackend`]: the child
/// shares the host's network, filesystem and user.
pub struct LocalBackend {
    limits: LocalLimits,
}

/// What happened to one spawned process
struct ProcessRun {
    outcome: Raced<std::process::Output>,
    usage: ResourceUsage,
    elapsed: Duration,
}

impl LocalBackend {
    pub fn new(limits: LocalLimits) -> Self {
        Self { limits }
    }

    async fn spawn_and_wait(
        &self,
        argv: &[String],
        workdir: &Path,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<ProcessRun> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Configuration("empty command".to_string()))?;
        let program = resolve(program)?;

        let mut command = Command::new(&program);
        command
            .args(args)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // CPU seconds get one second of headroom over the wall-clock limit
        let cpu_secs = timeout.as_secs().saturating_add(1);
        let file_size = self.limits.max_file_size_mb.saturating_mul(1024 * 1024);
        unsafe {
            command.pre_exec(move || {
                // Own process group so the whole tree can be killed at once
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::other(format!("Failed to set process group: {}", e)))?;
                setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)
                    .map_err(|e| std::io::Error::other(format!("Failed to set CPU limit: {}", e)))?;
                setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size).map_err(|e| {
                    std::io::Error::other(format!("Failed to set file size limit: {}", e))
                })?;
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn {}: {}", program.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Sandbox("Child exited before it could be tracked".to_string()))?;
        (ctx.on_launch)(ProcessHandle::Process { pid });
        debug!(pid, program = %program.display(), "Spawned local process");

        let monitor = ResourceMonitor::spawn(
            ProcStatsSource::new(pid),
            ctx.monitor_interval,
            ctx.cancel.child_token(),
        );

        let started = Instant::now();
        let outcome = match race(child.wait_with_output(), timeout, &ctx.cancel).await {
            Raced::Finished(output) => Raced::Finished(
                output.map_err(|e| Error::ExecutionError(format!("Process error: {}", e)))?,
            ),
            interrupted => {
                kill_group(pid);
                match interrupted {
                    Raced::TimedOut => Raced::TimedOut,
                    _ => Raced::Cancelled,
                }
            }
        };
        let elapsed = started.elapsed();
        let usage = monitor.stop().await;

        Ok(ProcessRun {
            outcome,
            usage,
            elapsed,
        })
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn execute(&self, job: &ExecutionJob, ctx: &ExecutionContext) -> Result<BackendOutput> {
        let workspace = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(|e| Error::Sandbox(format!("Failed to create workspace: {}", e)))?;
        let source_path = workspace.path().join(job.profile.source_file_name());
        tokio::fs::write(&source_path, &job.code)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to write source file: {}", e)))?;

        let source = source_path.to_string_lossy().to_string();
        let binary = workspace.path().join("program").to_string_lossy().to_string();
        let mut compile_time = None;

        if let Some(compile) = job.profile.compile_command(&source, &binary) {
            let run = self
                .spawn_and_wait(&compile, workspace.path(), job.profile.timeout, ctx)
                .await?;
            compile_time = Some(run.elapsed.as_secs_f64());
            let usage = ResourceUsage {
                compile_time_secs: compile_time,
                ..Default::default()
            };

            match run.outcome {
                Raced::Finished(output) if !output.status.success() => {
                    return Ok(finished(output, Termination::CompileFailed, usage));
                }
                Raced::Finished(_) => {}
                Raced::TimedOut => {
                    return Ok(BackendOutput::interrupted(Termination::TimedOut, usage))
                }
                Raced::Cancelled => {
                    return Ok(BackendOutput::interrupted(Termination::Cancelled, usage))
                }
            }
        }

        let argv = job.profile.run_command(&source, &binary);
        let run = self
            .spawn_and_wait(&argv, workspace.path(), job.timeout, ctx)
            .await?;

        let mut usage = run.usage;
        usage.execution_time_secs = run.elapsed.as_secs_f64();
        usage.compile_time_secs = compile_time;

        Ok(match run.outcome {
            Raced::Finished(output) => finished(output, Termination::Exited, usage),
            Raced::TimedOut => BackendOutput::interrupted(Termination::TimedOut, usage),
            Raced::Cancelled => BackendOutput::interrupted(Termination::Cancelled, usage),
        })
    }
}

/// Absolute paths are used as-is, anything else must be on `PATH`
fn resolve(program: &str) -> Result<PathBuf> {
    let path = Path::new(program);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    which::which(program)
        .map_err(|e| Error::BackendUnavailable(format!("{} not found on PATH: {}", program, e)))
}

fn kill_group(pid: u32) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // ESRCH: the group already exited
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, "Failed to kill process group: {}", e);
        }
    }
}

fn finished(
    output: std::process::Output,
    termination: Termination,
    usage: ResourceUsage,
) -> BackendOutput {
    BackendOutput {
        stdout: truncate_output(String::from_utf8_lossy(&output.stdout).to_string()),
        stderr: truncate_output(String::from_utf8_lossy(&output.stderr).to_string()),
        exit_code: Some(exit_code(&output.status)),
        termination,
        usage,
    }
}

/// Signal deaths are reported shell-style as 128 + signal
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
