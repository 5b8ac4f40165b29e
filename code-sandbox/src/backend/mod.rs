//! Execution backends: where compiled and interpreted code actually runs

mod container;
mod local;

pub use container::{ContainerBackend, ContainerLimits};
pub use local::{LocalBackend, LocalLimits};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    languages::LanguageProfile,
    types::{BackendKind, ExecutionId, ProcessHandle, ResourceUsage},
    Result,
};

/// Captured stdout/stderr is cut off past this many bytes
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Called with the container or process handle as soon as it exists
pub type LaunchCallback = Arc<dyn Fn(ProcessHandle) + Send + Sync>;

/// One unit of work for a backend
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub id: ExecutionId,
    pub profile: LanguageProfile,
    pub code: String,
    /// Wall-clock limit of the run step
    pub timeout: Duration,
}

pub struct ExecutionContext {
    /// Fired by `kill`; timeouts are raced separately against the same future
    pub cancel: CancellationToken,
    pub on_launch: LaunchCallback,
    pub monitor_interval: Duration,
}

/// How the backend stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    CompileFailed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub termination: Termination,
    pub usage: ResourceUsage,
}

impl BackendOutput {
    fn interrupted(termination: Termination, usage: ResourceUsage) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            termination,
            usage,
        }
    }
}

/// Runs a job to completion, timeout or cancellation.
///
/// Implementations release every temporary directory, process and container
/// they create before returning, on success and on error alike.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(&self, job: &ExecutionJob, ctx: &ExecutionContext) -> Result<BackendOutput>;
}

pub(crate) enum Raced<T> {
    Finished(T),
    TimedOut,
    Cancelled,
}

/// Race `fut` against a wall-clock limit and the cancellation token
pub(crate) async fn race<F: Future>(
    fut: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Raced<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Raced::Cancelled,
        output = fut => Raced::Finished(output),
        _ = tokio::time::sleep(timeout) => Raced::TimedOut,
    }
}

pub(crate) fn truncate_output(mut output: String) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output;
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_race_outcomes() {
        let cancel = CancellationToken::new();
        assert!(matches!(
            race(async { 7 }, Duration::from_secs(1), &cancel).await,
            Raced::Finished(7)
        ));
        assert!(matches!(
            race(
                tokio::time::sleep(Duration::from_secs(5)),
                Duration::from_millis(10),
                &cancel
            )
            .await,
            Raced::TimedOut
        ));

        cancel.cancel();
        assert!(matches!(
            race(async { 7 }, Duration::from_secs(1), &cancel).await,
            Raced::Cancelled
        ));
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short".to_string()), "short");

        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let truncated = truncate_output(long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert!(truncated.len() <= MAX_OUTPUT_BYTES + TRUNCATION_MARKER.len());
    }
}
