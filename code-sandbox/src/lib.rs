//! # Code Sandbox
//!
//! Runs untrusted code snippets in Python, JavaScript, Rust, C++ and Bash.
//! Every submission is risk-scored before it may run, dispatched to a
//! network-less container (or, when policy allows, a local child process),
//! sampled for CPU and memory while it runs, and graded for code quality.

mod backend;
mod config;
mod engine;
mod error;
mod languages;
mod manager;
mod monitor;
mod quality;
mod security;
mod store;
mod types;

#[cfg(test)]
mod tests;

pub use backend::{
    BackendOutput, ContainerBackend, ContainerLimits, ExecutionBackend, ExecutionContext,
    ExecutionJob, LaunchCallback, LocalBackend, LocalLimits, Termination,
};
pub use config::{IsolationPolicy, SandboxConfig};
pub use engine::{ContainerEngine, ContainerSpec, DockerCli, ExecOutput};
pub use error::Error;
pub use languages::{LanguageProfile, LanguageRegistry, ProfileOverride};
pub use manager::{AnalysisReport, SandboxManager, SandboxManagerBuilder, REDUCED_ISOLATION_WARNING};
pub use monitor::{ResourceMonitor, StatsSnapshot, StatsSource};
pub use quality::{CodeQualityAnalyzer, CodeQualityMetrics, Grade};
pub use security::{AnalyzerOptions, SecurityAnalysis, SecurityAnalyzer, Threat, ThreatCategory};
pub use types::{
    BackendKind, ExecutionFilter, ExecutionId, ExecutionStatus, Language, ProcessHandle,
    ResourceSample, ResourceUsage, SandboxExecution, SandboxStatistics, SecurityLevel,
    SubmitRequest,
};

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, Error>;
