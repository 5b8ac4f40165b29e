use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{error::Error, quality::CodeQualityMetrics, security::SecurityAnalysis};

/// Number of resource samples retained per execution
pub const MAX_SAMPLE_HISTORY: usize = 512;

/// Supported programming languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Rust,
    Cpp,
    Bash,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::JavaScript,
        Language::Rust,
        Language::Cpp,
        Language::Bash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Rust => "rust",
            Language::Cpp => "cpp",
            Language::Bash => "bash",
        }
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "rust" | "rs" => Ok(Language::Rust),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            _ => Err(Error::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse risk classification gating whether code may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Maximum,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
            SecurityLevel::Maximum => "maximum",
        }
    }

    /// Bucket a risk score into a level
    pub fn from_risk_score(score: f64) -> Self {
        if score > 10.0 {
            SecurityLevel::Maximum
        } else if score > 5.0 {
            SecurityLevel::High
        } else if score > 2.0 {
            SecurityLevel::Medium
        } else {
            SecurityLevel::Low
        }
    }
}

impl FromStr for SecurityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(SecurityLevel::Low),
            "medium" => Ok(SecurityLevel::Medium),
            "high" => Ok(SecurityLevel::High),
            "maximum" | "max" => Ok(SecurityLevel::Maximum),
            other => Err(Error::Configuration(format!(
                "unknown security level: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Timeout,
    Killed,
    SecurityViolation,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Killed => "killed",
            ExecutionStatus::SecurityViolation => "security_violation",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Created | ExecutionStatus::Running)
    }

    /// Legal forward transitions. Terminal states accept nothing and nothing re-enters `Running`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (ExecutionStatus::Created, ExecutionStatus::Running)
            | (ExecutionStatus::Created, ExecutionStatus::SecurityViolation)
            | (ExecutionStatus::Created, ExecutionStatus::Failed) => true,
            (ExecutionStatus::Running, ExecutionStatus::Completed)
            | (ExecutionStatus::Running, ExecutionStatus::Failed)
            | (ExecutionStatus::Running, ExecutionStatus::Timeout)
            | (ExecutionStatus::Running, ExecutionStatus::Killed) => true,
            _ => false,
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(ExecutionStatus::Created),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "killed" => Ok(ExecutionStatus::Killed),
            "security_violation" => Ok(ExecutionStatus::SecurityViolation),
            other => Err(Error::Configuration(format!("unknown status: {}", other))),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique execution identifier, derived from submission time and code fingerprint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn derive(submitted_at: DateTime<Utc>, fingerprint: &str) -> Self {
        let prefix: String = fingerprint.chars().take(8).collect();
        Self(format!(
            "sandbox_{}_{}",
            submitted_at.timestamp_millis(),
            prefix
        ))
    }

    /// Disambiguate an id that collided with an existing one
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}_{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 fingerprint of the submitted source, hex encoded
pub fn fingerprint(language: Language, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(language.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Which backend ran an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Container => f.write_str("container"),
            BackendKind::Local => f.write_str("local"),
        }
    }
}

/// Handle to the container or process backing a running execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProcessHandle {
    Container { id: String },
    Process { pid: u32 },
}

/// One telemetry sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Milliseconds since monitoring started
    pub elapsed_ms: u64,
    /// `None` for the first sample, which has no previous snapshot to diff against
    pub cpu_percent: Option<f64>,
    pub memory_mb: f64,
}

/// Resource usage of one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub peak_memory_mb: f64,
    /// Wall-clock seconds of the run step
    pub execution_time_secs: f64,
    /// Wall-clock seconds of the compile step, compiled languages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_time_secs: Option<f64>,
    pub sample_count: u64,
    /// Most recent samples, oldest first
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub samples: VecDeque<ResourceSample>,
}

impl ResourceUsage {
    /// Fold a sample in. Peak memory never decreases.
    pub fn record(&mut self, sample: ResourceSample) {
        if let Some(cpu) = sample.cpu_percent {
            self.cpu_percent = cpu;
        }
        self.memory_mb = sample.memory_mb;
        self.peak_memory_mb = self.peak_memory_mb.max(sample.memory_mb);
        self.sample_count += 1;

        if self.samples.len() >= MAX_SAMPLE_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Complete sandbox execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub id: ExecutionId,
    pub code: String,
    pub fingerprint: String,
    pub language: Language,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub security_analysis: Option<SecurityAnalysis>,
    pub resource_usage: Option<ResourceUsage>,
    pub quality_metrics: Option<CodeQualityMetrics>,
    pub handle: Option<ProcessHandle>,
    pub backend: Option<BackendKind>,
    /// Why the execution ended where it did (violation reason, backend diagnostic, ...)
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SandboxExecution {
    pub fn new(
        id: ExecutionId,
        code: String,
        fingerprint: String,
        language: Language,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code,
            fingerprint,
            language,
            status: ExecutionStatus::Created,
            started_at,
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            security_analysis: None,
            resource_usage: None,
            quality_metrics: None,
            handle: None,
            backend: None,
            reason: None,
            warnings: Vec::new(),
        }
    }

    /// Move to `next` if the state machine allows it; returns whether the status changed
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// Request to run a snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    pub language: Language,
    /// Maximum security level allowed to run; the language default applies when absent
    #[serde(default)]
    pub security_level: Option<SecurityLevel>,
    /// Wall-clock limit for the run step; the language default applies when absent
    #[serde(default, with = "option_duration_secs")]
    pub timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            security_level: None,
            timeout: None,
        }
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Filters for listing executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    50
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            language: None,
            status: None,
            limit: default_list_limit(),
        }
    }
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &SandboxExecution) -> bool {
        self.language.map_or(true, |l| execution.language == l)
            && self.status.map_or(true, |s| execution.status == s)
    }
}

/// Aggregate counters over the manager's lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatistics {
    pub executions_count: u64,
    pub security_violations: u64,
    pub containers_created: u64,
    pub active_executions: usize,
    pub container_available: bool,
    pub supported_languages: Vec<Language>,
    pub status_distribution: BTreeMap<String, usize>,
    pub total_executions: usize,
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
