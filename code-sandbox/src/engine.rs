//! Outbound container engine interface and its Docker CLI implementation

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

use crate::{
    error::Error,
    monitor::{StatsSnapshot, StatsSource},
    Result,
};

/// Mount point of the read-only source directory inside a container
pub const CONTAINER_WORKSPACE: &str = "/workspace";
/// Writable scratch directory inside a container, used for build output
pub const CONTAINER_SCRATCH: &str = "/tmp";

/// Reads cgroup v2 counters, falling back to the v1 layout
const CGROUP_STATS_SCRIPT: &str = "cat /sys/fs/cgroup/cpu.stat /sys/fs/cgroup/memory.current 2>/dev/null \
     || cat /sys/fs/cgroup/cpuacct/cpuacct.usage /sys/fs/cgroup/memory/memory.usage_in_bytes";

/// Everything needed to start a locked-down container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted read-only at [`CONTAINER_WORKSPACE`]
    pub host_workspace: PathBuf,
    pub memory_limit_mb: u64,
    pub pids_limit: u32,
    pub tmpfs_size_mb: u64,
    /// `uid:gid` the container runs as
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether the engine daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Start a detached, idle container and return its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput>;

    async fn stats(&self, container: &str) -> Result<StatsSnapshot>;

    /// Force-remove a container, running or not
    async fn remove(&self, container: &str) -> Result<()>;
}

/// Drives the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    /// Resolve the docker binary on `PATH` (or use it as given if it is a path)
    pub fn locate(binary: &str) -> Result<Self> {
        let binary = if Path::new(binary).is_absolute() {
            PathBuf::from(binary)
        } else {
            which::which(binary).map_err(|e| {
                Error::BackendUnavailable(format!("{} not found on PATH: {}", binary, e))
            })?
        };
        Ok(Self { binary })
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(binary = ?self.binary, ?args, "Invoking container engine");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ContainerEngine(format!("Failed to invoke engine: {}", e)))
    }

    async fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(Error::ContainerEngine(format!(
                "`{}` failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<()> {
        let version = self
            .run_checked(&to_args(&["version", "--format", "{{.Server.Version}}"]))
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        debug!(%version, "Container engine reachable");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.run_checked(&run_args(spec)).await
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput> {
        let mut args = to_args(&["exec", "-w", CONTAINER_WORKSPACE, container]);
        args.extend_from_slice(command);

        let output = self.run(&args).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn stats(&self, container: &str) -> Result<StatsSnapshot> {
        let raw = self
            .run_checked(&to_args(&["exec", container, "sh", "-c", CGROUP_STATS_SCRIPT]))
            .await?;
        let (cpu_usage_ns, memory_bytes) = parse_cgroup_stats(&raw)?;
        Ok(StatsSnapshot {
            cpu_usage_ns,
            memory_bytes,
            taken_at: Instant::now(),
        })
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.run_checked(&to_args(&["rm", "-f", container]))
            .await
            .map(|_| ())
    }
}

/// `docker run` arguments for a container with no network, a read-only root and no privileges
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let memory = format!("{}m", spec.memory_limit_mb);
    vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        "none".to_string(),
        "--memory".to_string(),
        memory.clone(),
        "--memory-swap".to_string(),
        memory,
        "--pids-limit".to_string(),
        spec.pids_limit.to_string(),
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        format!(
            "{}:rw,exec,nosuid,size={}m",
            CONTAINER_SCRATCH, spec.tmpfs_size_mb
        ),
        "-v".to_string(),
        format!("{}:{}:ro", spec.host_workspace.display(), CONTAINER_WORKSPACE),
        "-w".to_string(),
        CONTAINER_WORKSPACE.to_string(),
        "--user".to_string(),
        spec.user.clone(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "-e".to_string(),
        format!("HOME={}", CONTAINER_SCRATCH),
        spec.image.clone(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]
}

/// Parse `(cpu_ns, memory_bytes)` from the output of [`CGROUP_STATS_SCRIPT`]
fn parse_cgroup_stats(raw: &str) -> Result<(u64, u64)> {
    let malformed = || Error::ContainerEngine(format!("unexpected cgroup stats: {:?}", raw));
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    // v2: cpu.stat key/value lines followed by memory.current
    if let Some(usec) = lines
        .iter()
        .find_map(|l| l.strip_prefix("usage_usec "))
    {
        let cpu_us: u64 = usec.trim().parse().map_err(|_| malformed())?;
        let memory: u64 = lines
            .last()
            .and_then(|l| l.parse().ok())
            .ok_or_else(malformed)?;
        return Ok((cpu_us * 1_000, memory));
    }

    // v1: cpuacct.usage (ns) then memory.usage_in_bytes
    match lines.as_slice() {
        [cpu, memory, ..] => Ok((
            cpu.parse().map_err(|_| malformed())?,
            memory.parse().map_err(|_| malformed())?,
        )),
        _ => Err(malformed()),
    }
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Samples one container through its engine
pub struct ContainerStatsSource {
    engine: Arc<dyn ContainerEngine>,
    container: String,
}

impl ContainerStatsSource {
    pub fn new(engine: Arc<dyn ContainerEngine>, container: impl Into<String>) -> Self {
        Self {
            engine,
            container: container.into(),
        }
    }
}

#[async_trait]
impl StatsSource for ContainerStatsSource {
    async fn snapshot(&self) -> Result<StatsSnapshot> {
        self.engine.stats(&self.container).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandbox_1_abcdef01".to_string(),
            image: "python:3.11-slim".to_string(),
            host_workspace: PathBuf::from("/tmp/sandbox-x"),
            memory_limit_mb: 128,
            pids_limit: 64,
            tmpfs_size_mb: 64,
            user: "65534:65534".to_string(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_run_args_lock_down_the_container() {
        let args = run_args(&spec());

        assert_eq!(args[0], "run");
        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--memory", "128m"));
        assert!(has_pair(&args, "--memory-swap", "128m"));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&args, "--user", "65534:65534"));
        assert!(has_pair(&args, "-v", "/tmp/sandbox-x:/workspace:ro"));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.ends_with(&[
            "python:3.11-slim".to_string(),
            "sleep".to_string(),
            "infinity".to_string()
        ]));
    }

    #[test]
    fn test_parse_cgroup_v2() {
        let raw = "usage_usec 250000\nuser_usec 200000\nsystem_usec 50000\nnr_periods 0\n4194304\n";
        assert_eq!(parse_cgroup_stats(raw).unwrap(), (250_000_000, 4_194_304));
    }

    #[test]
    fn test_parse_cgroup_v1() {
        let raw = "987654321\n8388608\n";
        assert_eq!(parse_cgroup_stats(raw).unwrap(), (987_654_321, 8_388_608));
    }

    #[test]
    fn test_parse_cgroup_malformed() {
        assert!(parse_cgroup_stats("").is_err());
        assert!(parse_cgroup_stats("usage_usec abc\n12\n").is_err());
        assert!(parse_cgroup_stats("not a number\nnor this\n").is_err());
    }

    #[test]
    fn test_locate_missing_binary() {
        assert!(matches!(
            DockerCli::locate("definitely-not-a-container-engine"),
            Err(Error::BackendUnavailable(_))
        ));
    }
}
