//! Concurrent CPU and memory sampling for a running container or process

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::Error,
    types::{ResourceSample, ResourceUsage},
    Result,
};

/// Linux reports `/proc/<pid>/stat` times in clock ticks of this rate
const USER_HZ: u64 = 100;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cumulative counters read from a stats source at one instant
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    /// Total CPU time consumed so far, in nanoseconds
    pub cpu_usage_ns: u64,
    pub memory_bytes: u64,
    pub taken_at: Instant,
}

/// Anything that can report cumulative CPU time and current memory
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn snapshot(&self) -> Result<StatsSnapshot>;
}

/// CPU percentage between two cumulative snapshots
pub fn cpu_percent(previous: &StatsSnapshot, current: &StatsSnapshot) -> Option<f64> {
    let wall_ns = current
        .taken_at
        .checked_duration_since(previous.taken_at)?
        .as_nanos() as f64;
    if wall_ns == 0.0 {
        return None;
    }
    let cpu_ns = current.cpu_usage_ns.saturating_sub(previous.cpu_usage_ns) as f64;
    Some(cpu_ns / wall_ns * 100.0)
}

pub struct ResourceMonitor;

impl ResourceMonitor {
    /// Start sampling `source` every `interval` until the handle is stopped or `cancel` fires
    pub fn spawn<S>(source: S, interval: Duration, cancel: CancellationToken) -> MonitorHandle
    where
        S: StatsSource + 'static,
    {
        let token = cancel.clone();
        let task = tokio::spawn(async move { sample_loop(source, interval, token).await });
        MonitorHandle { cancel, task }
    }
}

async fn sample_loop<S: StatsSource>(
    source: S,
    interval: Duration,
    cancel: CancellationToken,
) -> ResourceUsage {
    let started = Instant::now();
    let mut usage = ResourceUsage::default();
    let mut previous: Option<StatsSnapshot> = None;

    loop {
        let snapshot = tokio::select! {
            _ = cancel.cancelled() => break,
            snapshot = source.snapshot() => snapshot,
        };

        match snapshot {
            Ok(current) => {
                let cpu = previous.as_ref().and_then(|p| cpu_percent(p, &current));
                usage.record(ResourceSample {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    cpu_percent: cpu,
                    memory_mb: current.memory_bytes as f64 / BYTES_PER_MB,
                });
                previous = Some(current);
            }
            // The target may not exist yet or may already be gone
            Err(e) => debug!("Resource sample skipped: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    usage
}

/// Running monitor task; stop it to get the accumulated usage
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<ResourceUsage>,
}

impl MonitorHandle {
    /// Cancel sampling and join the task
    pub async fn stop(self) -> ResourceUsage {
        self.cancel.cancel();
        match self.task.await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Resource monitor task failed: {}", e);
                ResourceUsage::default()
            }
        }
    }
}

/// Reads `/proc/<pid>` for a local child process
pub struct ProcStatsSource {
    pid: u32,
}

impl ProcStatsSource {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[async_trait]
impl StatsSource for ProcStatsSource {
    async fn snapshot(&self) -> Result<StatsSnapshot> {
        let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", self.pid)).await?;
        let status = tokio::fs::read_to_string(format!("/proc/{}/status", self.pid)).await?;

        Ok(StatsSnapshot {
            cpu_usage_ns: parse_proc_cpu_ns(&stat)?,
            memory_bytes: parse_proc_rss_bytes(&status)?,
            taken_at: Instant::now(),
        })
    }
}

/// utime + stime from a `/proc/<pid>/stat` line, in nanoseconds
fn parse_proc_cpu_ns(stat: &str) -> Result<u64> {
    // comm may contain spaces, so fields are counted after the closing paren
    let rest = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| Error::System("malformed /proc stat".to_string()))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // utime and stime are fields 14 and 15; `rest` starts at field 3
    let ticks = |idx: usize| -> Result<u64> {
        fields
            .get(idx)
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| Error::System("missing cpu times in /proc stat".to_string()))
    };
    let total = ticks(11)? + ticks(12)?;
    Ok(total * (1_000_000_000 / USER_HZ))
}

fn parse_proc_rss_bytes(status: &str) -> Result<u64> {
    let rss = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|v| v.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024);
    // Zombies have no VmRSS line
    Ok(rss.unwrap_or(0))
}
