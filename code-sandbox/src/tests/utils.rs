pub mod defaults {
    use crate::{IsolationPolicy, SandboxConfig};
    use tokio::time::Duration;

    pub fn test_config(isolation: IsolationPolicy) -> SandboxConfig {
        SandboxConfig {
            isolation,
            monitor_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn extended_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

pub mod engine {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::{
        monitor::StatsSnapshot, ContainerEngine, ContainerSpec, Error, ExecOutput, Result,
    };

    /// In-memory container engine that records every call
    pub struct FakeEngine {
        reachable: bool,
        run_delay: Duration,
        run_output: ExecOutput,
        compile_output: ExecOutput,
        pub created: Mutex<Vec<ContainerSpec>>,
        /// Source file contents as seen at container creation
        pub mounted_sources: Mutex<Vec<String>>,
        pub execs: Mutex<Vec<Vec<String>>>,
        pub removed: Mutex<Vec<String>>,
        next_id: AtomicU64,
        cpu_ns: AtomicU64,
        running: AtomicUsize,
        pub peak_running: AtomicUsize,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self {
                reachable: true,
                run_delay: Duration::ZERO,
                run_output: ExecOutput {
                    stdout: "hello\n".to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                },
                compile_output: ExecOutput::default(),
                created: Mutex::new(Vec::new()),
                mounted_sources: Mutex::new(Vec::new()),
                execs: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                cpu_ns: AtomicU64::new(0),
                running: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
            }
        }

        pub fn unreachable() -> Self {
            Self {
                reachable: false,
                ..Self::new()
            }
        }

        pub fn with_run_delay(mut self, delay: Duration) -> Self {
            self.run_delay = delay;
            self
        }

        pub fn with_run_output(mut self, output: ExecOutput) -> Self {
            self.run_output = output;
            self
        }

        pub fn with_compile_output(mut self, output: ExecOutput) -> Self {
            self.compile_output = output;
            self
        }

        pub fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        pub fn removed_ids(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }
    }

    /// Decrements the running gauge even when the exec future is dropped
    struct RunningGuard<'a>(&'a AtomicUsize);

    impl Drop for RunningGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn ping(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(Error::BackendUnavailable(
                    "Cannot connect to the container daemon".to_string(),
                ))
            }
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            let source = std::fs::read_dir(&spec.host_workspace)?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
                .collect::<Vec<_>>()
                .join("");
            self.mounted_sources.lock().unwrap().push(source);
            self.created.lock().unwrap().push(spec.clone());
            Ok(format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn exec(&self, _container: &str, command: &[String]) -> Result<ExecOutput> {
            self.execs.lock().unwrap().push(command.to_vec());
            let is_compile = matches!(command.first().map(String::as_str), Some("rustc" | "g++"));
            if is_compile {
                return Ok(self.compile_output.clone());
            }

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_running.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(&self.running);
            tokio::time::sleep(self.run_delay).await;
            Ok(self.run_output.clone())
        }

        async fn stats(&self, _container: &str) -> Result<StatsSnapshot> {
            Ok(StatsSnapshot {
                cpu_usage_ns: self.cpu_ns.fetch_add(10_000_000, Ordering::SeqCst),
                memory_bytes: 32 * 1024 * 1024,
                taken_at: Instant::now(),
            })
        }

        async fn remove(&self, container: &str) -> Result<()> {
            self.removed.lock().unwrap().push(container.to_string());
            Ok(())
        }
    }
}

pub mod managers {
    use std::sync::Arc;

    use super::defaults::test_config;
    use super::engine::FakeEngine;
    use crate::{IsolationPolicy, SandboxManager};

    pub async fn with_engine(isolation: IsolationPolicy, engine: Arc<FakeEngine>) -> SandboxManager {
        SandboxManager::builder()
            .config(test_config(isolation))
            .engine(engine)
            .build()
            .await
            .expect("manager builds")
    }

    pub async fn container_manager(engine: Arc<FakeEngine>) -> SandboxManager {
        with_engine(IsolationPolicy::ContainerOnly, engine).await
    }

    pub async fn local_manager() -> SandboxManager {
        SandboxManager::builder()
            .config(test_config(IsolationPolicy::LocalOnly))
            .build()
            .await
            .expect("manager builds")
    }
}
