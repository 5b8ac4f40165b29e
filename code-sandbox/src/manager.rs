//! Submission pipeline: analyze, gate, dispatch, monitor, record

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        BackendOutput, ContainerBackend, ExecutionBackend, ExecutionContext, ExecutionJob,
        LaunchCallback, LocalBackend, Termination,
    },
    config::{IsolationPolicy, SandboxConfig},
    engine::{ContainerEngine, DockerCli},
    error::Error,
    languages::{LanguageProfile, LanguageRegistry},
    quality::{CodeQualityAnalyzer, CodeQualityMetrics},
    security::{SecurityAnalysis, SecurityAnalyzer},
    store::ExecutionStore,
    types::{
        fingerprint, ExecutionFilter, ExecutionId, ExecutionStatus, Language, ProcessHandle,
        SandboxExecution, SandboxStatistics, SubmitRequest,
    },
    Result,
};

/// Warning attached to executions that fell back to the local backend
pub const REDUCED_ISOLATION_WARNING: &str =
    "Container engine unavailable; ran on the local backend with reduced isolation";

/// Static analysis of a snippet without running it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub language: Language,
    pub fingerprint: String,
    pub security: SecurityAnalysis,
    pub quality: CodeQualityMetrics,
}

enum Selection {
    Backend {
        backend: Arc<dyn ExecutionBackend>,
        warning: Option<&'static str>,
    },
    Unavailable(String),
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    security_violations: AtomicU64,
    containers_created: Arc<AtomicU64>,
}

pub struct SandboxManagerBuilder {
    config: SandboxConfig,
    registry: Option<LanguageRegistry>,
    engine: Option<Arc<dyn ContainerEngine>>,
    local: Option<Arc<dyn ExecutionBackend>>,
}

impl SandboxManagerBuilder {
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the profiles derived from the configuration
    pub fn registry(mut self, registry: LanguageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this engine instead of locating the docker binary
    pub fn engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn local_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.local = Some(backend);
        self
    }

    /// Validate the configuration and probe the container engine once
    pub async fn build(self) -> Result<SandboxManager> {
        let config = self.config;
        config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => LanguageRegistry::with_overrides(&config.languages)?,
        };
        let security = SecurityAnalyzer::with_options(&config.analyzer)?;
        let quality = CodeQualityAnalyzer::new()?;

        let (container, container_diagnostic) = if config.isolation == IsolationPolicy::LocalOnly
        {
            (None, Some("isolation policy is local-only".to_string()))
        } else {
            match probe_engine(self.engine, &config.docker_binary).await {
                Ok(engine) => {
                    let backend: Arc<dyn ExecutionBackend> =
                        Arc::new(ContainerBackend::new(engine, config.container.clone()));
                    (Some(backend), None)
                }
                Err(e) => {
                    warn!(isolation = ?config.isolation, "Container engine unavailable: {}", e);
                    (None, Some(e.to_string()))
                }
            }
        };

        let local = self
            .local
            .unwrap_or_else(|| Arc::new(LocalBackend::new(config.local.clone())));

        // Only worth probing when the local backend can actually be selected
        let local_reachable = match config.isolation {
            IsolationPolicy::LocalOnly => true,
            IsolationPolicy::PreferContainer => container.is_none(),
            IsolationPolicy::ContainerOnly => false,
        };
        let missing_toolchains = if local_reachable {
            registry.missing_toolchains()
        } else {
            BTreeMap::new()
        };
        for (language, missing) in &missing_toolchains {
            warn!(%language, missing = ?missing, "Local toolchain incomplete");
        }

        info!(
            isolation = ?config.isolation,
            container_available = container.is_some(),
            max_concurrent = config.max_concurrent,
            languages = registry.languages().len(),
            "Sandbox manager ready"
        );

        Ok(SandboxManager {
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            registry,
            config,
            security,
            quality: Arc::new(quality),
            store: Arc::new(ExecutionStore::new()),
            container,
            container_diagnostic,
            local,
            missing_toolchains,
            active: Arc::new(RwLock::new(HashMap::new())),
            counters: Counters::default(),
        })
    }
}

async fn probe_engine(
    engine: Option<Arc<dyn ContainerEngine>>,
    docker_binary: &str,
) -> Result<Arc<dyn ContainerEngine>> {
    let engine: Arc<dyn ContainerEngine> = match engine {
        Some(engine) => engine,
        None => Arc::new(DockerCli::locate(docker_binary)?),
    };
    engine.ping().await?;
    Ok(engine)
}

/// Owns the execution registry and every backend. One per process.
pub struct SandboxManager {
    registry: LanguageRegistry,
    config: SandboxConfig,
    security: SecurityAnalyzer,
    quality: Arc<CodeQualityAnalyzer>,
    store: Arc<ExecutionStore>,
    container: Option<Arc<dyn ExecutionBackend>>,
    /// Why the container backend is missing
    container_diagnostic: Option<String>,
    local: Arc<dyn ExecutionBackend>,
    /// Programs the local backend needs but cannot find, per language
    missing_toolchains: BTreeMap<Language, Vec<String>>,
    permits: Arc<Semaphore>,
    /// Cancellation tokens of executions currently in `Running`
    active: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
    counters: Counters,
}

impl SandboxManager {
    pub fn builder() -> SandboxManagerBuilder {
        SandboxManagerBuilder {
            config: SandboxConfig::default(),
            registry: None,
            engine: None,
            local: None,
        }
    }

    pub async fn new(config: SandboxConfig) -> Result<Self> {
        Self::builder().config(config).build().await
    }

    /// Run a snippet to completion and return its final record.
    ///
    /// Only an unsupported language or an invalid request is an `Err`; every
    /// backend failure ends up as a `Failed` record instead.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SandboxExecution> {
        let profile = self.registry.get(request.language)?.clone();
        let timeout = request.timeout.unwrap_or(profile.timeout);
        if timeout.is_zero() {
            return Err(Error::Configuration("timeout must be positive".to_string()));
        }

        let submitted_at = Utc::now();
        let fingerprint = fingerprint(request.language, &request.code);
        let id = self
            .store
            .insert(SandboxExecution::new(
                ExecutionId::derive(submitted_at, &fingerprint),
                request.code.clone(),
                fingerprint,
                request.language,
                submitted_at,
            ))
            .await;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        debug!(%id, language = %request.language, "Execution created");

        let analysis = self.security.analyze(&request.code, request.language);
        let allowed = request.security_level.unwrap_or(profile.max_security_level);

        if analysis.exceeds(allowed) {
            self.counters
                .security_violations
                .fetch_add(1, Ordering::Relaxed);
            let reason = if analysis.is_fail_closed() {
                "Security analysis could not complete".to_string()
            } else {
                format!(
                    "Security level {} exceeds allowed level {}",
                    analysis.level, allowed
                )
            };
            warn!(%id, level = %analysis.level, %allowed, "Security violation");
            return self
                .finish(&id, |e| {
                    e.security_analysis = Some(analysis);
                    e.reason = Some(reason);
                    e.transition(ExecutionStatus::SecurityViolation);
                })
                .await;
        }
        self.store
            .update(&id, |e| e.security_analysis = Some(analysis))
            .await;

        let (backend, warning) = match self.select_backend() {
            Selection::Backend { backend, warning } => (backend, warning),
            Selection::Unavailable(diagnostic) => {
                let error = Error::BackendUnavailable(diagnostic);
                warn!(%id, "No backend for execution: {}", error);
                let quality = self.quality.analyze(&request.code, request.language);
                return self
                    .finish(&id, |e| {
                        e.stderr = error.to_string();
                        e.reason = Some(error.to_string());
                        e.quality_metrics = Some(quality);
                        e.transition(ExecutionStatus::Failed);
                    })
                    .await;
            }
        };
        if let Some(warning) = warning {
            warn!(%id, "{}", warning);
        }

        // The execution runs in its own task so a dropped caller cannot strand
        // a container or leave the record in `Running`.
        let dispatch = Dispatch {
            id: id.clone(),
            job: ExecutionJob {
                id,
                profile,
                code: request.code,
                timeout,
            },
            language: request.language,
            backend,
            warning,
            monitor_interval: self.config.monitor_interval,
            store: self.store.clone(),
            active: self.active.clone(),
            quality: self.quality.clone(),
            permits: self.permits.clone(),
            containers_created: self.counters.containers_created.clone(),
        };
        tokio::spawn(dispatch.run())
            .await
            .map_err(|e| Error::System(format!("Execution task failed: {}", e)))?
    }

    /// Stop a running execution. False when it is unknown or not running.
    pub async fn kill(&self, id: &ExecutionId) -> bool {
        let Some(cancel) = self.active.read().await.get(id).cloned() else {
            return false;
        };

        let killed = self
            .store
            .update(id, |e| {
                let killed = e.transition(ExecutionStatus::Killed);
                if killed {
                    e.reason = Some("Killed on request".to_string());
                }
                killed
            })
            .await
            .unwrap_or(false);
        if killed {
            self.active.write().await.remove(id);
            cancel.cancel();
            info!(%id, "Execution killed");
        }
        killed
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<SandboxExecution> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Vec<SandboxExecution> {
        self.store.list(filter).await
    }

    /// Forget finished executions matching the filter
    pub async fn purge(&self, filter: &ExecutionFilter) -> usize {
        let purged = self.store.purge(filter).await;
        debug!(purged, "Purged finished executions");
        purged
    }

    pub async fn statistics(&self) -> SandboxStatistics {
        SandboxStatistics {
            executions_count: self.counters.executions.load(Ordering::Relaxed),
            security_violations: self.counters.security_violations.load(Ordering::Relaxed),
            containers_created: self.counters.containers_created.load(Ordering::Relaxed),
            active_executions: self.active.read().await.len(),
            container_available: self.container.is_some(),
            supported_languages: self.supported_languages(),
            status_distribution: self.store.status_distribution().await,
            total_executions: self.store.len().await,
        }
    }

    /// Security and quality analysis without running anything
    pub fn analyze(&self, code: &str, language: Language) -> Result<AnalysisReport> {
        self.registry.get(language)?;
        Ok(AnalysisReport {
            language,
            fingerprint: fingerprint(language, code),
            security: self.security.analyze(code, language),
            quality: self.quality.analyze(code, language),
        })
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        self.registry.languages()
    }

    pub fn language_profiles(&self) -> Vec<LanguageProfile> {
        self.registry.profiles().cloned().collect()
    }

    pub fn isolation(&self) -> IsolationPolicy {
        self.config.isolation
    }

    pub fn container_available(&self) -> bool {
        self.container.is_some()
    }

    /// Languages the local backend cannot run for lack of a toolchain.
    /// Empty when executions can only go to a container.
    pub fn missing_toolchains(&self) -> &BTreeMap<Language, Vec<String>> {
        &self.missing_toolchains
    }

    fn select_backend(&self) -> Selection {
        match (self.config.isolation, &self.container) {
            (IsolationPolicy::LocalOnly, _) => Selection::Backend {
                backend: self.local.clone(),
                warning: None,
            },
            (_, Some(container)) => Selection::Backend {
                backend: container.clone(),
                warning: None,
            },
            (IsolationPolicy::PreferContainer, None) => Selection::Backend {
                backend: self.local.clone(),
                warning: Some(REDUCED_ISOLATION_WARNING),
            },
            (IsolationPolicy::ContainerOnly, None) => Selection::Unavailable(
                self.container_diagnostic
                    .clone()
                    .unwrap_or_else(|| "container engine unavailable".to_string()),
            ),
        }
    }

    async fn finish<F>(&self, id: &ExecutionId, f: F) -> Result<SandboxExecution>
    where
        F: FnOnce(&mut SandboxExecution),
    {
        finish(&self.store, id, f).await
    }
}

/// Apply the final update to a record and return a copy of it
async fn finish<F>(store: &ExecutionStore, id: &ExecutionId, f: F) -> Result<SandboxExecution>
where
    F: FnOnce(&mut SandboxExecution),
{
    store
        .update(id, |e| {
            f(e);
            e.clone()
        })
        .await
        .ok_or_else(|| Error::Sandbox(format!("execution {} vanished from the registry", id)))
}

/// An execution that passed the security gate, from permit to final record
struct Dispatch {
    id: ExecutionId,
    job: ExecutionJob,
    language: Language,
    backend: Arc<dyn ExecutionBackend>,
    warning: Option<&'static str>,
    monitor_interval: Duration,
    store: Arc<ExecutionStore>,
    active: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
    quality: Arc<CodeQualityAnalyzer>,
    permits: Arc<Semaphore>,
    containers_created: Arc<AtomicU64>,
}

impl Dispatch {
    async fn run(self) -> Result<SandboxExecution> {
        let Dispatch {
            id,
            job,
            language,
            backend,
            warning,
            monitor_interval,
            store,
            active,
            quality,
            permits,
            containers_created,
        } = self;

        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|e| Error::System(format!("Failed to acquire execution permit: {}", e)))?;

        let cancel = CancellationToken::new();
        let kind = backend.kind();
        active.write().await.insert(id.clone(), cancel.clone());
        store
            .update(&id, |e| {
                e.backend = Some(kind);
                e.warnings.extend(warning.map(str::to_string));
                e.transition(ExecutionStatus::Running)
            })
            .await;
        info!(%id, %language, backend = %kind, timeout_secs = job.timeout.as_secs_f64(), "Execution started");

        let launched = Arc::new(Mutex::new(None));
        let ctx = ExecutionContext {
            cancel,
            on_launch: launch_callback(&id, &store, &containers_created, &launched),
            monitor_interval,
        };
        let result = backend.execute(&job, &ctx).await;
        active.write().await.remove(&id);

        let metrics = quality.analyze(&job.code, language);
        let handle = launched.lock().ok().and_then(|slot| slot.clone());
        let execution = finish(&store, &id, |e| {
            if handle.is_some() {
                e.handle = handle;
            }
            record_outcome(e, result, &job);
            e.quality_metrics = Some(metrics);
        })
        .await?;

        info!(
            %id,
            status = %execution.status,
            exit_code = ?execution.exit_code,
            grade = ?execution.quality_metrics.as_ref().map(|q| q.overall_grade),
            "Execution finished"
        );
        Ok(execution)
    }
}

/// Records the handle and counts containers as backends launch them.
///
/// The slot is read when the record is finalized; the store update only
/// makes the handle visible while the execution is still live.
fn launch_callback(
    id: &ExecutionId,
    store: &Arc<ExecutionStore>,
    containers: &Arc<AtomicU64>,
    slot: &Arc<Mutex<Option<ProcessHandle>>>,
) -> LaunchCallback {
    let store = store.clone();
    let containers = containers.clone();
    let slot = slot.clone();
    let id = id.clone();
    Arc::new(move |handle: ProcessHandle| {
        if matches!(handle, ProcessHandle::Container { .. }) {
            containers.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut slot) = slot.lock() {
            *slot = Some(handle.clone());
        }
        let store = store.clone();
        let id = id.clone();
        tokio::spawn(async move {
            store
                .update(&id, |e| {
                    if !e.is_terminal() {
                        e.handle = Some(handle);
                    }
                })
                .await;
        });
    })
}

/// Fold a backend result into the record. A record already `Killed` keeps its status.
fn record_outcome(execution: &mut SandboxExecution, result: Result<BackendOutput>, job: &ExecutionJob) {
    let output = match result {
        Ok(output) => output,
        Err(e) => {
            execution.stderr = e.to_string();
            execution.reason = Some(e.to_string());
            execution.transition(ExecutionStatus::Failed);
            return;
        }
    };

    execution.stdout = output.stdout;
    execution.stderr = output.stderr;
    execution.exit_code = output.exit_code;
    execution.resource_usage = Some(output.usage);

    let (status, reason) = match output.termination {
        Termination::Exited if output.exit_code == Some(0) => (ExecutionStatus::Completed, None),
        Termination::Exited => (
            ExecutionStatus::Failed,
            Some(format!(
                "Process exited with code {}",
                output.exit_code.unwrap_or(-1)
            )),
        ),
        Termination::CompileFailed => {
            (ExecutionStatus::Failed, Some("Compilation failed".to_string()))
        }
        Termination::TimedOut => (
            ExecutionStatus::Timeout,
            Some(format!(
                "Timed out after {:.1}s",
                job.timeout.as_secs_f64()
            )),
        ),
        Termination::Cancelled => (ExecutionStatus::Killed, None),
    };

    if execution.transition(status) {
        if let Some(reason) = reason {
            execution.reason = Some(reason);
        }
    }
}
