use std::sync::Arc;
use tokio::time::{Duration, Instant};

use super::{
    fixtures::code_samples::*,
    fixtures::test_scenarios::*,
    utils::defaults::test_config,
    utils::engine::FakeEngine,
    utils::managers::{container_manager, local_manager, with_engine},
};
use crate::{
    languages::skip_if_not_available, BackendKind, BackendOutput, Error, ExecutionBackend,
    ExecutionContext, ExecutionFilter, ExecutionId, ExecutionJob, ExecutionStatus, Grade,
    IsolationPolicy, Language, LanguageRegistry, ProcessHandle, ProfileOverride, ResourceUsage,
    SandboxExecution, SandboxManager, SecurityLevel, SubmitRequest, Termination,
    REDUCED_ISOLATION_WARNING,
};

/// Tests for the security gate
pub mod security_gate {
    use super::*;

    #[tokio::test]
    async fn test_violation_never_reaches_a_backend() {
        let engine = Arc::new(FakeEngine::new());
        let manager = container_manager(engine.clone()).await;

        let execution = manager
            .submit(SubmitRequest::new(PYTHON_DANGEROUS, Language::Python))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::SecurityViolation);
        let analysis = execution.security_analysis.as_ref().unwrap();
        assert!(analysis.level >= SecurityLevel::High);
        assert!(execution.reason.is_some());
        assert!(execution.resource_usage.is_none());
        assert!(execution.quality_metrics.is_none());
        assert!(execution.backend.is_none());
        assert!(execution.finished_at.is_some());
        assert_eq!(engine.created_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_can_raise_the_allowed_level() {
        let engine = Arc::new(FakeEngine::new());
        let manager = container_manager(engine.clone()).await;

        let execution = manager
            .submit(
                SubmitRequest::new(PYTHON_DANGEROUS, Language::Python)
                    .with_security_level(SecurityLevel::Maximum),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(engine.created_count(), 1);
    }

    #[tokio::test]
    async fn test_caller_can_lower_the_allowed_level() {
        let manager = container_manager(Arc::new(FakeEngine::new())).await;

        let execution = manager
            .submit(
                SubmitRequest::new("import subprocess\nsubprocess.run(['ls'])", Language::Python)
                    .with_security_level(SecurityLevel::Low),
            )
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::SecurityViolation);
    }
}

/// Container backend through the manager, against the fake engine
pub mod container_execution {
    use super::*;

    #[tokio::test]
    async fn test_completed_execution_record() {
        let engine = Arc::new(FakeEngine::new());
        let manager = container_manager(engine.clone()).await;

        let execution = manager
            .submit(SubmitRequest::new(PYTHON_HELLO, Language::Python))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "hello\n");
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(execution.backend, Some(BackendKind::Container));
        assert!(execution.id.as_str().starts_with("sandbox_"));
        assert_eq!(execution.fingerprint.len(), 64);
        assert!(execution.resource_usage.is_some());
        assert_eq!(
            execution.quality_metrics.as_ref().map(|q| q.overall_grade),
            Some(Grade::A)
        );
        assert!(execution.duration().is_some());

        assert_eq!(engine.mounted_sources.lock().unwrap()[0], PYTHON_HELLO);
        assert_eq!(engine.removed_ids(), vec!["fake-1".to_string()]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failed() {
        let engine = Arc::new(FakeEngine::new().with_run_output(crate::ExecOutput {
            stdout: String::new(),
            stderr: "ValueError: boom\n".to_string(),
            exit_code: 1,
        }));
        let manager = container_manager(engine).await;

        let execution = manager
            .submit(SubmitRequest::new(PYTHON_RUNTIME_ERROR, Language::Python))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.exit_code, Some(1));
        assert!(execution.stderr.contains("boom"));
        assert!(execution.quality_metrics.is_some());
    }

    #[tokio::test]
    async fn test_compile_failure() {
        let engine = Arc::new(FakeEngine::new().with_compile_output(crate::ExecOutput {
            stdout: String::new(),
            stderr: "error: expected expression, found `}`".to_string(),
            exit_code: 1,
        }));
        let manager = container_manager(engine.clone()).await;

        let execution = manager
            .submit(SubmitRequest::new(RUST_SYNTAX_ERROR, Language::Rust))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.reason.as_deref(), Some("Compilation failed"));
        assert!(execution.stderr.contains("expected expression"));
        let usage = execution.resource_usage.unwrap();
        assert!(usage.compile_time_secs.is_some());

        // Only the compile step ran, and the container was still removed
        assert_eq!(engine.execs.lock().unwrap().len(), 1);
        assert_eq!(engine.removed_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_removes_container() {
        let engine = Arc::new(FakeEngine::new().with_run_delay(Duration::from_secs(30)));
        let manager = container_manager(engine.clone()).await;

        let started = Instant::now();
        let execution = manager
            .submit(
                SubmitRequest::new(PYTHON_HELLO, Language::Python)
                    .with_timeout(Duration::from_millis(300)),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(execution.reason.unwrap().starts_with("Timed out"));
        assert_eq!(engine.removed_ids().len(), 1);
    }
}

/// Kill semantics
pub mod kill {
    use super::*;

    async fn wait_for_running(manager: &SandboxManager) -> ExecutionId {
        for _ in 0..200 {
            let running = manager
                .list(&ExecutionFilter {
                    status: Some(ExecutionStatus::Running),
                    ..Default::default()
                })
                .await;
            if let Some(execution) = running.first() {
                return execution.id.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never started running");
    }

    /// Waits for the final record, which is the only one carrying quality metrics
    async fn wait_for_final(manager: &SandboxManager, id: &ExecutionId) -> SandboxExecution {
        for _ in 0..200 {
            if let Some(execution) = manager.get(id).await {
                if execution.quality_metrics.is_some() {
                    return execution;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution was never finalized");
    }

    #[tokio::test]
    async fn test_dropped_submit_still_finishes() {
        let engine = Arc::new(FakeEngine::new().with_run_delay(Duration::from_millis(500)));
        let manager = container_manager(engine.clone()).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            manager.submit(SubmitRequest::new(PYTHON_HELLO, Language::Python)),
        )
        .await;
        assert!(abandoned.is_err());

        let id = wait_for_running(&manager).await;
        let execution = wait_for_final(&manager, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "hello\n");
        assert_eq!(
            execution.handle,
            Some(ProcessHandle::Container {
                id: "fake-1".to_string()
            })
        );
        assert_eq!(engine.removed_ids(), vec!["fake-1".to_string()]);
        assert_eq!(manager.statistics().await.active_executions, 0);
    }

    #[tokio::test]
    async fn test_kill_after_dropped_submit_removes_container() {
        let engine = Arc::new(FakeEngine::new().with_run_delay(Duration::from_secs(60)));
        let manager = container_manager(engine.clone()).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            manager.submit(SubmitRequest::new(PYTHON_HELLO, Language::Python)),
        )
        .await;
        assert!(abandoned.is_err());

        let id = wait_for_running(&manager).await;
        assert!(manager.kill(&id).await);

        let execution = wait_for_final(&manager, &id).await;
        assert_eq!(execution.status, ExecutionStatus::Killed);
        assert_eq!(engine.removed_ids(), vec!["fake-1".to_string()]);
        assert_eq!(manager.statistics().await.active_executions, 0);
    }

    #[tokio::test]
    async fn test_kill_running_container_execution() {
        let engine = Arc::new(FakeEngine::new().with_run_delay(Duration::from_secs(60)));
        let manager = Arc::new(container_manager(engine.clone()).await);

        let submitter = manager.clone();
        let task = tokio::spawn(async move {
            submitter
                .submit(SubmitRequest::new(PYTHON_HELLO, Language::Python))
                .await
        });

        let id = wait_for_running(&manager).await;
        assert!(manager.kill(&id).await);

        let execution = task.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Killed);
        assert_eq!(execution.reason.as_deref(), Some("Killed on request"));
        assert_eq!(
            execution.handle,
            Some(ProcessHandle::Container {
                id: "fake-1".to_string()
            })
        );
        assert!(execution.quality_metrics.is_some());
        assert_eq!(engine.removed_ids().len(), 1);

        // Terminal executions cannot be killed again
        assert!(!manager.kill(&id).await);
        assert_eq!(manager.statistics().await.active_executions, 0);
    }

    #[tokio::test]
    async fn test_kill_running_local_execution() {
        if skip_if_not_available(&["bash", "sleep"]) {
            return;
        }
        let manager = Arc::new(local_manager().await);

        let submitter = manager.clone();
        let task = tokio::spawn(async move {
            submitter
                .submit(SubmitRequest::new(BASH_SLEEP, Language::Bash))
                .await
        });

        let id = wait_for_running(&manager).await;
        let started = Instant::now();
        assert!(manager.kill(&id).await);

        let execution = task.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Killed);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_kill_unknown_or_finished_leaves_registry_unchanged() {
        let manager = container_manager(Arc::new(FakeEngine::new())).await;
        assert!(!manager.kill(&ExecutionId::from("sandbox_0_missing")).await);

        let execution = manager
            .submit(SubmitRequest::new(PYTHON_HELLO, Language::Python))
            .await
            .unwrap();

        let before = serde_json::to_value(manager.list(&ExecutionFilter::default()).await).unwrap();
        assert!(!manager.kill(&execution.id).await);
        let after = serde_json::to_value(manager.list(&ExecutionFilter::default()).await).unwrap();
        assert_eq!(before, after);
    }
}

/// Isolation policy handling when the engine is unreachable
pub mod isolation {
    use super::*;

    #[tokio::test]
    async fn test_container_only_fails_without_engine() {
        let manager = with_engine(
            IsolationPolicy::ContainerOnly,
            Arc::new(FakeEngine::unreachable()),
        )
        .await;
        assert!(!manager.container_available());

        let execution = manager
            .submit(SubmitRequest::new(PYTHON_HELLO, Language::Python))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.stderr.contains("Backend unavailable"));
        assert!(execution.backend.is_none());
        assert!(execution.quality_metrics.is_some());
    }

    #[tokio::test]
    async fn test_prefer_container_falls_back_with_warning() {
        if skip_if_not_available(&["bash"]) {
            return;
        }
        let manager = with_engine(
            IsolationPolicy::PreferContainer,
            Arc::new(FakeEngine::unreachable()),
        )
        .await;

        let execution = manager
            .submit(SubmitRequest::new(BASH_HELLO, Language::Bash))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout.trim(), "Hello from Bash!");
        assert_eq!(execution.backend, Some(BackendKind::Local));
        assert_eq!(execution.warnings, vec![REDUCED_ISOLATION_WARNING.to_string()]);
    }

    #[tokio::test]
    async fn test_prefer_container_uses_reachable_engine() {
        let engine = Arc::new(FakeEngine::new());
        let manager = with_engine(IsolationPolicy::PreferContainer, engine.clone()).await;

        let execution = manager
            .submit(SubmitRequest::new(PYTHON_HELLO, Language::Python))
            .await
            .unwrap();

        assert_eq!(execution.backend, Some(BackendKind::Container));
        assert!(execution.warnings.is_empty());
        assert_eq!(engine.created_count(), 1);
    }
}

/// Timeouts on the local backend
pub mod local_execution {
    use super::*;

    #[tokio::test]
    async fn test_bash_sleep_times_out() {
        if skip_if_not_available(&["bash", "sleep"]) {
            return;
        }
        let manager = local_manager().await;

        let started = Instant::now();
        let execution = manager
            .submit(
                SubmitRequest::new(BASH_SLEEP, Language::Bash).with_timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        let usage = execution.resource_usage.unwrap();
        assert!(usage.execution_time_secs >= 1.5);
    }

    #[tokio::test]
    async fn test_huge_timeout_is_accepted() {
        if skip_if_not_available(&["bash"]) {
            return;
        }
        let manager = local_manager().await;

        let execution = manager
            .submit(
                SubmitRequest::new("echo hi", Language::Bash)
                    .with_timeout(Duration::from_secs(u64::MAX)),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "hi\n");
        assert_eq!(manager.statistics().await.active_executions, 0);
    }

    #[tokio::test]
    async fn test_python_hello_world() {
        if skip_if_not_available(&["python3"]) {
            return;
        }
        let manager = local_manager().await;

        let execution = manager
            .submit(SubmitRequest::new(r#"print("hello")"#, Language::Python))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "hello\n");
        assert_eq!(execution.exit_code, Some(0));
        assert_eq!(
            execution.security_analysis.unwrap().level,
            SecurityLevel::Low
        );
        let usage = execution.resource_usage.unwrap();
        for sample in &usage.samples {
            assert!(usage.peak_memory_mb >= sample.memory_mb);
        }
        assert_eq!(execution.quality_metrics.unwrap().overall_grade, Grade::A);
    }
}

/// Tests for concurrent execution
pub mod concurrent_execution {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let engine = Arc::new(FakeEngine::new().with_run_delay(Duration::from_millis(200)));
        let mut config = test_config(IsolationPolicy::ContainerOnly);
        config.max_concurrent = 2;
        let manager = Arc::new(
            SandboxManager::builder()
                .config(config)
                .engine(engine.clone())
                .build()
                .await
                .unwrap(),
        );

        let mut handles = vec![];
        for i in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .submit(SubmitRequest::new(format!("print({})", i), Language::Python))
                    .await
            }));
        }

        for handle in handles {
            let execution = handle.await.unwrap().unwrap();
            assert_eq!(execution.status, ExecutionStatus::Completed);
        }

        assert!(engine.peak_running.load(std::sync::atomic::Ordering::SeqCst) <= 2);
        let stats = manager.statistics().await;
        assert_eq!(stats.executions_count, 5);
        assert_eq!(stats.total_executions, 5);
        assert_eq!(stats.containers_created, 5);
    }
}

/// Registry operations exposed by the manager
pub mod registry {
    use super::*;

    #[tokio::test]
    async fn test_statistics_list_and_purge() {
        let manager = container_manager(Arc::new(FakeEngine::new())).await;

        manager
            .submit(SubmitRequest::new(PYTHON_DANGEROUS, Language::Python))
            .await
            .unwrap();
        let completed = manager
            .submit(SubmitRequest::new(JS_HELLO, Language::JavaScript))
            .await
            .unwrap();

        let stats = manager.statistics().await;
        assert_eq!(stats.executions_count, 2);
        assert_eq!(stats.security_violations, 1);
        assert_eq!(stats.containers_created, 1);
        assert!(stats.container_available);
        assert_eq!(stats.status_distribution.get("completed"), Some(&1));
        assert_eq!(stats.status_distribution.get("security_violation"), Some(&1));

        let listed = manager.list(&ExecutionFilter::default()).await;
        assert_eq!(listed[0].id, completed.id);

        let js_only = manager
            .list(&ExecutionFilter {
                language: Some(Language::JavaScript),
                ..Default::default()
            })
            .await;
        assert_eq!(js_only.len(), 1);
        assert!(manager.get(&completed.id).await.is_some());

        assert_eq!(
            manager
                .purge(&ExecutionFilter {
                    status: Some(ExecutionStatus::SecurityViolation),
                    ..Default::default()
                })
                .await,
            1
        );
        assert_eq!(manager.statistics().await.total_executions, 1);
        // Lifetime counters survive a purge
        assert_eq!(manager.statistics().await.executions_count, 2);
    }

    /// Local backend that echoes the submitted code back
    struct EchoBackend;

    #[async_trait::async_trait]
    impl ExecutionBackend for EchoBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn execute(
            &self,
            job: &ExecutionJob,
            ctx: &ExecutionContext,
        ) -> crate::Result<BackendOutput> {
            (ctx.on_launch)(ProcessHandle::Process { pid: 4242 });
            Ok(BackendOutput {
                stdout: job.code.clone(),
                stderr: String::new(),
                exit_code: Some(0),
                termination: Termination::Exited,
                usage: ResourceUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_injected_local_backend() {
        let manager = SandboxManager::builder()
            .config(test_config(IsolationPolicy::LocalOnly))
            .local_backend(Arc::new(EchoBackend))
            .build()
            .await
            .unwrap();

        let execution = manager
            .submit(SubmitRequest::new(BASH_HELLO, Language::Bash))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, BASH_HELLO);
        assert_eq!(execution.backend, Some(BackendKind::Local));
        assert_eq!(execution.handle, Some(ProcessHandle::Process { pid: 4242 }));
        assert_eq!(manager.statistics().await.containers_created, 0);
    }

    #[tokio::test]
    async fn test_missing_toolchains_reported_for_local_runs() {
        let mut config = test_config(IsolationPolicy::LocalOnly);
        config.languages.insert(
            Language::Python,
            ProfileOverride {
                toolchain: Some("snippet-sandbox-no-such-python".to_string()),
                ..Default::default()
            },
        );
        let manager = SandboxManager::new(config.clone()).await.unwrap();
        assert!(manager
            .missing_toolchains()
            .get(&Language::Python)
            .is_some_and(|missing| missing.contains(&"snippet-sandbox-no-such-python".to_string())));

        // Container-only managers never launch local toolchains
        config.isolation = IsolationPolicy::ContainerOnly;
        let manager = SandboxManager::builder()
            .config(config)
            .engine(Arc::new(FakeEngine::new()))
            .build()
            .await
            .unwrap();
        assert!(manager.missing_toolchains().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_language_is_an_error() {
        let manager = SandboxManager::builder()
            .config(test_config(IsolationPolicy::LocalOnly))
            .registry(LanguageRegistry::empty())
            .build()
            .await
            .unwrap();

        assert!(matches!(
            manager
                .submit(SubmitRequest::new(PYTHON_HELLO, Language::Python))
                .await,
            Err(Error::UnsupportedLanguage(_))
        ));
        assert!(manager.list(&ExecutionFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_analyze_without_running() {
        let engine = Arc::new(FakeEngine::new());
        let manager = container_manager(engine.clone()).await;

        let bare = manager.analyze(PYTHON_BARE_EXCEPT, Language::Python).unwrap();
        let typed = manager.analyze(PYTHON_TYPED_EXCEPT, Language::Python).unwrap();

        assert!(bare.quality.maintainability_index < typed.quality.maintainability_index);
        assert_eq!(bare.security.level, SecurityLevel::Low);
        assert_eq!(
            manager.analyze(PYTHON_MULTILINE, Language::Python).unwrap().quality,
            manager.analyze(PYTHON_MULTILINE, Language::Python).unwrap().quality
        );
        assert_eq!(engine.created_count(), 0);
        assert!(manager.list(&ExecutionFilter::default()).await.is_empty());
    }
}
