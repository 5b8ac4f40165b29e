use super::utils::{defaults::*, managers::local_manager};
use crate::{languages::skip_if_not_available, ExecutionStatus, Language, SubmitRequest};
use tokio::time::Duration;

pub mod bash;
pub mod cpp;
pub mod javascript;
pub mod python;
pub mod rust;

/// Run `code` on the local backend and check it printed a greeting
pub(crate) async fn test_language_execution(language: Language, tools: &[&str], code: &str) {
    test_language_with_timeout(language, tools, code, default_timeout()).await
}

pub(crate) async fn test_language_with_timeout(
    language: Language,
    tools: &[&str],
    code: &str,
    timeout: Duration,
) {
    if skip_if_not_available(tools) {
        return;
    }
    let manager = local_manager().await;

    let execution = manager
        .submit(SubmitRequest::new(code, language).with_timeout(timeout))
        .await
        .unwrap();

    assert_eq!(
        execution.status,
        ExecutionStatus::Completed,
        "stderr: {}",
        execution.stderr
    );
    assert!(execution.stdout.contains("Hello from"));
    assert!(execution.stderr.is_empty());
}
