use super::*;
use crate::tests::fixtures::{code_samples::RUST_HELLO, test_scenarios::RUST_SYNTAX_ERROR};

#[tokio::test]
async fn test_rust_basic() {
    test_language_with_timeout(Language::Rust, &["rustc"], RUST_HELLO, extended_timeout()).await
}

#[tokio::test]
async fn test_rust_compile_error() {
    if skip_if_not_available(&["rustc"]) {
        return;
    }
    let execution = local_manager()
        .await
        .submit(SubmitRequest::new(RUST_SYNTAX_ERROR, Language::Rust))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.reason.as_deref(), Some("Compilation failed"));
    assert!(execution.stderr.contains("error"));
    let usage = execution.resource_usage.unwrap();
    assert!(usage.compile_time_secs.is_some());
    assert_eq!(usage.sample_count, 0);
}
