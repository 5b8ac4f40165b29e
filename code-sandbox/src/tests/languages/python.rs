use super::*;
use crate::tests::fixtures::{code_samples::PYTHON_HELLO, test_scenarios::*};

#[tokio::test]
async fn test_python_basic() {
    test_language_execution(Language::Python, &["python3"], PYTHON_HELLO).await
}

#[tokio::test]
async fn test_python_multiline() {
    if skip_if_not_available(&["python3"]) {
        return;
    }
    let execution = local_manager()
        .await
        .submit(SubmitRequest::new(PYTHON_MULTILINE, Language::Python))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.stdout.trim(), "Factorial of 5 is 120");
}

#[tokio::test]
async fn test_python_runtime_error() {
    if skip_if_not_available(&["python3"]) {
        return;
    }
    let execution = local_manager()
        .await
        .submit(SubmitRequest::new(PYTHON_RUNTIME_ERROR, Language::Python))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.exit_code, Some(1));
    assert!(execution.stderr.contains("ValueError: boom"));
}
