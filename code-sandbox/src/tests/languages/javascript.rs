use super::*;
use crate::tests::fixtures::code_samples::JS_HELLO;

#[tokio::test]
async fn test_javascript_basic() {
    test_language_execution(Language::JavaScript, &["node"], JS_HELLO).await
}

#[tokio::test]
async fn test_javascript_pending_timer_times_out() {
    if skip_if_not_available(&["node"]) {
        return;
    }
    let execution = local_manager()
        .await
        .submit(
            SubmitRequest::new("setTimeout(() => console.log('late'), 60000);", Language::JavaScript)
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(!execution.stdout.contains("late"));
}
