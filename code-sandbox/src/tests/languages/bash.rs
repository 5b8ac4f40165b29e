use super::*;
use crate::tests::fixtures::code_samples::BASH_HELLO;

#[tokio::test]
async fn test_bash_basic() {
    test_language_execution(Language::Bash, &["bash"], BASH_HELLO).await
}

#[tokio::test]
async fn test_bash_cannot_write_past_file_size_limit() {
    if skip_if_not_available(&["bash", "head"]) {
        return;
    }
    // 128 MiB against the 64 MiB default limit
    let code = "head -c 134217728 /dev/zero > big.bin && echo wrote";
    let execution = local_manager()
        .await
        .submit(SubmitRequest::new(code, Language::Bash))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(!execution.stdout.contains("wrote"));
}
