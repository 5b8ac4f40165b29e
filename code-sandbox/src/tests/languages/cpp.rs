use super::*;
use crate::tests::fixtures::code_samples::CPP_HELLO;

#[tokio::test]
async fn test_cpp_basic() {
    test_language_with_timeout(Language::Cpp, &["g++"], CPP_HELLO, extended_timeout()).await
}
