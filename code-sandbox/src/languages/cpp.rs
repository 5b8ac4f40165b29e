use std::time::Duration;

use super::{args, LanguageProfile};
use crate::types::{Language, SecurityLevel};

pub(super) fn profile() -> LanguageProfile {
    LanguageProfile {
        language: Language::Cpp,
        image: "gcc:11".to_string(),
        toolchain: "g++".to_string(),
        file_extension: "cpp".to_string(),
        compile: Some(args(&[
            "g++",
            "-std=c++17",
            "-O2",
            "-pthread",
            "{source}",
            "-o",
            "{binary}",
        ])),
        run: args(&["{binary}"]),
        timeout: Duration::from_secs(60),
        memory_limit_mb: 256,
        max_security_level: SecurityLevel::High,
    }
}
