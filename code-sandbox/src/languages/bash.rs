use std::time::Duration;

use super::{args, LanguageProfile};
use crate::types::{Language, SecurityLevel};

pub(super) fn profile() -> LanguageProfile {
    LanguageProfile {
        language: Language::Bash,
        image: "ubuntu:22.04".to_string(),
        toolchain: "bash".to_string(),
        file_extension: "sh".to_string(),
        compile: None,
        run: args(&["bash", "{source}"]),
        timeout: Duration::from_secs(30),
        memory_limit_mb: 64,
        max_security_level: SecurityLevel::Maximum,
    }
}
