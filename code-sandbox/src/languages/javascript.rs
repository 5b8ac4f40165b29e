use std::time::Duration;

use super::{args, LanguageProfile};
use crate::types::{Language, SecurityLevel};

pub(super) fn profile() -> LanguageProfile {
    LanguageProfile {
        language: Language::JavaScript,
        image: "node:18-slim".to_string(),
        toolchain: "node".to_string(),
        file_extension: "js".to_string(),
        compile: None,
        run: args(&["node", "{source}"]),
        timeout: Duration::from_secs(30),
        memory_limit_mb: 128,
        max_security_level: SecurityLevel::Medium,
    }
}
