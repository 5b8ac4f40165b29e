use std::time::Duration;

use super::{args, LanguageProfile};
use crate::types::{Language, SecurityLevel};

pub(super) fn profile() -> LanguageProfile {
    LanguageProfile {
        language: Language::Python,
        image: "python:3.11-slim".to_string(),
        toolchain: "python3".to_string(),
        file_extension: "py".to_string(),
        compile: None,
        // Unbuffered so output survives a kill
        run: args(&["python3", "-u", "{source}"]),
        timeout: Duration::from_secs(30),
        memory_limit_mb: 128,
        max_security_level: SecurityLevel::Medium,
    }
}
