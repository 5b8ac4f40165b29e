use std::time::Duration;

use super::{args, LanguageProfile};
use crate::types::{Language, SecurityLevel};

pub(super) fn profile() -> LanguageProfile {
    LanguageProfile {
        language: Language::Rust,
        image: "rust:1.70-slim".to_string(),
        toolchain: "rustc".to_string(),
        file_extension: "rs".to_string(),
        compile: Some(args(&["rustc", "-O", "{source}", "-o", "{binary}"])),
        run: args(&["{binary}"]),
        timeout: Duration::from_secs(60),
        memory_limit_mb: 256,
        max_security_level: SecurityLevel::High,
    }
}
