//! Per-language execution profiles and the registry that maps a language to its profile

mod bash;
mod cpp;
mod javascript;
mod python;
mod rust;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use which::which;

use crate::{
    error::Error,
    types::{Language, SecurityLevel},
    Result,
};

/// Placeholder replaced by the source file path in command templates
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced by the compiled binary path in command templates
pub const BINARY_PLACEHOLDER: &str = "{binary}";

/// How to isolate, compile and run one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,
    /// Container image used by the container backend
    pub image: String,
    /// Toolchain binary the local backend needs on `PATH`
    pub toolchain: String,
    pub file_extension: String,
    /// Compile command template, compiled languages only
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run command template
    pub run: Vec<String>,
    /// Default wall-clock limit of the run step, also bounds the compile step
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    /// Highest analyzed security level allowed to run by default
    pub max_security_level: SecurityLevel,
}

impl LanguageProfile {
    pub fn source_file_name(&self) -> String {
        format!("code.{}", self.file_extension)
    }

    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    pub fn compile_command(&self, source: &str, binary: &str) -> Option<Vec<String>> {
        self.compile
            .as_ref()
            .map(|template| render(template, source, binary))
    }

    pub fn run_command(&self, source: &str, binary: &str) -> Vec<String> {
        render(&self.run, source, binary)
    }

    /// Programs the local backend would launch that are not on `PATH`
    pub fn missing_tools(&self) -> Vec<String> {
        let mut programs = vec![self.toolchain.as_str()];
        if let Some(compile) = &self.compile {
            programs.extend(compile.first().map(String::as_str));
        }
        programs.extend(self.run.first().map(String::as_str));

        let mut missing: Vec<String> = programs
            .into_iter()
            .filter(|p| !p.contains('{'))
            .filter(|p| !check_command(p))
            .map(str::to_string)
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn apply(&mut self, overrides: &ProfileOverride) {
        if let Some(image) = &overrides.image {
            self.image = image.clone();
        }
        if let Some(toolchain) = &overrides.toolchain {
            self.toolchain = toolchain.clone();
        }
        if let Some(compile) = &overrides.compile {
            self.compile = Some(compile.clone());
        }
        if let Some(run) = &overrides.run {
            self.run = run.clone();
        }
        if let Some(timeout) = overrides.timeout {
            self.timeout = timeout;
        }
        if let Some(memory) = overrides.memory_limit_mb {
            self.memory_limit_mb = memory;
        }
        if let Some(level) = overrides.max_security_level {
            self.max_security_level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.run.is_empty() {
            return Err(Error::Configuration(format!(
                "{}: run command is empty",
                self.language
            )));
        }
        if self.compile.as_ref().is_some_and(|c| c.is_empty()) {
            return Err(Error::Configuration(format!(
                "{}: compile command is empty",
                self.language
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration(format!(
                "{}: timeout must be positive",
                self.language
            )));
        }
        if self.memory_limit_mb == 0 {
            return Err(Error::Configuration(format!(
                "{}: memory limit must be positive",
                self.language
            )));
        }
        Ok(())
    }
}

/// Partial profile, as found in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub toolchain: Option<String>,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    #[serde(default)]
    pub run: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub max_security_level: Option<SecurityLevel>,
}

/// Language id to profile mapping, immutable once the manager is built
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    profiles: BTreeMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in Python, JavaScript, Rust, C++ and Bash profiles
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for profile in [
            python::profile(),
            javascript::profile(),
            rust::profile(),
            cpp::profile(),
            bash::profile(),
        ] {
            registry.profiles.insert(profile.language, profile);
        }
        registry
    }

    /// Defaults with the given overrides applied
    pub fn with_overrides(overrides: &BTreeMap<Language, ProfileOverride>) -> Result<Self> {
        let mut registry = Self::with_defaults();
        for (language, o) in overrides {
            let profile = registry
                .profiles
                .get_mut(language)
                .ok_or_else(|| Error::UnsupportedLanguage(language.to_string()))?;
            profile.apply(o);
            profile.validate()?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, profile: LanguageProfile) -> Result<()> {
        profile.validate()?;
        self.profiles.insert(profile.language, profile);
        Ok(())
    }

    pub fn get(&self, language: Language) -> Result<&LanguageProfile> {
        self.profiles
            .get(&language)
            .ok_or_else(|| Error::UnsupportedLanguage(language.to_string()))
    }

    pub fn languages(&self) -> Vec<Language> {
        self.profiles.keys().copied().collect()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }

    /// Languages whose local toolchain is incomplete, with the programs missing
    pub fn missing_toolchains(&self) -> BTreeMap<Language, Vec<String>> {
        self.profiles
            .values()
            .map(|profile| (profile.language, profile.missing_tools()))
            .filter(|(_, missing)| !missing.is_empty())
            .collect()
    }
}

fn render(template: &[String], source: &str, binary: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace(SOURCE_PLACEHOLDER, source)
                .replace(BINARY_PLACEHOLDER, binary)
        })
        .collect()
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn check_command(cmd: &str) -> bool {
    which(cmd).is_ok()
}

#[cfg(test)]
pub(crate) fn skip_if_not_available(tools: &[&str]) -> bool {
    let missing: Vec<_> = tools
        .iter()
        .filter(|tool| which(**tool).is_err())
        .map(|s| (*s).to_string())
        .collect();

    if !missing.is_empty() {
        eprintln!("Skipping test: {} not available", missing.join(", "));
        return true;
    }
    false
}
