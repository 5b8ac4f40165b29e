//! Static threat-pattern scanning.
//!
//! The analyzer is a heuristic risk signal: it matches known-dangerous constructs
//! and turns the weighted match counts into a [`SecurityLevel`]. It does not
//! prevent sandbox escapes on its own.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::{
    error::Error,
    types::{Language, SecurityLevel},
    Result,
};

/// Inputs larger than this are refused and fail closed
pub const DEFAULT_MAX_ANALYZED_BYTES: usize = 1024 * 1024;

/// Risk score reported when analysis could not complete
const FAIL_CLOSED_RISK: f64 = 100.0;

/// Longest matched snippet kept in the operation lists
const MAX_MATCH_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    FileOperations,
    NetworkOperations,
    SystemCalls,
    DangerousImports,
    AnalysisFailure,
}

impl ThreatCategory {
    /// Risk contributed by each individual match
    pub fn weight(&self) -> f64 {
        match self {
            ThreatCategory::FileOperations => 2.0,
            ThreatCategory::NetworkOperations => 3.0,
            ThreatCategory::SystemCalls => 1.5,
            ThreatCategory::DangerousImports => 0.0,
            ThreatCategory::AnalysisFailure => 0.0,
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            ThreatCategory::FileOperations => "Restrict file system access",
            ThreatCategory::NetworkOperations => "Block network access",
            ThreatCategory::SystemCalls => "Limit system call access",
            ThreatCategory::DangerousImports => "Review imported modules for privileged APIs",
            ThreatCategory::AnalysisFailure => "Review the code manually before running it",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::FileOperations => "file_operations",
            ThreatCategory::NetworkOperations => "network_operations",
            ThreatCategory::SystemCalls => "system_calls",
            ThreatCategory::DangerousImports => "dangerous_imports",
            ThreatCategory::AnalysisFailure => "analysis_failure",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pattern that fired, with how often
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub category: ThreatCategory,
    pub pattern: String,
    pub description: String,
    pub occurrences: usize,
}

/// Security analysis results. Built once per execution and never re-derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAnalysis {
    pub level: SecurityLevel,
    pub threats_detected: Vec<Threat>,
    pub file_operations: Vec<String>,
    pub network_operations: Vec<String>,
    pub system_calls: Vec<String>,
    pub risk_score: f64,
    pub recommendations: Vec<String>,
}

impl SecurityAnalysis {
    fn empty() -> Self {
        Self {
            level: SecurityLevel::Low,
            threats_detected: Vec::new(),
            file_operations: Vec::new(),
            network_operations: Vec::new(),
            system_calls: Vec::new(),
            risk_score: 0.0,
            recommendations: Vec::new(),
        }
    }

    /// Result used whenever analysis breaks: never let unanalyzed code through
    pub fn fail_closed(reason: impl Into<String>) -> Self {
        let category = ThreatCategory::AnalysisFailure;
        Self {
            level: SecurityLevel::Maximum,
            threats_detected: vec![Threat {
                category,
                pattern: String::new(),
                description: reason.into(),
                occurrences: 1,
            }],
            risk_score: FAIL_CLOSED_RISK,
            recommendations: vec![category.recommendation().to_string()],
            ..Self::empty()
        }
    }

    /// Whether the analyzer gave up on this input
    pub fn is_fail_closed(&self) -> bool {
        self.threats_detected
            .iter()
            .any(|t| t.category == ThreatCategory::AnalysisFailure)
    }

    /// Whether this analysis exceeds what `allowed` permits. Unanalyzed code never passes.
    pub fn exceeds(&self, allowed: SecurityLevel) -> bool {
        self.level > allowed || self.is_fail_closed()
    }
}

struct PatternRule {
    regex: Regex,
    source: String,
    description: String,
    /// Rule only applies to this language when set
    language: Option<Language>,
}

struct PatternGroup {
    category: ThreatCategory,
    rules: Vec<PatternRule>,
}

type RuleSpec = (&'static str, &'static str, Option<Language>);

const FILE_OPERATIONS: &[RuleSpec] = &[
    (r#"open\s*\(\s*['"]/"#, "Opens an absolute filesystem path", None),
    (r"os\.system", "Runs a shell command through os.system", None),
    (r"subprocess\.", "Spawns a subprocess", None),
    (r"\bexec(?:[lv]p?e?)?\s*\(", "Executes a program or dynamic code", None),
    (r"\beval\s*\(", "Evaluates dynamically built code", None),
    (r"__import__", "Imports modules dynamically", None),
    (r"\bfile\s*\(", "Opens a file handle", None),
    (r"\binput\s*\(", "Reads interactive input", None),
    (r"raw_input", "Reads interactive input", None),
    (r"child_process", "Uses the Node child process API", None),
    (r"\bfs\.(?:read|write|unlink|rm|append|open|copy|rename)", "Uses the Node filesystem API", None),
    (r"std::fs::", "Uses the Rust filesystem API", None),
    (r"Command::new\s*\(", "Spawns an external program", None),
    (r"\bfopen\s*\(", "Opens a file handle", None),
    (r"\bsystem\s*\(", "Runs a shell command through system()", None),
    (r"\bpopen\s*\(", "Runs a shell command through popen()", None),
    (r"\brm\s+-rf\b", "Deletes files recursively", None),
];

const NETWORK_OPERATIONS: &[RuleSpec] = &[
    (r"socket\.", "Opens a raw socket", None),
    (r"urllib", "Performs HTTP requests with urllib", None),
    (r"requests\.", "Performs HTTP requests with requests", None),
    (r"http\.", "Uses an HTTP client or server module", None),
    (r"ftp\.", "Uses FTP", None),
    (r"telnet", "Uses telnet", None),
    (r"\bssh\b", "Uses ssh", None),
    (r"\bfetch\s*\(", "Performs HTTP requests with fetch", None),
    (r"XMLHttpRequest", "Performs HTTP requests with XMLHttpRequest", None),
    (r"\bnet\.(?:connect|createConnection|createServer)", "Opens a Node network socket", None),
    (r"TcpStream|UdpSocket|TcpListener", "Opens a Rust network socket", None),
    (r"\bcurl\b", "Downloads with curl", None),
    (r"\bwget\b", "Downloads with wget", None),
    (r"/dev/(?:tcp|udp)/", "Opens a bash network redirection", None),
];

const SYSTEM_CALLS: &[RuleSpec] = &[
    (r"\bos\.", "Uses the os module", None),
    (r"\bsys\.", "Uses the sys module", None),
    (r"platform\.", "Inspects the host platform", None),
    (r"getpass", "Reads credentials or the current user", None),
    (r"\bpwd\b", "Reads the password database or working directory", None),
    (r"\bgrp\b", "Reads the group database", None),
    (r"subprocess\.", "Spawns a subprocess", None),
    (r"child_process", "Uses the Node child process API", None),
    (r"std::process", "Uses the Rust process API", None),
    (r"Command::new\s*\(", "Spawns an external program", None),
    (r"std::env", "Reads the process environment", None),
    (r"process\.(?:env|exit|kill)", "Touches the Node process", None),
    (r"\bsystem\s*\(", "Runs a shell command through system()", None),
    (r"\bpopen\s*\(", "Runs a shell command through popen()", None),
    (r"\bfork\s*\(", "Forks the process", None),
    (r"\bexec(?:[lv]p?e?)?\s*\(", "Executes a program or dynamic code", None),
    (r"\bkill\s+-9\b", "Sends SIGKILL", None),
    (r"\bchmod\b", "Changes file permissions", None),
    (r"\bsudo\b", "Escalates privileges", None),
    (r"ctypes", "Calls into native code", None),
];

const DANGEROUS_IMPORTS: &[RuleSpec] = &[
    (
        r"^\s*import\s+(?:os|sys|subprocess|socket|ctypes|shutil)\b",
        "Imports a privileged Python module",
        Some(Language::Python),
    ),
    (
        r"^\s*from\s+(?:os|sys|subprocess|socket|ctypes|shutil)\b",
        "Imports from a privileged Python module",
        Some(Language::Python),
    ),
    (
        r#"require\s*\(\s*['"](?:child_process|fs|net|http|https|dgram|vm)['"]\s*\)"#,
        "Requires a privileged Node module",
        Some(Language::JavaScript),
    ),
    (
        r#"from\s+['"](?:child_process|fs|net|http|https|dgram|vm)['"]"#,
        "Imports a privileged Node module",
        Some(Language::JavaScript),
    ),
    (
        r"use\s+std::(?:process|net|fs|os)\b",
        "Uses a privileged Rust std module",
        Some(Language::Rust),
    ),
    (
        r"#include\s*<(?:unistd\.h|sys/socket\.h|sys/ptrace\.h|cstdlib|stdlib\.h)>",
        "Includes a privileged C/C++ header",
        Some(Language::Cpp),
    ),
];

/// Analyzer tuning, normally taken from [`crate::SandboxConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerOptions {
    /// Inputs above this size fail closed
    #[serde(default)]
    pub max_analyzed_bytes: Option<usize>,
    /// Additional case-insensitive patterns per category
    #[serde(default)]
    pub extra_patterns: BTreeMap<ThreatCategory, Vec<String>>,
}

/// Scans source text for threat patterns
pub struct SecurityAnalyzer {
    groups: Vec<PatternGroup>,
    max_analyzed_bytes: usize,
}

impl SecurityAnalyzer {
    pub fn new() -> Result<Self> {
        Self::with_options(&AnalyzerOptions::default())
    }

    pub fn with_options(options: &AnalyzerOptions) -> Result<Self> {
        let mut groups = vec![
            build_group(ThreatCategory::FileOperations, FILE_OPERATIONS)?,
            build_group(ThreatCategory::NetworkOperations, NETWORK_OPERATIONS)?,
            build_group(ThreatCategory::SystemCalls, SYSTEM_CALLS)?,
            build_group(ThreatCategory::DangerousImports, DANGEROUS_IMPORTS)?,
        ];

        for (category, patterns) in &options.extra_patterns {
            let group = groups
                .iter_mut()
                .find(|g| g.category == *category)
                .ok_or_else(|| {
                    Error::Configuration(format!("patterns cannot be added to {}", category))
                })?;
            for pattern in patterns {
                group.rules.push(PatternRule {
                    regex: compile(pattern)?,
                    source: pattern.clone(),
                    description: format!("Matches configured {} pattern", category),
                    language: None,
                });
            }
        }

        Ok(Self {
            groups,
            max_analyzed_bytes: options
                .max_analyzed_bytes
                .unwrap_or(DEFAULT_MAX_ANALYZED_BYTES),
        })
    }

    /// Analyze `code`. Never fails: any error yields a `Maximum` analysis.
    pub fn analyze(&self, code: &str, language: Language) -> SecurityAnalysis {
        match self.try_analyze(code, language) {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(%language, "Security analysis failed, failing closed: {}", e);
                SecurityAnalysis::fail_closed(e.to_string())
            }
        }
    }

    fn try_analyze(&self, code: &str, language: Language) -> Result<SecurityAnalysis> {
        if code.len() > self.max_analyzed_bytes {
            return Err(Error::AnalysisFailed(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.max_analyzed_bytes
            )));
        }

        let mut analysis = SecurityAnalysis::empty();
        if code.trim().is_empty() {
            return Ok(analysis);
        }

        let mut fired = Vec::new();
        for group in &self.groups {
            let mut group_fired = false;
            for rule in &group.rules {
                if rule.language.is_some_and(|l| l != language) {
                    continue;
                }

                let matches: Vec<&str> = rule.regex.find_iter(code).map(|m| m.as_str()).collect();
                if matches.is_empty() {
                    continue;
                }
                group_fired = true;

                let sink = match group.category {
                    ThreatCategory::FileOperations => Some(&mut analysis.file_operations),
                    ThreatCategory::NetworkOperations => Some(&mut analysis.network_operations),
                    ThreatCategory::SystemCalls => Some(&mut analysis.system_calls),
                    ThreatCategory::DangerousImports | ThreatCategory::AnalysisFailure => None,
                };
                if let Some(sink) = sink {
                    sink.extend(matches.iter().map(|m| truncate(m.trim())));
                }

                analysis.threats_detected.push(Threat {
                    category: group.category,
                    pattern: rule.source.clone(),
                    description: rule.description.clone(),
                    occurrences: matches.len(),
                });
            }
            if group_fired {
                fired.push(group.category);
            }
        }

        analysis.risk_score = analysis.file_operations.len() as f64
            * ThreatCategory::FileOperations.weight()
            + analysis.network_operations.len() as f64
                * ThreatCategory::NetworkOperations.weight()
            + analysis.system_calls.len() as f64 * ThreatCategory::SystemCalls.weight()
            + code.len() as f64 / 1000.0;

        if !analysis.risk_score.is_finite() || analysis.risk_score < 0.0 {
            return Err(Error::AnalysisFailed(format!(
                "risk score out of range: {}",
                analysis.risk_score
            )));
        }

        analysis.level = SecurityLevel::from_risk_score(analysis.risk_score);
        analysis.recommendations = fired
            .iter()
            .map(|c| c.recommendation().to_string())
            .collect();

        debug!(
            %language,
            level = %analysis.level,
            risk = analysis.risk_score,
            threats = analysis.threats_detected.len(),
            "Security analysis complete"
        );

        Ok(analysis)
    }
}

fn build_group(category: ThreatCategory, specs: &[RuleSpec]) -> Result<PatternGroup> {
    let rules = specs
        .iter()
        .map(|(pattern, description, language)| {
            Ok(PatternRule {
                regex: compile(pattern)?,
                source: pattern.to_string(),
                description: description.to_string(),
                language: *language,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PatternGroup { category, rules })
}

fn compile(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()?)
}

fn truncate(s: &str) -> String {
    s.chars().take(MAX_MATCH_LEN).collect()
}
