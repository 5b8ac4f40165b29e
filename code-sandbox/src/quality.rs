//! Per-language static heuristics summarised as a maintainability index and a letter grade

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::{types::Language, Result};

const LONG_LINE_CHARS: usize = 120;
const LONG_FUNCTION_LINES: usize = 50;
const MIN_COMMENT_RATIO: f64 = 0.05;
/// Comment ratio is only judged on snippets at least this long
const COMMENT_RATIO_MIN_LOC: usize = 10;
const SMELL_PENALTY: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_maintainability(index: f64) -> Self {
        if index >= 80.0 {
            Grade::A
        } else if index >= 60.0 {
            Grade::B
        } else if index >= 40.0 {
            Grade::C
        } else if index >= 20.0 {
            Grade::D
        } else {
            Grade::F
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeQualityMetrics {
    pub lines_of_code: usize,
    pub complexity_score: f64,
    pub maintainability_index: f64,
    pub code_smells: Vec<String>,
    pub security_issues: Vec<String>,
    pub performance_issues: Vec<String>,
    pub best_practices_violations: Vec<String>,
    pub overall_grade: Grade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindingKind {
    Smell,
    Security,
    Performance,
    BestPractice,
}

struct QualityRule {
    regex: Regex,
    kind: FindingKind,
    finding: &'static str,
}

struct RuleFamily {
    rules: Vec<QualityRule>,
    control_flow: Regex,
    function_start: Regex,
    comment_prefixes: &'static [&'static str],
}

type RuleSpec = (FindingKind, &'static str, &'static str);

const PYTHON_RULES: &[RuleSpec] = &[
    (FindingKind::Smell, r"^\s*from\s+\S+\s+import\s+\*", "Wildcard import detected"),
    (FindingKind::Smell, r"\bexcept\s*:", "Bare except clause"),
    (FindingKind::Security, r"\b(?:eval|exec)\s*\(", "Dynamic code execution"),
    (
        FindingKind::Performance,
        r"\bfor\s+\w+\s+in\s+range\s*\(\s*len\s*\(",
        "range(len(...)) loop, iterate directly or use enumerate()",
    ),
    (FindingKind::BestPractice, r"^\s*global\s+\w+", "Global statement"),
];

const JAVASCRIPT_RULES: &[RuleSpec] = &[
    (FindingKind::Security, r"\beval\s*\(", "eval() usage detected"),
    (
        FindingKind::Security,
        r"\bnew\s+Function\s*\(",
        "Function constructor builds code at runtime",
    ),
    (FindingKind::Smell, r"\bvar\s+", "var usage (prefer let/const)"),
    (
        FindingKind::Smell,
        r"(?:^|[^=!<>])(?:==|!=)(?:[^=]|$)",
        "Loose equality operator",
    ),
    (
        FindingKind::Smell,
        r"catch\s*(?:\(\s*\w*\s*\))?\s*\{\s*\}",
        "Empty catch block",
    ),
    (
        FindingKind::Performance,
        r"JSON\.parse\s*\(\s*JSON\.stringify",
        "Deep clone through a JSON round trip",
    ),
    (FindingKind::BestPractice, r"\bwith\s*\(", "with statement"),
];

const RUST_RULES: &[RuleSpec] = &[
    (FindingKind::Smell, r"^\s*use\s+[\w:]+::\*\s*;", "Wildcard import detected"),
    (
        FindingKind::Smell,
        r"catch_unwind",
        "Panic caught with catch_unwind",
    ),
    (FindingKind::Security, r"\bunsafe\s*\{", "unsafe block"),
    (
        FindingKind::Performance,
        r"\.collect::<Vec<[^>]*>>\(\)\s*\.len\(\)",
        "Collecting only to count, use count()",
    ),
    (FindingKind::BestPractice, r"\.unwrap\(\)", "unwrap() panics on error"),
];

const CPP_RULES: &[RuleSpec] = &[
    (
        FindingKind::Smell,
        r"\busing\s+namespace\s+std\s*;",
        "Wildcard import detected (using namespace std)",
    ),
    (
        FindingKind::Smell,
        r"catch\s*\(\s*\.\.\.\s*\)",
        "Catch-all exception handler",
    ),
    (FindingKind::Smell, r"\bgoto\s+\w+", "goto statement"),
    (
        FindingKind::Security,
        r"\b(?:gets|strcpy|strcat|sprintf)\s*\(",
        "Unbounded C string function",
    ),
    (FindingKind::Security, r"\bsystem\s*\(", "Shell command execution"),
    (
        FindingKind::Performance,
        r"std::endl",
        "std::endl flushes the stream on every line",
    ),
    (
        FindingKind::BestPractice,
        r"^\s*#define\s+\w+\s+\d",
        "Macro constant, prefer constexpr",
    ),
];

const BASH_RULES: &[RuleSpec] = &[
    (FindingKind::Security, r"\beval\s+", "eval of a dynamic string"),
    (
        FindingKind::Smell,
        r"`[^`]*`",
        "Backtick command substitution, prefer $(...)",
    ),
    (FindingKind::Smell, r"\|\|\s*true\b", "Errors silenced with || true"),
    (
        FindingKind::BestPractice,
        r"\brm\s+-rf\s+\$",
        "rm -rf on an unquoted variable",
    ),
    (
        FindingKind::Performance,
        r"\bcat\s+\S+\s*\|\s*grep\b",
        "Useless use of cat",
    ),
];

const HASH_COMMENTS: &[&str] = &["#"];
const SLASH_COMMENTS: &[&str] = &["//", "/*", "*"];

/// Keywords that look like calls but never start a function definition
const NOT_FUNCTIONS: &[&str] = &["if", "for", "while", "switch", "catch", "return", "sizeof"];

pub struct CodeQualityAnalyzer {
    families: BTreeMap<Language, RuleFamily>,
}

impl CodeQualityAnalyzer {
    pub fn new() -> Result<Self> {
        let mut families = BTreeMap::new();
        families.insert(
            Language::Python,
            family(
                PYTHON_RULES,
                r"\b(?:if|elif|for|while|try|except|with)\b",
                r"^\s*(?:async\s+)?def\s+(\w+)",
                HASH_COMMENTS,
            )?,
        );
        families.insert(
            Language::JavaScript,
            family(
                JAVASCRIPT_RULES,
                r"\b(?:if|for|while|try|catch|switch|case)\b",
                r"^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s*(\w+)|^\s*(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s*)?\([^)]*\)\s*=>",
                SLASH_COMMENTS,
            )?,
        );
        families.insert(
            Language::Rust,
            family(
                RUST_RULES,
                r"\b(?:if|for|while|loop|match)\b",
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+(\w+)",
                SLASH_COMMENTS,
            )?,
        );
        families.insert(
            Language::Cpp,
            family(
                CPP_RULES,
                r"\b(?:if|for|while|do|switch|case|catch)\b",
                r"^[\w:<>\*&\s]*?\b(\w+)\s*\([^;{]*\)\s*(?:const\s*)?\{",
                SLASH_COMMENTS,
            )?,
        );
        families.insert(
            Language::Bash,
            family(
                BASH_RULES,
                r"\b(?:if|elif|for|while|until|case)\b",
                r"^\s*(?:function\s+(\w+)|(\w+)\s*\(\s*\)\s*\{)",
                HASH_COMMENTS,
            )?,
        );
        Ok(Self { families })
    }

    /// Pure function of the source text: the same input always yields the same metrics
    pub fn analyze(&self, code: &str, language: Language) -> CodeQualityMetrics {
        let lines: Vec<&str> = code.lines().collect();
        let lines_of_code = lines.iter().filter(|l| !l.trim().is_empty()).count();

        let mut metrics = CodeQualityMetrics {
            lines_of_code,
            complexity_score: 0.0,
            maintainability_index: 100.0,
            code_smells: Vec::new(),
            security_issues: Vec::new(),
            performance_issues: Vec::new(),
            best_practices_violations: Vec::new(),
            overall_grade: Grade::A,
        };

        if let Some(family) = self.families.get(&language) {
            for rule in &family.rules {
                if !rule.regex.is_match(code) {
                    continue;
                }
                let sink = match rule.kind {
                    FindingKind::Smell => &mut metrics.code_smells,
                    FindingKind::Security => &mut metrics.security_issues,
                    FindingKind::Performance => &mut metrics.performance_issues,
                    FindingKind::BestPractice => &mut metrics.best_practices_violations,
                };
                sink.push(rule.finding.to_string());
            }

            let control_flow = family.control_flow.find_iter(code).count();
            metrics.complexity_score = control_flow as f64 / lines_of_code.max(1) as f64 * 100.0;

            metrics
                .code_smells
                .extend(long_functions(&lines, &family.function_start));

            if lines_of_code >= COMMENT_RATIO_MIN_LOC {
                let comments = lines
                    .iter()
                    .map(|l| l.trim_start())
                    .filter(|l| family.comment_prefixes.iter().any(|p| l.starts_with(p)))
                    .count();
                let ratio = comments as f64 / lines_of_code as f64;
                if ratio < MIN_COMMENT_RATIO {
                    metrics
                        .code_smells
                        .push(format!("Low comment ratio ({:.1}%)", ratio * 100.0));
                }
            }
        }

        let long_lines = lines
            .iter()
            .filter(|l| l.chars().count() > LONG_LINE_CHARS)
            .count();
        if long_lines > 0 {
            metrics.code_smells.push(format!(
                "{} lines exceed {} characters",
                long_lines, LONG_LINE_CHARS
            ));
        }

        metrics.maintainability_index = (100.0
            - metrics.complexity_score
            - metrics.code_smells.len() as f64 * SMELL_PENALTY)
            .max(0.0);
        metrics.overall_grade = Grade::from_maintainability(metrics.maintainability_index);

        debug!(
            %language,
            grade = %metrics.overall_grade,
            maintainability = metrics.maintainability_index,
            "Code quality analysis complete"
        );

        metrics
    }
}

fn family(
    rules: &[RuleSpec],
    control_flow: &str,
    function_start: &str,
    comment_prefixes: &'static [&'static str],
) -> Result<RuleFamily> {
    let rules = rules
        .iter()
        .map(|(kind, pattern, finding)| {
            Ok(QualityRule {
                regex: RegexBuilder::new(pattern).multi_line(true).build()?,
                kind: *kind,
                finding,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RuleFamily {
        rules,
        control_flow: Regex::new(control_flow)?,
        function_start: Regex::new(function_start)?,
        comment_prefixes,
    })
}

/// A function runs from its definition line to the next definition or the end of the file
fn long_functions(lines: &[&str], function_start: &Regex) -> Vec<String> {
    let starts: Vec<(usize, String)> = lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| {
            let caps = function_start.captures(line)?;
            let name = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().to_string())?;
            if NOT_FUNCTIONS.contains(&name.as_str()) {
                return None;
            }
            Some((i, name))
        })
        .collect();

    starts
        .iter()
        .enumerate()
        .filter_map(|(n, (start, name))| {
            let end = starts.get(n + 1).map_or(lines.len(), |(next, _)| *next);
            let length = lines[*start..end]
                .iter()
                .filter(|l| !l.trim().is_empty())
                .count();
            (length > LONG_FUNCTION_LINES).then(|| {
                format!(
                    "Function `{}` spans {} lines (limit {})",
                    name, length, LONG_FUNCTION_LINES
                )
            })
        })
        .collect()
}
