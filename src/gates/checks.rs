//! Built-in check vocabulary for gate pass conditions.
//!
//! A `CheckSpec` is the declarative form found in `gauntlet.toml` and on
//! invariants; `Check` is the compiled form evaluated against spec text.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Declarative check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckSpec {
    /// A markdown heading with this title must exist (case-insensitive).
    RequireSection { heading: String },
    /// The regex must match somewhere in the artifact.
    RequirePattern {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The regex must not match anywhere in the artifact.
    ForbidPattern {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// None of these words may appear as whole words.
    ForbidWords { words: Vec<String> },
    /// The artifact must have at least this many non-whitespace characters.
    MinLength { chars: usize },
}

impl CheckSpec {
    /// Short human label, used in listings and fix instructions.
    pub fn describe(&self) -> String {
        match self {
            CheckSpec::RequireSection { heading } => format!("section '{}' present", heading),
            CheckSpec::RequirePattern { pattern, message } => message
                .clone()
                .unwrap_or_else(|| format!("matches /{}/", pattern)),
            CheckSpec::ForbidPattern { pattern, message } => message
                .clone()
                .unwrap_or_else(|| format!("does not match /{}/", pattern)),
            CheckSpec::ForbidWords { words } => format!("avoids words: {}", words.join(", ")),
            CheckSpec::MinLength { chars } => format!("at least {} characters", chars),
        }
    }

    /// Compile this check for evaluation. `owner` names the gate or invariant
    /// in error messages.
    pub fn compile(&self, owner: &str) -> Result<Check, ConfigError> {
        let matcher = match self {
            CheckSpec::RequireSection { heading } => {
                let pattern = format!(r"^\s*#{{1,6}}\s+{}\s*#*\s*$", regex::escape(heading.trim()));
                Matcher::Regex(build_regex(owner, &pattern, true)?)
            }
            CheckSpec::RequirePattern { pattern, .. } | CheckSpec::ForbidPattern { pattern, .. } => {
                Matcher::Regex(build_regex(owner, pattern, false)?)
            }
            CheckSpec::ForbidWords { words } => {
                if words.is_empty() {
                    return Err(ConfigError::InvalidSetting {
                        key: format!("{}.forbid_words", owner),
                        reason: "word list is empty".into(),
                    });
                }
                let alternation = words
                    .iter()
                    .map(|w| regex::escape(w.trim()))
                    .collect::<Vec<_>>()
                    .join("|");
                Matcher::Regex(build_regex(owner, &format!(r"\b(?:{})\b", alternation), true)?)
            }
            CheckSpec::MinLength { chars } => Matcher::Length(*chars),
        };
        Ok(Check {
            spec: self.clone(),
            matcher,
        })
    }
}

fn build_regex(owner: &str, pattern: &str, case_insensitive: bool) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .multi_line(true)
        .build()
        .map_err(|source| ConfigError::InvalidPattern {
            gate: owner.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Length(usize),
}

/// Compiled check.
#[derive(Debug, Clone)]
pub struct Check {
    spec: CheckSpec,
    matcher: Matcher,
}

impl Check {
    pub fn spec(&self) -> &CheckSpec {
        &self.spec
    }

    /// Evaluate against `content`. Returns the violation text, or `None`
    /// when the check holds.
    pub fn evaluate(&self, content: &str) -> Option<String> {
        match (&self.spec, &self.matcher) {
            (CheckSpec::RequireSection { heading }, Matcher::Regex(re)) => {
                (!re.is_match(content)).then(|| format!("Missing required section '{}'", heading))
            }
            (CheckSpec::RequirePattern { pattern, message }, Matcher::Regex(re)) => {
                (!re.is_match(content)).then(|| {
                    message
                        .clone()
                        .unwrap_or_else(|| format!("Required pattern /{}/ not found", pattern))
                })
            }
            (CheckSpec::ForbidPattern { pattern, message }, Matcher::Regex(re)) => {
                let hits: Vec<usize> = re
                    .find_iter(content)
                    .map(|m| line_number(content, m.start()))
                    .collect();
                if hits.is_empty() {
                    return None;
                }
                let what = message
                    .clone()
                    .unwrap_or_else(|| format!("Forbidden pattern /{}/ found", pattern));
                Some(format!("{} (lines {})", what, join_numbers(&hits)))
            }
            (CheckSpec::ForbidWords { .. }, Matcher::Regex(re)) => {
                let mut found: Vec<String> = re
                    .find_iter(content)
                    .map(|m| m.as_str().to_lowercase())
                    .collect();
                if found.is_empty() {
                    return None;
                }
                found.sort();
                found.dedup();
                Some(format!("Vague wording found: {}", found.join(", ")))
            }
            (CheckSpec::MinLength { .. }, Matcher::Length(min)) => {
                let len = content.chars().filter(|c| !c.is_whitespace()).count();
                (len < *min).then(|| format!("Spec too short: {} of {} characters", len, min))
            }
            _ => None,
        }
    }
}

fn line_number(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

fn join_numbers(numbers: &[usize]) -> String {
    let mut unique = numbers.to_vec();
    unique.dedup();
    unique
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
