//! Interaction rule table and output classification.
//!
//! The worker's output is an unstructured text stream. This module is the only
//! place that turns raw captured text into classified hits; everything
//! downstream works on [`Classification`] values. The rule table is data (see
//! [`RuleSpec`]) so operators can replace it without touching scheduling code.

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category of an interaction rule, listed in descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Error,
    Approval,
    Readiness,
}

/// Serializable rule definition, as written in `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Short label used in logs. Defaults to the pattern text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub category: RuleCategory,
    /// Regex matched against each captured line.
    pub pattern: String,
    /// Input sent when an approval rule fires (empty string sends a bare Enter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl RuleSpec {
    fn new(category: RuleCategory, name: &str, pattern: &str, response: Option<&str>) -> Self {
        Self {
            name: Some(name.to_string()),
            category,
            pattern: pattern.to_string(),
            response: response.map(str::to_string),
        }
    }
}

/// Best-effort defaults. The worker's prompt wording is not a stable contract,
/// so these are intentionally few and meant to be overridden in config.
pub fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec::new(
            RuleCategory::Error,
            "command-not-found",
            r"(?i)command not found",
            None,
        ),
        RuleSpec::new(
            RuleCategory::Error,
            "auth-failure",
            r"(?i)(invalid api key|authentication (failed|error)|please run /login)",
            None,
        ),
        RuleSpec::new(
            RuleCategory::Approval,
            "trust-folder",
            r"(?i)do you trust the files in this folder\?",
            Some("1"),
        ),
        RuleSpec::new(
            RuleCategory::Approval,
            "yes-no",
            r"(?i)\((y/n|yes/no)\)\s*\??\s*$",
            Some("y"),
        ),
        RuleSpec::new(
            RuleCategory::Approval,
            "press-enter",
            r"(?i)press enter to continue",
            Some(""),
        ),
        RuleSpec::new(
            RuleCategory::Readiness,
            "input-prompt",
            r"^\s*[>❯]\s*$",
            None,
        ),
        RuleSpec::new(
            RuleCategory::Readiness,
            "shortcuts-hint",
            r"(?i)\? for shortcuts",
            None,
        ),
    ]
}

/// A compiled interaction rule.
#[derive(Debug, Clone)]
pub struct InteractionRule {
    pub name: String,
    pub category: RuleCategory,
    pub pattern: Regex,
    pub response: Option<String>,
}

/// One rule firing against a capture window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub rule_index: usize,
    pub rule_name: String,
    pub category: RuleCategory,
    /// Most recent matching line (trailing whitespace trimmed).
    pub line: String,
    /// Zero-based line index of `line` within the capture window.
    pub line_index: usize,
    /// Number of lines in the window matching this rule.
    pub occurrences: usize,
}

/// Result of scanning one capture window against every rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub error: Option<RuleHit>,
    pub approval: Option<RuleHit>,
    pub readiness: Option<RuleHit>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.approval.is_none() && self.readiness.is_none()
    }
}

/// Ordered, compiled rule table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<InteractionRule>,
}

impl RuleTable {
    /// Compile rule specs. Approval rules must carry a response.
    pub fn compile(specs: &[RuleSpec]) -> Result<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let name = spec.name.clone().unwrap_or_else(|| spec.pattern.clone());
            let pattern = Regex::new(&spec.pattern)
                .with_context(|| format!("rule {index} ('{name}'): invalid pattern"))?;
            if spec.category == RuleCategory::Approval && spec.response.is_none() {
                return Err(anyhow!(
                    "rule {index} ('{name}'): approval rules require a response"
                ));
            }
            rules.push(InteractionRule {
                name,
                category: spec.category,
                pattern,
                response: spec.response.clone(),
            });
        }
        Ok(Self { rules })
    }

    pub fn get(&self, index: usize) -> Option<&InteractionRule> {
        self.rules.get(index)
    }

    /// Scan `text` line by line. Within a category the most recent hit wins;
    /// ties go to the rule listed first.
    pub fn classify(&self, text: &str) -> Classification {
        let lines: Vec<&str> = text.lines().collect();
        let mut classification = Classification::default();

        for (rule_index, rule) in self.rules.iter().enumerate() {
            let mut last: Option<(usize, &str)> = None;
            let mut occurrences = 0usize;
            for (line_index, line) in lines.iter().enumerate() {
                if rule.pattern.is_match(line) {
                    occurrences += 1;
                    last = Some((line_index, line));
                }
            }
            let Some((line_index, line)) = last else {
                continue;
            };
            let hit = RuleHit {
                rule_index,
                rule_name: rule.name.clone(),
                category: rule.category,
                line: line.trim_end().to_string(),
                line_index,
                occurrences,
            };
            let slot = match rule.category {
                RuleCategory::Error => &mut classification.error,
                RuleCategory::Approval => &mut classification.approval,
                RuleCategory::Readiness => &mut classification.readiness,
            };
            let replace = slot
                .as_ref()
                .is_none_or(|existing| hit.line_index > existing.line_index);
            if replace {
                *slot = Some(hit);
            }
        }

        classification
    }
}

/// Identity of one visible approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOccurrence {
    pub rule_index: usize,
    pub line: String,
    pub occurrences: usize,
}

impl From<&RuleHit> for PromptOccurrence {
    fn from(hit: &RuleHit) -> Self {
        Self {
            rule_index: hit.rule_index,
            line: hit.line.clone(),
            occurrences: hit.occurrences,
        }
    }
}

/// Remembers the last answered approval so a still-visible prompt is answered once.
///
/// The capture window slides, so an older copy of the same prompt can scroll
/// out and lower the visible count. Only a count above the remembered one is a
/// new occurrence.
#[derive(Debug, Clone, Default)]
pub struct ApprovalMemory {
    answered: Option<PromptOccurrence>,
}

impl ApprovalMemory {
    /// True if `hit` is a prompt occurrence that has not been answered yet.
    pub fn is_new(&self, hit: &RuleHit) -> bool {
        match &self.answered {
            None => true,
            Some(prev) => {
                prev.rule_index != hit.rule_index
                    || prev.line != hit.line
                    || hit.occurrences > prev.occurrences
            }
        }
    }

    /// Remember `hit` as answered. Also called for an already answered prompt
    /// so the count follows the window down.
    pub fn record(&mut self, hit: &RuleHit) {
        self.answered = Some(PromptOccurrence::from(hit));
    }

    /// Forget the answered prompt once it is no longer visible.
    pub fn clear(&mut self) {
        self.answered = None;
    }
}
