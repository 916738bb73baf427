//! Structured completion signals printed by the worker.
//!
//! Parsing is read-only over a capture window: nothing is consumed, so phases
//! running side by side can all scan the same output. Every signal carries the
//! run token of the dispatch it answers; lines left in the scrollback by an
//! earlier dispatch carry another token and are ignored.

use anyhow::{Context, Result, anyhow};
use regex::Regex;

use crate::core::scheduler::CompletionReport;

/// Default line the worker prints when a phase attempt is done.
pub const DEFAULT_COMPLETION_PATTERN: &str =
    r"FOREMAN-DONE run=(?P<run>[0-9a-f]+) phase=(?P<phase>[a-z0-9_-]+) attempt=(?P<attempt>\d+) score=(?P<score>\d+)";

/// Compiled completion pattern with `run`, `phase`, `attempt` and `score` groups.
#[derive(Debug, Clone)]
pub struct CompletionPattern {
    regex: Regex,
}

impl CompletionPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).context("invalid completion pattern")?;
        for group in ["run", "phase", "attempt", "score"] {
            if !regex.capture_names().flatten().any(|name| name == group) {
                return Err(anyhow!(
                    "completion pattern must define a named group '{group}'"
                ));
            }
        }
        Ok(Self { regex })
    }

    /// Extract every well-formed signal for dispatch `run` in `text`, oldest
    /// first.
    ///
    /// Scores above 100, attempts of 0 and other runs' tokens are skipped.
    pub fn parse(&self, text: &str, run: &str) -> Vec<CompletionReport> {
        let mut reports = Vec::new();
        for caps in self.regex.captures_iter(text) {
            if caps.name("run").is_none_or(|token| token.as_str() != run) {
                continue;
            }
            let (Some(phase), Some(attempt), Some(score)) =
                (caps.name("phase"), caps.name("attempt"), caps.name("score"))
            else {
                continue;
            };
            let (Ok(attempt), Ok(score)) =
                (attempt.as_str().parse::<u32>(), score.as_str().parse::<u8>())
            else {
                continue;
            };
            if attempt == 0 || score > 100 {
                continue;
            }
            reports.push(CompletionReport {
                phase: phase.as_str().to_string(),
                attempt,
                quality_score: score,
                summary: None,
            });
        }
        reports
    }
}

impl Default for CompletionPattern {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_PATTERN).expect("default completion pattern is valid")
    }
}

/// Render the exact line the worker should print for `phase`/`attempt` of
/// dispatch `run`.
pub fn completion_line_example(run: &str, phase: &str, attempt: u32) -> String {
    format!("FOREMAN-DONE run={run} phase={phase} attempt={attempt} score=<0-100>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signals_in_order() {
        let pattern = CompletionPattern::default();
        let text = "noise\nFOREMAN-DONE run=ab12 phase=plan attempt=1 score=95\nmore\nFOREMAN-DONE run=ab12 phase=build attempt=2 score=60\n";
        let reports = pattern.parse(text, "ab12");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].phase, "plan");
        assert_eq!(reports[0].quality_score, 95);
        assert_eq!(reports[1].attempt, 2);
    }

    #[test]
    fn skips_out_of_range_values() {
        let pattern = CompletionPattern::default();
        let text = "FOREMAN-DONE run=ab12 phase=plan attempt=0 score=95\nFOREMAN-DONE run=ab12 phase=plan attempt=1 score=101\nFOREMAN-DONE run=ab12 phase=plan attempt=1 score=999\n";
        assert!(pattern.parse(text, "ab12").is_empty());
    }

    #[test]
    fn signals_from_an_earlier_dispatch_are_ignored() {
        let pattern = CompletionPattern::default();
        let text = "FOREMAN-DONE run=0dd0 phase=plan attempt=1 score=95\nFOREMAN-DONE run=5eed phase=plan attempt=1 score=10\n";
        let reports = pattern.parse(text, "5eed");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].quality_score, 10);
        assert!(pattern.parse(text, "ffff").is_empty());
    }

    #[test]
    fn placeholder_example_is_not_a_signal() {
        let pattern = CompletionPattern::default();
        assert!(
            pattern
                .parse(&completion_line_example("ab12", "plan", 1), "ab12")
                .is_empty()
        );
    }

    #[test]
    fn custom_pattern_requires_all_groups() {
        let err = CompletionPattern::new(r"DONE (?P<run>\w+) (?P<phase>\w+) (?P<score>\d+)")
            .unwrap_err();
        assert!(err.to_string().contains("'attempt'"));
        let err = CompletionPattern::new(r"\[(?P<phase>\w+)#(?P<attempt>\d+)\] quality (?P<score>\d+)")
            .unwrap_err();
        assert!(err.to_string().contains("'run'"));
        let custom = CompletionPattern::new(
            r"\[(?P<run>\w+)/(?P<phase>\w+)#(?P<attempt>\d+)\] quality (?P<score>\d+)",
        )
        .expect("custom pattern");
        let reports = custom.parse("[r1/verify#1] quality 97", "r1");
        assert_eq!(reports[0].phase, "verify");
    }
}
