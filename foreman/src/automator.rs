//! Startup interaction loop: answer approval prompts until the worker is ready.
//!
//! This is the only place that types into the session without an explicit
//! phase directive. It is bounded by the rule table (only configured prompts
//! are answered, each occurrence once) and by a wall-clock timeout.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::exhausted;
use crate::core::rules::{ApprovalMemory, RuleTable};
use crate::core::types::SessionState;
use crate::error::ForemanError;
use crate::io::clock::Clock;
use crate::io::session::{Session, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadySettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub capture_lines: usize,
}

/// How the startup loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    TimedOut,
    /// An error rule matched; no further input was sent.
    Errored { rule: String, line: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyReport {
    pub outcome: ReadyOutcome,
    pub polls: u32,
    pub responses: u32,
    pub elapsed: Duration,
}

/// Poll the session until a readiness rule matches, an error rule matches, or
/// `settings.timeout` elapses.
///
/// Per poll, categories are checked in priority order `error > approval >
/// readiness`. An approval prompt is answered once per occurrence; while an
/// answered prompt is still on screen, only readiness below it counts.
#[instrument(skip_all, fields(session = %session.id, timeout_ms = settings.timeout.as_millis() as u64))]
pub fn await_ready(
    manager: &SessionManager<'_>,
    session: &mut Session,
    rules: &RuleTable,
    settings: &ReadySettings,
    clock: &dyn Clock,
) -> Result<ReadyReport> {
    let started = clock.now();
    let mut memory = ApprovalMemory::default();
    let mut polls = 0u32;
    let mut responses = 0u32;

    loop {
        polls += 1;
        let text = match manager.capture(session, settings.capture_lines) {
            Ok(text) => text,
            Err(err) => {
                if !manager.is_alive(session)? {
                    return Err(ForemanError::session_unavailable(
                        "session exited before the worker became ready",
                    )
                    .into());
                }
                return Err(err);
            }
        };
        let hits = rules.classify(&text);

        if let Some(error) = hits.error {
            warn!(rule = %error.rule_name, line = %error.line, "error pattern in worker output");
            let outcome = ReadyOutcome::Errored {
                rule: error.rule_name,
                line: error.line,
            };
            return Ok(ReadyReport {
                outcome,
                polls,
                responses,
                elapsed: clock.now().saturating_duration_since(started),
            });
        }

        let mut answered_now = false;
        match &hits.approval {
            Some(hit) if memory.is_new(hit) => {
                let response = rules
                    .get(hit.rule_index)
                    .and_then(|rule| rule.response.clone())
                    .unwrap_or_default();
                manager.set_state(session, SessionState::AwaitingApproval);
                manager
                    .send(session, &response)
                    .with_context(|| format!("answer approval prompt '{}'", hit.rule_name))?;
                memory.record(hit);
                responses += 1;
                answered_now = true;
                info!(rule = %hit.rule_name, prompt = %hit.line, response = %response, "approval prompt answered");
            }
            Some(hit) => {
                debug!(rule = %hit.rule_name, "approval already answered, still visible");
                memory.record(hit);
            }
            None => memory.clear(),
        }

        let ready_below_prompt = match (&hits.readiness, &hits.approval) {
            (Some(ready), Some(approval)) => ready.line_index > approval.line_index,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !answered_now
            && ready_below_prompt
            && let Some(ready) = &hits.readiness
        {
            manager.set_state(session, SessionState::Ready);
            info!(rule = %ready.rule_name, polls, responses, "worker ready");
            return Ok(ReadyReport {
                outcome: ReadyOutcome::Ready,
                polls,
                responses,
                elapsed: clock.now().saturating_duration_since(started),
            });
        }

        if exhausted(started, settings.timeout, clock.now()) {
            warn!(polls, responses, "worker did not become ready in time");
            return Ok(ReadyReport {
                outcome: ReadyOutcome::TimedOut,
                polls,
                responses,
                elapsed: clock.now().saturating_duration_since(started),
            });
        }
        clock.sleep(settings.poll_interval);
    }
}
