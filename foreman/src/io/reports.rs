//! Workspace artifacts exchanged with the worker and the operator.
//!
//! - phase reports written by the worker (`.foreman/reports/<phase>.json`)
//! - marker files written by the supervisor (`.foreman/markers/<phase>.<kind>`)
//! - control files dropped by the operator (`CONTINUE`, `CANCEL`)
//!
//! Reading a report never modifies it; dispatches are told apart by the `run`
//! field and attempts by the `attempt` field, so stale files are harmless.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::plan::PhasePlan;
use crate::core::scheduler::CompletionReport;
use crate::io::workspace::{MarkerKind, WorkspaceLayout};

const PHASE_REPORT_SCHEMA: &str = include_str!("../../schemas/phase_report.schema.json");

/// On-disk phase report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub run: String,
    pub phase: String,
    pub attempt: u32,
    pub quality_score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl From<PhaseReport> for CompletionReport {
    fn from(report: PhaseReport) -> Self {
        Self {
            phase: report.phase,
            attempt: report.attempt,
            quality_score: report.quality_score,
            summary: report.summary,
        }
    }
}

/// Schema-validating reader for phase reports.
pub struct ReportReader {
    validator: Validator,
}

impl ReportReader {
    pub fn new() -> Result<Self> {
        let schema: Value =
            serde_json::from_str(PHASE_REPORT_SCHEMA).context("parse phase report schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|err| anyhow!("compile phase report schema: {err}"))?;
        Ok(Self { validator })
    }

    /// Read the report for `phase` written during dispatch `run`. Missing
    /// files and other runs' reports are `Ok(None)`; malformed or mismatched
    /// files are errors.
    pub fn read(
        &self,
        layout: &WorkspaceLayout,
        phase: &str,
        run: &str,
    ) -> Result<Option<CompletionReport>> {
        let path = layout.report_path(phase);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(anyhow!(
                "{} failed schema validation: {}",
                path.display(),
                messages.join("; ")
            ));
        }
        let report: PhaseReport = serde_json::from_value(value)
            .with_context(|| format!("decode {}", path.display()))?;
        if report.phase != phase {
            return Err(anyhow!(
                "{} names phase '{}'",
                path.display(),
                report.phase
            ));
        }
        if report.run != run {
            debug!(phase, stale_run = %report.run, "ignoring report from an earlier dispatch");
            return Ok(None);
        }
        Ok(Some(report.into()))
    }

    /// Reports for every active phase. Unreadable reports are logged and
    /// skipped; the worker may still be writing them.
    pub fn collect_active(
        &self,
        layout: &WorkspaceLayout,
        plan: &PhasePlan,
        run: &str,
    ) -> Vec<CompletionReport> {
        let mut reports = Vec::new();
        for phase in plan.active() {
            match self.read(layout, &phase.name, run) {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => warn!(phase = %phase.name, error = %format!("{err:#}"), "ignoring unreadable phase report"),
            }
        }
        reports
    }
}

/// Write the marker for a finished phase. `detail` becomes the file body.
pub fn write_marker(layout: &WorkspaceLayout, phase: &str, kind: MarkerKind, detail: &str) -> Result<()> {
    let path = layout.marker_path(phase, kind);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut body = detail.trim_end().to_string();
    body.push('\n');
    fs::write(&path, body).with_context(|| format!("write marker {}", path.display()))?;
    debug!(marker = %path.display(), "marker written");
    Ok(())
}

/// Consume a pending continue signal. Returns `true` if one was present.
pub fn take_continue(layout: &WorkspaceLayout) -> Result<bool> {
    remove_if_present(&layout.continue_path())
}

pub fn request_continue(layout: &WorkspaceLayout) -> Result<()> {
    touch(&layout.continue_path(), "continue")
}

/// Operator cancellation reason, if `CANCEL` exists. The file is left in place
/// so every later poll and a resumed launch see it too.
pub fn cancel_requested(layout: &WorkspaceLayout) -> Result<Option<String>> {
    let path = layout.cancel_path();
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let reason = contents.trim();
            Ok(Some(if reason.is_empty() {
                "cancelled by operator".to_string()
            } else {
                reason.to_string()
            }))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

pub fn request_cancel(layout: &WorkspaceLayout, reason: &str) -> Result<()> {
    touch(&layout.cancel_path(), reason)
}

fn touch(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, format!("{contents}\n")).with_context(|| format!("write {}", path.display()))
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{PhaseSpec, PhasePlan};
    use crate::core::types::PhaseStatus;

    fn layout() -> (tempfile::TempDir, WorkspaceLayout) {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkspaceLayout::new(temp.path());
        layout.ensure().expect("ensure");
        (temp, layout)
    }

    #[test]
    fn missing_report_is_none() {
        let (_temp, layout) = layout();
        let reader = ReportReader::new().expect("reader");
        assert_eq!(reader.read(&layout, "plan", "a1").expect("read"), None);
    }

    #[test]
    fn valid_report_is_parsed() {
        let (_temp, layout) = layout();
        fs::write(
            layout.report_path("plan"),
            r#"{"run":"a1","phase":"plan","attempt":2,"quality_score":93,"summary":"ok"}"#,
        )
        .expect("write");
        let reader = ReportReader::new().expect("reader");
        let report = reader.read(&layout, "plan", "a1").expect("read").expect("report");
        assert_eq!(report.attempt, 2);
        assert_eq!(report.quality_score, 93);
        assert_eq!(report.summary.as_deref(), Some("ok"));
    }

    #[test]
    fn out_of_range_score_fails_schema() {
        let (_temp, layout) = layout();
        fs::write(
            layout.report_path("plan"),
            r#"{"run":"a1","phase":"plan","attempt":1,"quality_score":140}"#,
        )
        .expect("write");
        let reader = ReportReader::new().expect("reader");
        let err = reader.read(&layout, "plan", "a1").unwrap_err();
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn report_from_an_earlier_dispatch_is_ignored() {
        let (_temp, layout) = layout();
        fs::write(
            layout.report_path("plan"),
            r#"{"run":"0dd","phase":"plan","attempt":1,"quality_score":95}"#,
        )
        .expect("write");
        let reader = ReportReader::new().expect("reader");
        assert_eq!(reader.read(&layout, "plan", "a1").expect("read"), None);
    }

    #[test]
    fn report_without_run_fails_schema() {
        let (_temp, layout) = layout();
        fs::write(
            layout.report_path("plan"),
            r#"{"phase":"plan","attempt":1,"quality_score":95}"#,
        )
        .expect("write");
        let reader = ReportReader::new().expect("reader");
        assert!(reader.read(&layout, "plan", "a1").is_err());
    }

    #[test]
    fn report_for_another_phase_is_rejected() {
        let (_temp, layout) = layout();
        fs::write(
            layout.report_path("plan"),
            r#"{"run":"a1","phase":"build","attempt":1,"quality_score":95}"#,
        )
        .expect("write");
        let reader = ReportReader::new().expect("reader");
        assert!(reader.read(&layout, "plan", "a1").is_err());
    }

    #[test]
    fn collect_active_skips_idle_and_broken_reports() {
        let (_temp, layout) = layout();
        let mut plan = PhasePlan::from_specs(
            &[
                PhaseSpec::new("a", "r", &[], &[]),
                PhaseSpec::new("b", "r", &[], &[]),
                PhaseSpec::new("c", "r", &[], &[]),
            ],
            2,
        )
        .expect("plan");
        plan.phases[0].status = PhaseStatus::Running;
        plan.phases[1].status = PhaseStatus::Running;
        fs::write(layout.report_path("a"), r#"{"run":"a1","phase":"a","attempt":1,"quality_score":91}"#)
            .expect("write");
        fs::write(layout.report_path("b"), "{\"phase\":").expect("write");
        fs::write(layout.report_path("c"), r#"{"run":"a1","phase":"c","attempt":1,"quality_score":91}"#)
            .expect("write");

        let reader = ReportReader::new().expect("reader");
        let reports = reader.collect_active(&layout, &plan, "a1");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].phase, "a");
    }

    #[test]
    fn continue_is_consumed_once_and_cancel_persists() {
        let (_temp, layout) = layout();
        assert!(!take_continue(&layout).expect("take"));
        request_continue(&layout).expect("request");
        assert!(take_continue(&layout).expect("take"));
        assert!(!take_continue(&layout).expect("take again"));

        assert_eq!(cancel_requested(&layout).expect("cancel"), None);
        request_cancel(&layout, "").expect("cancel");
        assert_eq!(
            cancel_requested(&layout).expect("cancel").as_deref(),
            Some("cancelled by operator")
        );
        assert!(cancel_requested(&layout).expect("again").is_some());
    }

    #[test]
    fn markers_are_written_per_kind() {
        let (_temp, layout) = layout();
        write_marker(&layout, "plan", MarkerKind::Done, "score 95").expect("marker");
        let body = fs::read_to_string(layout.marker_path("plan", MarkerKind::Done)).expect("read");
        assert_eq!(body, "score 95\n");
    }
}
