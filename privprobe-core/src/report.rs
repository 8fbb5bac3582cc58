//! Scenario result accumulator and summary rendering.
//!
//! The report is the single mutable artifact of a run, owned by the
//! scenario runner. Everything else receives the immutable config.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HarnessResult;
use crate::probe::{MetadataVisibility, ProbeOutcome};
use crate::scenario::{Expectation, Phase, ProbePhase, TestCaseSpec, Verdict};
use crate::workload::WorkloadSummary;

/// Timestamped phase-transition record.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

/// One evaluated (or skipped) test case.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub id: String,
    pub description: String,
    pub phase: ProbePhase,
    pub actor: String,
    pub object: String,
    pub expectation: Expectation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ProbeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataVisibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub verdict: Verdict,
}

/// Aggregate result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub cases: Vec<CaseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadSummary>,
    /// Recorded distinctly from assertion failures: the operation under
    /// test died or a phase transition was never observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_error: Option<String>,
}

impl ScenarioReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            cases: Vec::new(),
            workload: None,
            supervision_error: None,
        }
    }

    pub fn enter_phase(&mut self, phase: Phase) {
        tracing::info!("phase: {phase}");
        self.phases.push(PhaseRecord {
            phase,
            at: Utc::now(),
        });
    }

    pub fn record_case(&mut self, result: CaseResult) {
        tracing::info!(
            "case {}: {} ({})",
            result.id,
            result.verdict,
            result
                .outcome
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| result.note.clone())
                .unwrap_or_default()
        );
        self.cases.push(result);
    }

    pub fn record_supervision_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("supervision error: {message}");
        self.supervision_error = Some(message);
    }

    /// Cases the run never reached get a skipped verdict; a supervision
    /// abort must not manufacture assertion failures.
    pub fn skip_unevaluated(&mut self, table: &[TestCaseSpec], reason: &str) {
        let evaluated: Vec<String> = self.cases.iter().map(|c| c.id.clone()).collect();
        for spec in table {
            if !evaluated.iter().any(|id| id == spec.id) {
                self.cases.push(CaseResult {
                    id: spec.id.to_string(),
                    description: spec.description.to_string(),
                    phase: spec.phase,
                    actor: spec.role.to_string(),
                    object: spec.object.to_string(),
                    expectation: spec.expectation,
                    outcome: None,
                    metadata: None,
                    note: Some(reason.to_string()),
                    verdict: Verdict::Skipped,
                });
            }
        }
    }

    pub fn set_workload(&mut self, summary: WorkloadSummary) {
        self.workload = Some(summary);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// (pass, fail, skipped) counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for case in &self.cases {
            match case.verdict {
                Verdict::Pass => counts.0 += 1,
                Verdict::Fail => counts.1 += 1,
                Verdict::Skipped => counts.2 += 1,
            }
        }
        counts
    }

    /// Overall PASS iff no case failed. Skipped cases never affect the
    /// aggregate; a supervision error is reported separately.
    pub fn overall_pass(&self) -> bool {
        self.cases.iter().all(|c| c.verdict != Verdict::Fail)
    }

    /// Exit code of the run: any failed assertion or supervision error is
    /// non-zero.
    pub fn exit_code(&self) -> i32 {
        if self.overall_pass() && self.supervision_error.is_none() {
            0
        } else {
            1
        }
    }

    /// Structured human-readable summary: one line per case plus a single
    /// aggregate line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("── scenario summary ─────────────────────────────────────────\n");
        for case in &self.cases {
            let detail = case
                .outcome
                .as_ref()
                .map(ToString::to_string)
                .or_else(|| case.note.clone())
                .unwrap_or_default();
            out.push_str(&format!(
                "{:<8} {:<36} {}\n",
                case.verdict.to_string(),
                case.id,
                detail
            ));
        }
        if let Some(workload) = &self.workload {
            out.push_str(&format!(
                "workload: {} writer(s), {} updates attempted, {} succeeded, {} failed\n",
                workload.writers, workload.attempted, workload.succeeded, workload.failed
            ));
        }
        if let Some(error) = &self.supervision_error {
            out.push_str(&format!("supervision error: {error}\n"));
        }
        let (pass, fail, skipped) = self.counts();
        out.push_str(&format!(
            "overall: {} ({pass} pass / {fail} fail / {skipped} skipped)\n",
            if self.exit_code() == 0 { "PASS" } else { "FAIL" }
        ));
        out
    }

    /// Persist the machine-readable form next to the run log.
    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::HarnessError::Io(std::io::Error::other(e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl Default for ScenarioReport {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
