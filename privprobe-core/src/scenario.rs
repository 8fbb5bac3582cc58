//! The reference isolation scenario: phase machine, case table, verdict
//! evaluation, and the runner that drives a full run end to end.
//!
//! Assertion failures are recorded per case and never abort the run; only
//! setup, supervision, and phase-transition timeouts are fatal, and those
//! are recorded distinctly so a dead operation is never reported as a
//! broken isolation boundary.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::actor::{ActorRole, CredentialRegistry, SessionCache};
use crate::catalog::{ArtifactKind, CatalogMonitor};
use crate::clock::{Clock, TokioClock};
use crate::config::ScenarioConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::poller::{PollPolicy, PollVerdict, PredicateOutcome, StatePoller};
use crate::probe::{AccessProbe, ProbeOutcome};
use crate::report::{CaseResult, ScenarioReport};
use crate::supervisor::{OperationSpec, OperationSupervisor};
use crate::workload::WorkloadDriver;

// ── Phases ───────────────────────────────────────────────────────────────

/// Linear phase progression of one scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provisioned,
    WorkloadRunning,
    OperationStarted,
    CopyInProgress,
    PreCommitProbes,
    AwaitingCommitVisibility,
    PostCommitProbes,
    OperationDraining,
    Summary,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioned => "provisioned",
            Self::WorkloadRunning => "workload_running",
            Self::OperationStarted => "operation_started",
            Self::CopyInProgress => "copy_in_progress",
            Self::PreCommitProbes => "pre_commit_probes",
            Self::AwaitingCommitVisibility => "awaiting_commit_visibility",
            Self::PostCommitProbes => "post_commit_probes",
            Self::OperationDraining => "operation_draining",
            Self::Summary => "summary",
        };
        write!(f, "{s}")
    }
}

/// Which probe window a case belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePhase {
    PreCommit,
    PostCommit,
}

// ── Cases ────────────────────────────────────────────────────────────────

/// What a case reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeObject {
    Artifact(ArtifactKind),
    /// The target relation itself (owner baseline).
    Target,
    /// Catalog name visibility of an artifact, not a data read.
    Metadata(ArtifactKind),
}

impl std::fmt::Display for ProbeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Artifact(kind) => write!(f, "{kind}"),
            Self::Target => write!(f, "target"),
            Self::Metadata(kind) => write!(f, "{kind} metadata"),
        }
    }
}

/// Expected outcome of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// The read must succeed (row count is irrelevant, zero rows pass).
    Allowed,
    /// The read must be refused by the engine.
    Denied,
    /// The object must not be observable from a second session of the
    /// same actor while the copy is uncommitted.
    Unobservable,
    /// Recorded for the report; never produces a failure.
    Informational,
}

/// Per-case verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Skipped,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// One row of the scenario's case table.
#[derive(Debug, Clone, Copy)]
pub struct TestCaseSpec {
    pub id: &'static str,
    pub description: &'static str,
    pub phase: ProbePhase,
    pub role: ActorRole,
    pub object: ProbeObject,
    pub expectation: Expectation,
}

/// The fixed case table of the reference scenario. Order is evaluation
/// order within each probe window.
pub fn case_table() -> &'static [TestCaseSpec] {
    use ActorRole::*;
    use ArtifactKind::*;
    use Expectation::*;
    use ProbeObject::*;
    use ProbePhase::*;

    const CASES: &[TestCaseSpec] = &[
        TestCaseSpec {
            id: "pre-log-peer-read",
            description: "peer reads the change log during the copy",
            phase: PreCommit,
            role: Peer,
            object: Artifact(ChangeLog),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "pre-log-bystander-read",
            description: "bystander reads the change log during the copy",
            phase: PreCommit,
            role: Bystander,
            object: Artifact(ChangeLog),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "pre-intermediate-peer-read",
            description: "peer reads the intermediate copy during the copy",
            phase: PreCommit,
            role: Peer,
            object: Artifact(IntermediateCopy),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "pre-intermediate-bystander-read",
            description: "bystander reads the intermediate copy during the copy",
            phase: PreCommit,
            role: Bystander,
            object: Artifact(IntermediateCopy),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "pre-intermediate-owner-isolation",
            description: "owner's second session must not observe the uncommitted copy",
            phase: PreCommit,
            role: Owner,
            object: Artifact(IntermediateCopy),
            expectation: Unobservable,
        },
        TestCaseSpec {
            id: "pre-log-bystander-metadata",
            description: "bystander's catalog-level visibility of the change log name",
            phase: PreCommit,
            role: Bystander,
            object: Metadata(ChangeLog),
            expectation: Informational,
        },
        TestCaseSpec {
            id: "post-intermediate-owner-read",
            description: "owner reads the intermediate copy after commit",
            phase: PostCommit,
            role: Owner,
            object: Artifact(IntermediateCopy),
            expectation: Allowed,
        },
        TestCaseSpec {
            id: "post-intermediate-peer-read",
            description: "peer reads the intermediate copy after commit",
            phase: PostCommit,
            role: Peer,
            object: Artifact(IntermediateCopy),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "post-intermediate-bystander-read",
            description: "bystander reads the intermediate copy after commit",
            phase: PostCommit,
            role: Bystander,
            object: Artifact(IntermediateCopy),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "post-log-owner-read",
            description: "owner reads the change log after commit",
            phase: PostCommit,
            role: Owner,
            object: Artifact(ChangeLog),
            expectation: Allowed,
        },
        TestCaseSpec {
            id: "post-log-peer-read",
            description: "peer reads the change log after commit",
            phase: PostCommit,
            role: Peer,
            object: Artifact(ChangeLog),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "post-log-bystander-read",
            description: "bystander reads the change log after commit",
            phase: PostCommit,
            role: Bystander,
            object: Artifact(ChangeLog),
            expectation: Denied,
        },
        TestCaseSpec {
            id: "post-intermediate-peer-metadata",
            description: "peer's catalog-level visibility of the intermediate name",
            phase: PostCommit,
            role: Peer,
            object: Metadata(IntermediateCopy),
            expectation: Informational,
        },
        TestCaseSpec {
            id: "post-intermediate-bystander-metadata",
            description: "bystander's catalog-level visibility of the intermediate name",
            phase: PostCommit,
            role: Bystander,
            object: Metadata(IntermediateCopy),
            expectation: Informational,
        },
        TestCaseSpec {
            id: "post-target-owner-read",
            description: "owner reads the target relation (access baseline)",
            phase: PostCommit,
            role: Owner,
            object: Target,
            expectation: Allowed,
        },
    ];
    CASES
}

/// Map a probe outcome against an expectation. Missing objects always
/// skip rather than fail: the artifact lifecycle races the probe window
/// and an absent object proves nothing about the boundary.
pub fn evaluate(expectation: Expectation, outcome: &ProbeOutcome) -> Verdict {
    match (expectation, outcome) {
        (Expectation::Informational, _) => Verdict::Pass,

        (Expectation::Allowed, ProbeOutcome::Allowed { .. }) => Verdict::Pass,
        (Expectation::Allowed, ProbeOutcome::Denied { .. }) => Verdict::Fail,
        (Expectation::Allowed, ProbeOutcome::Missing) => Verdict::Skipped,

        (Expectation::Denied, ProbeOutcome::Denied { .. }) => Verdict::Pass,
        (Expectation::Denied, ProbeOutcome::Allowed { .. }) => Verdict::Fail,
        (Expectation::Denied, ProbeOutcome::Missing) => Verdict::Skipped,

        // Unobservable: a successful read of the uncommitted copy is the
        // one true failure. Missing is the expected answer. A denial is
        // ambiguous (the commit may have landed between the phase check
        // and the probe) and is skipped rather than judged.
        (Expectation::Unobservable, ProbeOutcome::Missing) => Verdict::Pass,
        (Expectation::Unobservable, ProbeOutcome::Allowed { .. }) => Verdict::Fail,
        (Expectation::Unobservable, ProbeOutcome::Denied { .. }) => Verdict::Skipped,
    }
}

// ── Runner ───────────────────────────────────────────────────────────────

/// Drives a full scenario run against an already-provisioned database.
pub struct ScenarioRunner<C: Clock> {
    config: ScenarioConfig,
    registry: Arc<CredentialRegistry>,
    clock: C,
}

impl ScenarioRunner<TokioClock> {
    pub fn new(config: ScenarioConfig) -> HarnessResult<Self> {
        Self::with_clock(config, TokioClock)
    }
}

impl<C: Clock> ScenarioRunner<C> {
    pub fn with_clock(config: ScenarioConfig, clock: C) -> HarnessResult<Self> {
        let registry = Arc::new(CredentialRegistry::from_config(&config)?);
        Ok(Self {
            config,
            registry,
            clock,
        })
    }

    /// Run the scenario to completion. Returns `Err` only for failures
    /// before the workload and operation are launched; anything after
    /// that is recorded in the report so the background units are always
    /// drained.
    pub async fn run(&self) -> HarnessResult<ScenarioReport> {
        let mut report = ScenarioReport::new();

        let cache = SessionCache::new(Arc::clone(&self.registry));
        let admin = cache.get_or_connect(self.registry.admin()).await?;
        let monitor = CatalogMonitor::new(&admin.client);

        let target = &self.config.target;
        let target_oid = monitor
            .relation_oid(&target.schema, &target.table)
            .await?
            .ok_or_else(|| {
                HarnessError::Setup(format!(
                    "target relation {} does not exist; run `provision` first",
                    target.qualified_name()
                ))
            })?;
        info!(
            "target {} resolved to oid {target_oid}",
            target.qualified_name()
        );
        report.enter_phase(Phase::Provisioned);

        let owner = self.registry.by_role(ActorRole::Owner)?.clone();
        let workload = WorkloadDriver::launch(
            &self.registry,
            &owner,
            &target.qualified_name(),
            self.config.workload.clone(),
        )
        .await?;
        report.enter_phase(Phase::WorkloadRunning);

        let spec = OperationSpec::build(
            &self.config.database,
            &self.config.operation,
            &owner,
            &target.qualified_name(),
        );
        let mut supervisor = match OperationSupervisor::spawn(&spec) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                workload.shutdown().await;
                return Err(e);
            }
        };
        report.enter_phase(Phase::OperationStarted);

        let outcome = self
            .drive(&mut report, &monitor, target_oid, &mut supervisor)
            .await;

        report.enter_phase(Phase::OperationDraining);
        if let Err(e) = outcome {
            report.record_supervision_error(e.to_string());
            report.skip_unevaluated(case_table(), "aborted before evaluation");
        }
        supervisor.terminate(true).await;
        let summary = workload.shutdown().await;
        report.set_workload(summary);
        cache.close_all().await;

        report.enter_phase(Phase::Summary);
        report.finish();
        Ok(report)
    }

    /// Phases between launch and drain. Every error out of here is
    /// recorded as a supervision error by the caller.
    async fn drive(
        &self,
        report: &mut ScenarioReport,
        monitor: &CatalogMonitor<'_>,
        target_oid: u32,
        supervisor: &mut OperationSupervisor,
    ) -> HarnessResult<()> {
        let policy = PollPolicy {
            interval: self.config.polling.interval(),
            max_attempts: self.config.polling.max_attempts,
        };
        let poller = StatePoller::new(policy, &self.clock);
        let artifact_schema = &self.config.operation.artifact_schema;

        // Copy phase: the change log has appeared and some backend is
        // actively filling the intermediate copy.
        let verdict = poller
            .await_predicate(
                "copy-in-progress",
                || supervisor.is_alive(),
                move || async move {
                    let log = monitor
                        .artifact_visible(artifact_schema, ArtifactKind::ChangeLog, target_oid)
                        .await?;
                    if log != PredicateOutcome::Satisfied {
                        return Ok(log);
                    }
                    if monitor.copy_write_active(artifact_schema, target_oid).await? {
                        Ok(PredicateOutcome::Satisfied)
                    } else {
                        Ok(PredicateOutcome::NotYet)
                    }
                },
            )
            .await?;
        if let PollVerdict::TimedOut { attempts } = verdict {
            return Err(HarnessError::Timeout {
                what: "copy-in-progress".into(),
                attempts,
                waited: policy.budget(),
            });
        }
        report.enter_phase(Phase::CopyInProgress);

        report.enter_phase(Phase::PreCommitProbes);
        self.run_probes(report, ProbePhase::PreCommit, target_oid)
            .await;

        // Commit: the intermediate copy becomes catalog-visible to other
        // sessions once the copy transaction commits.
        report.enter_phase(Phase::AwaitingCommitVisibility);
        let verdict = poller
            .await_predicate(
                "commit-visibility",
                || supervisor.is_alive(),
                move || {
                    monitor.artifact_visible(
                        artifact_schema,
                        ArtifactKind::IntermediateCopy,
                        target_oid,
                    )
                },
            )
            .await?;
        if let PollVerdict::TimedOut { attempts } = verdict {
            return Err(HarnessError::Timeout {
                what: "commit-visibility".into(),
                attempts,
                waited: policy.budget(),
            });
        }

        report.enter_phase(Phase::PostCommitProbes);
        self.run_probes(report, ProbePhase::PostCommit, target_oid)
            .await;
        Ok(())
    }

    /// Execute every case of one probe window. Infallible: probe failure
    /// modes are classifications, and a missing role is a per-case skip.
    async fn run_probes(&self, report: &mut ScenarioReport, phase: ProbePhase, target_oid: u32) {
        let probe = AccessProbe::new(Arc::clone(&self.registry));
        let artifact_schema = &self.config.operation.artifact_schema;

        for case in case_table().iter().filter(|c| c.phase == phase) {
            let actor = match self.registry.by_role(case.role) {
                Ok(actor) => actor,
                Err(e) => {
                    warn!("case {}: {e}", case.id);
                    report.record_case(CaseResult {
                        id: case.id.to_string(),
                        description: case.description.to_string(),
                        phase: case.phase,
                        actor: case.role.to_string(),
                        object: case.object.to_string(),
                        expectation: case.expectation,
                        outcome: None,
                        metadata: None,
                        note: Some(e.to_string()),
                        verdict: Verdict::Skipped,
                    });
                    continue;
                }
            };

            let (outcome, metadata, object_name) = match case.object {
                ProbeObject::Artifact(kind) => {
                    let name = kind.object_name(artifact_schema, target_oid);
                    let outcome = probe.probe(actor, &name).await;
                    (Some(outcome), None, name)
                }
                ProbeObject::Target => {
                    let name = self.config.target.qualified_name();
                    let outcome = probe.probe(actor, &name).await;
                    (Some(outcome), None, name)
                }
                ProbeObject::Metadata(kind) => {
                    let visibility = probe
                        .probe_metadata_visibility(actor, artifact_schema, kind, target_oid)
                        .await;
                    let name = kind.object_name(artifact_schema, target_oid);
                    (None, Some(visibility), name)
                }
            };

            let verdict = match &outcome {
                Some(outcome) => evaluate(case.expectation, outcome),
                None => Verdict::Pass,
            };
            let note = metadata.as_ref().map(|m| {
                format!(
                    "catalog name visible: {}{}",
                    m.visible,
                    m.resolved
                        .as_deref()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default()
                )
            });

            report.record_case(CaseResult {
                id: case.id.to_string(),
                description: case.description.to_string(),
                phase: case.phase,
                actor: actor.name.clone(),
                object: object_name,
                expectation: case.expectation,
                outcome,
                metadata,
                note,
                verdict,
            });
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn denied() -> ProbeOutcome {
        ProbeOutcome::Denied {
            sqlstate: Some("42501".into()),
            detail: "permission denied".into(),
        }
    }

    #[test]
    fn test_case_table_shape() {
        let table = case_table();
        assert_eq!(table.len(), 15);
        assert_eq!(
            table.iter().filter(|c| c.phase == ProbePhase::PreCommit).count(),
            6
        );
        assert_eq!(
            table.iter().filter(|c| c.phase == ProbePhase::PostCommit).count(),
            9
        );
        // Ids are unique.
        for (i, a) in table.iter().enumerate() {
            for b in &table[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn test_denied_expectation() {
        assert_eq!(evaluate(Expectation::Denied, &denied()), Verdict::Pass);
        assert_eq!(
            evaluate(Expectation::Denied, &ProbeOutcome::Allowed { rows: 3 }),
            Verdict::Fail
        );
        assert_eq!(
            evaluate(Expectation::Denied, &ProbeOutcome::Missing),
            Verdict::Skipped
        );
    }

    #[test]
    fn test_allowed_expectation() {
        assert_eq!(
            evaluate(Expectation::Allowed, &ProbeOutcome::Allowed { rows: 0 }),
            Verdict::Pass
        );
        assert_eq!(evaluate(Expectation::Allowed, &denied()), Verdict::Fail);
        assert_eq!(
            evaluate(Expectation::Allowed, &ProbeOutcome::Missing),
            Verdict::Skipped
        );
    }

    #[test]
    fn test_unobservable_expectation() {
        // Not seeing the uncommitted copy is the pass condition.
        assert_eq!(
            evaluate(Expectation::Unobservable, &ProbeOutcome::Missing),
            Verdict::Pass
        );
        assert_eq!(
            evaluate(Expectation::Unobservable, &ProbeOutcome::Allowed { rows: 1 }),
            Verdict::Fail
        );
        // A denial means the commit may have already landed; ambiguous.
        assert_eq!(
            evaluate(Expectation::Unobservable, &denied()),
            Verdict::Skipped
        );
    }

    #[test]
    fn test_informational_never_fails() {
        for outcome in [
            ProbeOutcome::Allowed { rows: 1 },
            denied(),
            ProbeOutcome::Missing,
        ] {
            assert_eq!(evaluate(Expectation::Informational, &outcome), Verdict::Pass);
        }
    }

    #[test]
    fn test_phase_display_is_snake_case() {
        assert_eq!(Phase::AwaitingCommitVisibility.to_string(), "awaiting_commit_visibility");
        assert_eq!(Phase::CopyInProgress.to_string(), "copy_in_progress");
    }

    #[test]
    fn test_owner_baseline_is_last() {
        let table = case_table();
        assert_eq!(table[table.len() - 1].id, "post-target-owner-read");
        assert_eq!(table[table.len() - 1].expectation, Expectation::Allowed);
    }
}
