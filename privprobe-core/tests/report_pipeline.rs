//! End-to-end exercises of the public surface that do not need a live
//! database: configuration loading, the case table, verdict evaluation,
//! and report aggregation.

use privprobe_core::probe::ProbeOutcome;
use privprobe_core::report::{CaseResult, ScenarioReport};
use privprobe_core::scenario::{Expectation, Phase, ProbeObject, Verdict, case_table, evaluate};
use privprobe_core::{ActorRole, CredentialRegistry, ScenarioConfig};

fn reference_toml() -> &'static str {
    r#"
        [database]
        dbname = "isolation_test"

        [admin]
        user = "postgres"
        password = "pg"

        [[actors]]
        name = "a1"
        password = "s1"
        can_invoke = true

        [[actors]]
        name = "a2"
        password = "s2"
        can_invoke = true

        [[actors]]
        name = "a3"
        password = "s3"

        [target]
        owner = "a1"
    "#
}

#[test]
fn reference_config_defaults_match_the_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("privprobe.toml");
    std::fs::write(&path, reference_toml()).unwrap();

    let (config, warnings) = ScenarioConfig::load(&path).unwrap();
    assert!(warnings.is_empty());
    assert_eq!(config.workload.writers, 2);
    assert_eq!(config.workload.duration_secs, 600);
    assert_eq!(config.target.row_count, 10_000_000);
    assert_eq!(config.polling.interval_ms, 500);
    assert_eq!(config.polling.max_attempts, 60);
    assert_eq!(config.operation.program, "pg_repack");
    assert_eq!(config.target.qualified_name(), "app.accounts");
}

#[test]
fn registry_resolves_all_three_roles_from_reference_config() {
    let config = ScenarioConfig::from_toml(reference_toml()).unwrap();
    let registry = CredentialRegistry::from_config(&config).unwrap();
    assert_eq!(registry.by_role(ActorRole::Owner).unwrap().name, "a1");
    assert_eq!(registry.by_role(ActorRole::Peer).unwrap().name, "a2");
    assert_eq!(registry.by_role(ActorRole::Bystander).unwrap().name, "a3");
}

/// The outcome a correctly-isolating engine would produce for a case.
fn conforming_outcome(expectation: Expectation) -> ProbeOutcome {
    match expectation {
        Expectation::Allowed => ProbeOutcome::Allowed { rows: 1 },
        Expectation::Denied => ProbeOutcome::Denied {
            sqlstate: Some("42501".into()),
            detail: "permission denied".into(),
        },
        Expectation::Unobservable => ProbeOutcome::Missing,
        Expectation::Informational => ProbeOutcome::Allowed { rows: 0 },
    }
}

#[test]
fn conforming_engine_passes_every_case() {
    let mut report = ScenarioReport::new();
    report.enter_phase(Phase::Provisioned);
    for case in case_table() {
        let outcome = conforming_outcome(case.expectation);
        let verdict = evaluate(case.expectation, &outcome);
        report.record_case(CaseResult {
            id: case.id.to_string(),
            description: case.description.to_string(),
            phase: case.phase,
            actor: case.role.to_string(),
            object: case.object.to_string(),
            expectation: case.expectation,
            outcome: Some(outcome),
            metadata: None,
            note: None,
            verdict,
        });
    }
    report.finish();

    assert_eq!(report.cases.len(), 15);
    assert_eq!(report.counts(), (15, 0, 0));
    assert!(report.overall_pass());
    assert_eq!(report.exit_code(), 0);
}

#[test]
fn leaking_engine_fails_the_run_but_evaluates_every_case() {
    let mut report = ScenarioReport::new();
    for case in case_table() {
        // A worst-case engine that lets every actor read everything.
        let outcome = ProbeOutcome::Allowed { rows: 7 };
        let verdict = evaluate(case.expectation, &outcome);
        report.record_case(CaseResult {
            id: case.id.to_string(),
            description: case.description.to_string(),
            phase: case.phase,
            actor: case.role.to_string(),
            object: case.object.to_string(),
            expectation: case.expectation,
            outcome: Some(outcome),
            metadata: None,
            note: None,
            verdict,
        });
    }

    let (pass, fail, skipped) = report.counts();
    assert_eq!(pass + fail + skipped, 15);
    assert!(fail > 0);
    assert!(!report.overall_pass());
    assert_eq!(report.exit_code(), 1);
    let rendered = report.render();
    assert!(rendered.contains("overall: FAIL"));
}

#[test]
fn artifacts_cleaned_up_early_skip_rather_than_fail() {
    // The operation may drop both artifacts before the post-commit window.
    let missing = ProbeOutcome::Missing;
    for case in case_table().iter().filter(|c| {
        matches!(c.object, ProbeObject::Artifact(_)) && c.expectation != Expectation::Unobservable
    }) {
        assert_eq!(
            evaluate(case.expectation, &missing),
            Verdict::Skipped,
            "case {} should skip when the artifact is gone",
            case.id
        );
    }
}

#[test]
fn supervision_abort_skips_the_remainder_and_exits_nonzero() {
    let mut report = ScenarioReport::new();
    report.enter_phase(Phase::Provisioned);
    report.enter_phase(Phase::WorkloadRunning);
    report.enter_phase(Phase::OperationStarted);
    report.record_supervision_error("operation exited before 'copy-in-progress' was observed");
    report.skip_unevaluated(case_table(), "aborted before evaluation");
    report.finish();

    assert_eq!(report.counts(), (0, 0, 15));
    assert!(report.overall_pass());
    assert_eq!(report.exit_code(), 1);
    let rendered = report.render();
    assert!(rendered.contains("supervision error"));
    assert!(rendered.contains("overall: FAIL (0 pass / 0 fail / 15 skipped)"));
}
