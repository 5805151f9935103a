mod support;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crucible_engine::CreateSnapshotRequest;
use crucible_types::{
    ChatSessionMode, CrucibleError, MessageRole, ReplayOptions, RunConfig, RunMode, RunStatus,
    SnapshotInvariant, SnapshotTestOptions, SnapshotTestStatus,
};

use support::{default_registry, soft_constraint, Harness};

async fn completed_run(harness: &Harness, project_id: &str, candidates: u32, scenarios: u32) -> String {
    let config = RunConfig {
        num_candidates: Some(candidates),
        num_scenarios: Some(scenarios),
        ..RunConfig::default()
    };
    let run = harness
        .store
        .create_run(project_id, RunMode::FullSearch, config, None)
        .await
        .expect("run");
    harness
        .orchestrator
        .execute_full_pipeline(&run.id, candidates, scenarios, &CancellationToken::new())
        .await
        .expect("pipeline");
    run.id
}

#[tokio::test]
async fn replay_round_trip_validates_invariants() {
    let harness = Harness::new(default_registry()).await;
    let project = harness
        .seeded_project(vec![soft_constraint("reliability", 50)])
        .await;
    let run_id = completed_run(&harness, &project.id, 3, 2).await;

    let snapshots = harness.snapshots();
    let snapshot = snapshots
        .create_snapshot(CreateSnapshotRequest {
            project_id: project.id.clone(),
            run_id: Some(run_id),
            name: "baseline".to_string(),
            description: "three candidate baseline".to_string(),
            tags: vec!["nightly".to_string()],
            invariants: vec![
                SnapshotInvariant::new("min_candidates", json!(3)),
                SnapshotInvariant::new("run_status", json!("completed")),
                SnapshotInvariant::new("min_evaluation_coverage", json!(1.0)),
            ],
            include_chat_context: false,
            max_chat_messages: 10,
        })
        .await
        .expect("snapshot");
    assert!(snapshot.reference_metrics.is_some());

    let replay = snapshots
        .replay_snapshot(
            &snapshot.id,
            ReplayOptions {
                num_candidates: Some(3),
                num_scenarios: Some(4),
                ..ReplayOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("replay");

    // The replay runs in a fresh ephemeral project.
    assert_ne!(replay.project_id, project.id);
    let replay_project = harness
        .store
        .get_project(&replay.project_id)
        .await
        .expect("replay project");
    assert_eq!(replay_project.title, "Snapshot Replay: baseline");

    let replay_run = harness
        .store
        .get_run(&replay.replay_run_id)
        .await
        .expect("replay run");
    assert_eq!(replay_run.status, RunStatus::Completed);
    assert_eq!(replay_run.candidate_count, Some(3));
    assert_eq!(replay_run.scenario_count, Some(4));
    assert_eq!(replay_run.evaluation_count, Some(12));

    let validation = snapshots
        .validate_invariants(
            &replay.replay_run_id,
            &snapshot.invariants,
            snapshot.reference_metrics.as_ref(),
        )
        .await
        .expect("validation");
    assert!(validation.all_passed, "failed: {:?}", validation.results);
    assert_eq!(validation.results.len(), 3);
}

#[tokio::test]
async fn restore_then_capture_round_trips_snapshot_data() {
    let harness = Harness::new(default_registry()).await;
    let project = harness
        .seeded_project(vec![soft_constraint("reliability", 50)])
        .await;

    let snapshots = harness.snapshots();
    let captured = snapshots
        .capture_snapshot_data(&project.id, None, false, 0)
        .await
        .expect("capture");

    let target = harness
        .store
        .create_project("restore target", None)
        .await
        .expect("target project");
    snapshots
        .restore_snapshot_data(&target.id, &captured)
        .await
        .expect("restore");

    let recaptured = snapshots
        .capture_snapshot_data(&target.id, None, false, 0)
        .await
        .expect("recapture");
    assert_eq!(captured, recaptured);
}

#[tokio::test]
async fn unsupported_snapshot_versions_are_refused() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;

    let err = harness
        .snapshots()
        .restore_snapshot_data(&project.id, &json!({"version": "2.0"}))
        .await
        .err()
        .expect("refused");
    assert!(matches!(err, CrucibleError::Validation(_)));
    assert!(err.to_string().contains("Unsupported snapshot version"));
}

#[tokio::test]
async fn chat_context_comes_from_the_newest_setup_session() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let session = harness
        .store
        .create_chat_session(&project.id, Some("setup".into()), ChatSessionMode::Setup)
        .await
        .expect("session");
    for index in 0..4 {
        harness
            .store
            .create_message(&session.id, MessageRole::User, format!("message {index}"), None)
            .await
            .expect("message");
    }

    let data = harness
        .snapshots()
        .capture_snapshot_data(&project.id, None, true, 2)
        .await
        .expect("capture");
    let context = data["chat_context"].as_array().expect("chat context");
    assert_eq!(context.len(), 2);
    assert_eq!(context[0]["content"], "message 2");
    assert_eq!(context[1]["content"], "message 3");
}

#[tokio::test]
async fn snapshot_test_batch_reports_passes_and_deltas() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run_id = completed_run(&harness, &project.id, 2, 2).await;

    let snapshots = harness.snapshots();
    snapshots
        .create_snapshot(CreateSnapshotRequest {
            project_id: project.id.clone(),
            run_id: Some(run_id),
            name: "regression-suite".to_string(),
            description: String::new(),
            tags: Vec::new(),
            invariants: vec![
                SnapshotInvariant::new("min_candidates", json!(2)),
                SnapshotInvariant::new("run_status", json!("completed")),
            ],
            include_chat_context: false,
            max_chat_messages: 10,
        })
        .await
        .expect("snapshot");

    let report = snapshots
        .run_snapshot_tests(None, SnapshotTestOptions::default(), &CancellationToken::new())
        .await
        .expect("report");

    assert_eq!(report.summary.total, 1);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 0);
    let result = &report.results[0];
    assert_eq!(result.status, SnapshotTestStatus::Passed);
    assert!(result.replay_run_id.is_some());
    assert_eq!(result.metrics_delta["candidate_count"].delta, 0.0);
    // Scripted agents report per-call cost, so replays accumulate spend.
    assert!(report.total_cost_usd > 0.0);
}

#[tokio::test]
async fn cost_limit_skips_remaining_snapshots() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run_id = completed_run(&harness, &project.id, 1, 1).await;

    let snapshots = harness.snapshots();
    for name in ["first", "second"] {
        snapshots
            .create_snapshot(CreateSnapshotRequest {
                project_id: project.id.clone(),
                run_id: Some(run_id.clone()),
                name: name.to_string(),
                description: String::new(),
                tags: Vec::new(),
                invariants: vec![SnapshotInvariant::new("run_status", json!("completed"))],
                include_chat_context: false,
                max_chat_messages: 10,
            })
            .await
            .expect("snapshot");
    }

    let report = snapshots
        .run_snapshot_tests(
            None,
            SnapshotTestOptions {
                cost_limit_usd: Some(0.0001),
                ..SnapshotTestOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("report");

    // The first replay blows the tiny budget; the second is skipped.
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.skipped, 1);
    assert!(report.results[1]
        .message
        .as_deref()
        .expect("message")
        .contains("Cost limit"));
}

#[tokio::test]
async fn failing_invariants_mark_the_snapshot_test_failed() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run_id = completed_run(&harness, &project.id, 1, 1).await;

    let snapshots = harness.snapshots();
    let snapshot = snapshots
        .create_snapshot(CreateSnapshotRequest {
            project_id: project.id.clone(),
            run_id: Some(run_id),
            name: "impossible".to_string(),
            description: String::new(),
            tags: Vec::new(),
            invariants: vec![SnapshotInvariant::new("min_candidates", json!(50))],
            include_chat_context: false,
            max_chat_messages: 10,
        })
        .await
        .expect("snapshot");

    let report = snapshots
        .run_snapshot_tests(
            Some(vec![snapshot.id.clone()]),
            SnapshotTestOptions {
                stop_on_first_failure: true,
                ..SnapshotTestOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .expect("report");

    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.results[0].status, SnapshotTestStatus::Failed);
    let invariant = &report.results[0].invariants[0];
    assert!(invariant.message.contains("Expected at least 50 candidates"));
}
