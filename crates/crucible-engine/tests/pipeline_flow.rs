mod support;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crucible_agents::{agent_names, AgentRegistry, ScriptedAgent};
use crucible_store::ProblemSpecUpdate;
use crucible_types::{
    CandidateStatus, ChatSessionMode, Constraint, CrucibleError, MessageRole, ResolutionLevel,
    RunConfig, RunMode, RunStatus,
};

use support::{
    default_registry, registry_with_evaluator, scripted_designer, scripted_evaluator,
    scripted_scenario_generator, soft_constraint, Harness,
};

#[tokio::test]
async fn happy_path_ranks_candidates_by_information_efficiency() {
    let harness = Harness::new(registry_with_evaluator(scripted_evaluator(|index| {
        if index == 1 {
            (0.9, 0.5)
        } else {
            (0.3, 0.5)
        }
    })))
    .await;
    let project = harness
        .seeded_project(vec![soft_constraint("reliability", 50)])
        .await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let cancel = CancellationToken::new();
    let result = harness
        .orchestrator
        .execute_full_pipeline(&run.id, 2, 2, &cancel)
        .await
        .expect("pipeline");

    assert_eq!(result.status, "completed");
    assert_eq!(result.rankings.count, 2);
    assert!(result.rankings.hard_constraint_violations.is_empty());

    let first = &result.rankings.ranked_candidates[0];
    let second = &result.rankings.ranked_candidates[1];
    assert_eq!(first.mechanism_description, "Mechanism 1");
    assert!((first.scores.i_score() - 1.8).abs() < 1e-9);
    assert_eq!(first.status, CandidateStatus::Promising);
    assert!((second.scores.i_score() - 0.6).abs() < 1e-9);
    assert_eq!(second.status, CandidateStatus::UnderTest);

    let explanation = first
        .scores
        .ranking_explanation
        .as_deref()
        .expect("explanation");
    assert!(explanation.starts_with("Ranked #1 with I=1.80"));

    let stored = harness.store.get_run(&run.id).await.expect("stored run");
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.expect("completed") >= stored.started_at.expect("started"));
    assert_eq!(stored.candidate_count, Some(2));
    assert_eq!(stored.scenario_count, Some(2));
    assert_eq!(stored.evaluation_count, Some(4));
    assert!(stored.metrics.is_some());
    assert!(stored.llm_usage.is_some());
    assert!(stored.error_summary.is_none());
}

#[tokio::test]
async fn completed_run_posts_summary_into_first_chat_session() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let session = harness
        .store
        .create_chat_session(&project.id, Some("setup".into()), ChatSessionMode::Setup)
        .await
        .expect("session");
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    harness
        .orchestrator
        .execute_full_pipeline(&run.id, 2, 2, &CancellationToken::new())
        .await
        .expect("pipeline");

    let stored = harness.store.get_run(&run.id).await.expect("run");
    let message_id = stored.run_summary_message_id.expect("summary message id");
    let message = harness
        .store
        .get_message(&message_id)
        .await
        .expect("summary message");
    assert_eq!(message.chat_session_id, session.id);
    assert_eq!(message.role, MessageRole::Agent);
    assert!(message.content.contains("Counts: 2 candidates, 2 scenarios, 4 evaluations."));
    let metadata = message.metadata.expect("metadata");
    assert_eq!(metadata["agent_name"], "Architect");
    assert_eq!(metadata["run_summary"]["run_id"], stored.id);
    assert_eq!(metadata["run_summary"]["top_candidates"].as_array().map(|t| t.len()), Some(2));
}

#[tokio::test]
async fn hard_constraint_violation_forces_rejection() {
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(scripted_designer()));
    registry.register(Arc::new(scripted_scenario_generator()));
    registry.register(Arc::new(ScriptedAgent::new(agent_names::EVALUATOR, |_| {
        Ok(json!({
            "P": {"overall": 0.95},
            "R": {"overall": 0.2},
            "constraint_satisfaction": {
                "critical": {"satisfied": false, "score": 0.1, "explanation": "breached"},
            },
            "explanation": "fails the critical constraint",
        })
        .to_string())
    })));

    let harness = Harness::new(registry).await;
    let project = harness
        .seeded_project(vec![Constraint {
            name: "critical".into(),
            description: "must hold".into(),
            weight: 100,
        }])
        .await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let result = harness
        .orchestrator
        .execute_full_pipeline(&run.id, 1, 2, &CancellationToken::new())
        .await
        .expect("pipeline");

    let ranked = &result.rankings.ranked_candidates[0];
    // P/R are excellent, but the hard constraint wins.
    assert_eq!(ranked.status, CandidateStatus::Rejected);
    assert!(ranked.has_hard_violation);
    assert_eq!(result.rankings.hard_constraint_violations, vec![ranked.id.clone()]);

    let factors = ranked.scores.ranking_factors.as_ref().expect("factors");
    assert_eq!(
        factors.top_negative_factors[0],
        "Violates hard constraint 'critical'"
    );
    let explanation = ranked.scores.ranking_explanation.as_deref().expect("explanation");
    assert!(explanation.contains("Violates hard constraint 'critical'."));

    let candidate = harness.store.get_candidate(&ranked.id).await.expect("candidate");
    assert_eq!(candidate.status, CandidateStatus::Rejected);
}

#[tokio::test]
async fn missing_world_model_fails_the_pipeline_before_any_phase() {
    let harness = Harness::new(default_registry()).await;
    let project = harness
        .store
        .create_project("incomplete", None)
        .await
        .expect("project");
    harness
        .store
        .upsert_problem_spec(
            &project.id,
            ProblemSpecUpdate {
                constraints: Vec::new(),
                goals: vec!["g".into()],
                resolution: ResolutionLevel::Medium,
                mode: RunMode::FullSearch,
                provenance_log: None,
            },
        )
        .await
        .expect("spec");
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let err = harness
        .orchestrator
        .execute_full_pipeline(&run.id, 2, 2, &CancellationToken::new())
        .await
        .err()
        .expect("error");
    assert!(matches!(err, CrucibleError::PreconditionFailed(_)));
    assert!(err.to_string().contains("WorldModel not found"));
    assert!(err.to_string().contains(&project.id));

    let stored = harness.store.get_run(&run.id).await.expect("run");
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored.error_summary.expect("summary").contains("WorldModel not found"));
    assert!(harness
        .store
        .list_candidates(Some(&run.id), None)
        .await
        .is_empty());
    assert!(harness
        .store
        .list_evaluations(None, Some(&run.id))
        .await
        .is_empty());
}

#[tokio::test]
async fn evaluation_phase_is_idempotent() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");
    let cancel = CancellationToken::new();

    harness
        .orchestrator
        .execute_design_and_scenario_phase(&run.id, 2, 3, &cancel)
        .await
        .expect("design+scenario");

    let first = harness
        .orchestrator
        .execute_evaluation_phase(&run.id, &cancel)
        .await
        .expect("first evaluation");
    assert_eq!(first.count, 6);
    assert_eq!(first.skipped_existing, 0);

    let second = harness
        .orchestrator
        .execute_evaluation_phase(&run.id, &cancel)
        .await
        .expect("second evaluation");
    assert_eq!(second.count, 0);
    assert_eq!(second.attempted_pairs, 0);
    assert_eq!(second.skipped_existing, 6);

    assert_eq!(
        harness.store.list_evaluations(None, Some(&run.id)).await.len(),
        6
    );
}

#[tokio::test]
async fn single_evaluator_failures_are_contained() {
    // The evaluator refuses scenario-2; every other pair still lands.
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(scripted_designer()));
    registry.register(Arc::new(scripted_scenario_generator()));
    registry.register(Arc::new(ScriptedAgent::new(agent_names::EVALUATOR, |task| {
        if task["scenario"]["id"].as_str() == Some("scenario-2") {
            anyhow::bail!("transport exploded");
        }
        Ok(json!({
            "P": {"overall": 0.8},
            "R": {"overall": 0.4},
            "constraint_satisfaction": {},
            "explanation": "fine",
        })
        .to_string())
    })));

    let harness = Harness::new(registry).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let result = harness
        .orchestrator
        .execute_full_pipeline(&run.id, 2, 2, &CancellationToken::new())
        .await
        .expect("pipeline survives pair failures");

    assert_eq!(result.evaluations.attempted_pairs, 4);
    assert_eq!(result.evaluations.count, 2);
    assert_eq!(
        harness.store.get_run(&run.id).await.expect("run").status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn cancellation_fails_the_run_with_a_cancelled_summary() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .orchestrator
        .execute_full_pipeline(&run.id, 2, 2, &cancel)
        .await
        .err()
        .expect("cancelled");
    assert!(matches!(err, CrucibleError::Cancelled));

    let stored = harness.store.get_run(&run.id).await.expect("run");
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.error_summary.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn completed_status_survives_later_failures() {
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    harness
        .orchestrator
        .execute_full_pipeline(&run.id, 1, 1, &CancellationToken::new())
        .await
        .expect("pipeline");

    // A later design attempt on the completed run must not demote it.
    let err = harness
        .orchestrator
        .execute_design_phase(&run.id, 1, &CancellationToken::new())
        .await
        .err()
        .expect("terminal state rejects new phases");
    assert!(matches!(err, CrucibleError::Validation(_)));
    assert_eq!(
        harness.store.get_run(&run.id).await.expect("run").status,
        RunStatus::Completed
    );
}

#[tokio::test]
async fn equal_i_scores_preserve_candidate_creation_order() {
    // Every candidate scores identically, so the ranked order must match
    // the order the designer created them in.
    let harness = Harness::new(default_registry()).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let result = harness
        .orchestrator
        .execute_full_pipeline(&run.id, 3, 2, &CancellationToken::new())
        .await
        .expect("pipeline");

    let descriptions: Vec<&str> = result
        .rankings
        .ranked_candidates
        .iter()
        .map(|c| c.mechanism_description.as_str())
        .collect();
    assert_eq!(descriptions, vec!["Mechanism 1", "Mechanism 2", "Mechanism 3"]);
    let explanation = result.rankings.ranked_candidates[0]
        .scores
        .ranking_explanation
        .as_deref()
        .expect("explanation");
    assert!(explanation.starts_with("Ranked #1"));
}

#[tokio::test]
async fn design_parse_failure_degrades_to_zero_candidates() {
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(ScriptedAgent::new(agent_names::DESIGNER, |_| {
        Ok("no json here, sorry".to_string())
    })));
    registry.register(Arc::new(scripted_scenario_generator()));
    registry.register(Arc::new(scripted_evaluator(|_| (0.5, 0.5))));

    let harness = Harness::new(registry).await;
    let project = harness.seeded_project(Vec::new()).await;
    let run = harness
        .store
        .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
        .await
        .expect("run");

    let result = harness
        .orchestrator
        .execute_design_phase(&run.id, 3, &CancellationToken::new())
        .await
        .expect("safe default keeps the phase alive");
    assert_eq!(result.count, 0);
    assert!(result.reasoning.contains("Failed to parse"));
}
