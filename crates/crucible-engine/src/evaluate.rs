use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crucible_agents::{agent_names, aggregate_usage, AgentGateway, AgentOutcome, AgentUsage, UsageSummary};
use crucible_store::{NewEvaluation, Store};
use crucible_types::{
    Candidate, CrucibleError, Evaluation, EvaluatorResponse, Result, Run, Scenario,
};

use crate::design::problem_spec_payload;

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationPhaseResult {
    pub evaluations: Vec<Evaluation>,
    pub count: usize,
    pub candidates_evaluated: usize,
    pub scenarios_used: usize,
    pub attempted_pairs: usize,
    pub skipped_existing: usize,
    pub llm_call_count: usize,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_summary: Option<UsageSummary>,
}

enum PairOutcome {
    Created(Evaluation, Option<AgentUsage>),
    Failed,
    Cancelled,
}

async fn evaluate_pair(
    store: &Store,
    gateway: &AgentGateway,
    run_id: &str,
    candidate: &Candidate,
    scenario: &Scenario,
    problem_spec: &Value,
    world_model: &Value,
) -> Result<(Evaluation, Option<AgentUsage>)> {
    let task = json!({
        "candidate": {
            "id": candidate.id,
            "mechanism_description": candidate.mechanism_description,
            "predicted_effects": candidate.predicted_effects,
            "scores": candidate.scores,
        },
        "scenario": scenario,
        "problem_spec": problem_spec,
        "world_model": world_model,
    });

    let outcome: AgentOutcome<EvaluatorResponse> =
        gateway.invoke(agent_names::EVALUATOR, &task).await?;

    let evaluation = store
        .create_evaluation(NewEvaluation {
            candidate_id: candidate.id.clone(),
            run_id: run_id.to_string(),
            scenario_id: scenario.id.clone(),
            p: outcome.value.p,
            r: outcome.value.r,
            constraint_satisfaction: outcome.value.constraint_satisfaction,
            explanation: outcome.value.explanation,
        })
        .await?;

    Ok((evaluation, outcome.usage))
}

/// Evaluate every (candidate, scenario) pair that has no evaluation yet.
///
/// Pairs fan out over a bounded worker pool and each result is persisted as
/// it completes. A single failed pair is logged and skipped; the remaining
/// pairs are still attempted. Cancellation short-circuits before each
/// unscheduled pair and surfaces once in-flight work has drained.
pub(crate) async fn run_evaluation_phase(
    store: &Arc<Store>,
    gateway: &Arc<AgentGateway>,
    run: &Run,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<EvaluationPhaseResult> {
    let started = Instant::now();

    let mut candidates = store.list_candidates(Some(&run.id), None).await;
    if candidates.is_empty() {
        return Err(CrucibleError::precondition(format!(
            "No candidates found for run {}",
            run.id
        )));
    }
    // Chronological order keeps pair dispatch deterministic.
    candidates.reverse();

    let suite = store.get_scenario_suite(&run.id).await.ok_or_else(|| {
        CrucibleError::precondition(format!("Scenario suite not found for run {}", run.id))
    })?;
    if suite.scenarios.is_empty() {
        return Err(CrucibleError::precondition(format!(
            "No scenarios found in scenario suite for run {}",
            run.id
        )));
    }

    let existing: HashSet<(String, String)> = store
        .list_evaluations(None, Some(&run.id))
        .await
        .into_iter()
        .map(|e| (e.candidate_id, e.scenario_id))
        .collect();

    let problem_spec = store
        .get_problem_spec(&run.project_id)
        .await
        .as_ref()
        .map(problem_spec_payload)
        .unwrap_or(Value::Null);
    let world_model = store
        .get_world_model(&run.project_id)
        .await
        .map(|m| m.model_data)
        .unwrap_or(Value::Null);

    let candidates_evaluated = candidates.len();
    let scenarios_used = suite.scenarios.len();
    let total_pairs = candidates_evaluated * scenarios_used;

    let pairs: Vec<(Candidate, Scenario)> = candidates
        .iter()
        .flat_map(|candidate| {
            suite
                .scenarios
                .iter()
                .filter(|scenario| {
                    !existing.contains(&(candidate.id.clone(), scenario.id.clone()))
                })
                .map(|scenario| (candidate.clone(), scenario.clone()))
        })
        .collect();
    let attempted_pairs = pairs.len();
    let skipped_existing = total_pairs - attempted_pairs;

    let problem_spec = Arc::new(problem_spec);
    let world_model = Arc::new(world_model);

    let outcomes: Vec<PairOutcome> = stream::iter(pairs.into_iter().map(|(candidate, scenario)| {
        let store = store.clone();
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        let problem_spec = problem_spec.clone();
        let world_model = world_model.clone();
        let run_id = run.id.clone();
        async move {
            if cancel.is_cancelled() {
                return PairOutcome::Cancelled;
            }
            match evaluate_pair(
                &store,
                &gateway,
                &run_id,
                &candidate,
                &scenario,
                &problem_spec,
                &world_model,
            )
            .await
            {
                Ok((evaluation, usage)) => PairOutcome::Created(evaluation, usage),
                Err(err) => {
                    warn!(
                        run_id = %run_id,
                        candidate_id = %candidate.id,
                        scenario_id = %scenario.id,
                        error = %err,
                        "evaluation pair failed; continuing with remaining pairs"
                    );
                    PairOutcome::Failed
                }
            }
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

    let mut evaluations = Vec::new();
    let mut usages: Vec<Option<AgentUsage>> = Vec::new();
    let mut llm_call_count = 0usize;
    for outcome in outcomes {
        match outcome {
            PairOutcome::Created(evaluation, usage) => {
                llm_call_count += 1;
                evaluations.push(evaluation);
                usages.push(usage);
            }
            PairOutcome::Failed => llm_call_count += 1,
            PairOutcome::Cancelled => {}
        }
    }

    if cancel.is_cancelled() {
        return Err(CrucibleError::Cancelled);
    }

    let usage_summary = aggregate_usage(usages.iter().map(|u| u.as_ref()));
    let count = evaluations.len();
    info!(
        run_id = %run.id,
        evaluations = count,
        attempted = attempted_pairs,
        skipped = skipped_existing,
        "evaluation phase finished"
    );

    Ok(EvaluationPhaseResult {
        evaluations,
        count,
        candidates_evaluated,
        scenarios_used,
        attempted_pairs,
        skipped_existing,
        llm_call_count,
        duration_seconds: started.elapsed().as_secs_f64(),
        usage_summary,
    })
}
