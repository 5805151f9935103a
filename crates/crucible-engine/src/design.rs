use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crucible_agents::{agent_names, aggregate_usage, AgentGateway, AgentOutcome, UsageSummary};
use crucible_store::{NewCandidate, Store};
use crucible_types::{
    Candidate, CandidateOrigin, CandidateScores, ConstraintVerdict, CrucibleError,
    DesignerResponse, ProblemSpec, ProvenanceActor, ProvenanceEntry, Result, Run,
};

#[derive(Debug, Clone, Serialize)]
pub struct DesignPhaseResult {
    pub candidates: Vec<Candidate>,
    pub reasoning: String,
    pub count: usize,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_summary: Option<UsageSummary>,
}

pub(crate) fn problem_spec_payload(spec: &ProblemSpec) -> Value {
    json!({
        "constraints": spec.constraints,
        "goals": spec.goals,
        "resolution": spec.resolution,
        "mode": spec.mode,
    })
}

/// Generate candidates for a run. The agent is told which candidate ids
/// already exist; no structural dedup happens here.
pub(crate) async fn run_design_phase(
    store: &Store,
    gateway: &AgentGateway,
    run: &Run,
    num_candidates: u32,
    cancel: &CancellationToken,
) -> Result<DesignPhaseResult> {
    let started = Instant::now();
    if cancel.is_cancelled() {
        return Err(CrucibleError::Cancelled);
    }

    let problem_spec = store.get_problem_spec(&run.project_id).await;
    let world_model = store.get_world_model(&run.project_id).await;
    let existing_ids: Vec<String> = store
        .list_candidates(Some(&run.id), None)
        .await
        .into_iter()
        .map(|c| c.id)
        .collect();

    let task = json!({
        "problem_spec": problem_spec.as_ref().map(problem_spec_payload),
        "world_model": world_model.as_ref().map(|m| m.model_data.clone()),
        "num_candidates": num_candidates,
        "existing_candidates": existing_ids,
    });

    let outcome: AgentOutcome<DesignerResponse> =
        gateway.invoke(agent_names::DESIGNER, &task).await?;
    let usage_summary = aggregate_usage([outcome.usage.as_ref()]);

    let mut created = Vec::new();
    for proposal in outcome.value.candidates {
        let compliance_metadata =
            serde_json::to_value(&proposal.constraint_compliance).unwrap_or(Value::Null);

        let scores = CandidateScores {
            constraint_satisfaction: proposal
                .constraint_compliance
                .iter()
                .map(|(constraint_id, estimate)| {
                    (
                        constraint_id.clone(),
                        ConstraintVerdict {
                            satisfied: estimate.satisfied(),
                            score: estimate.score(),
                            explanation: "Initial estimate from designer".to_string(),
                        },
                    )
                })
                .collect(),
            ..CandidateScores::default()
        };

        let candidate = store
            .create_candidate(NewCandidate {
                run_id: run.id.clone(),
                project_id: run.project_id.clone(),
                origin: CandidateOrigin::System,
                mechanism_description: proposal.mechanism_description,
                predicted_effects: proposal.predicted_effects,
                parent_ids: proposal.parent_ids.clone(),
            })
            .await?;
        store
            .update_candidate_scores(&candidate.id, scores)
            .await?;

        let entry = ProvenanceEntry::new("design", ProvenanceActor::Agent)
            .source(format!("run:{}", run.id))
            .description(
                proposal
                    .reasoning
                    .unwrap_or_else(|| "Generated by the designer agent".to_string()),
            )
            .reference_ids([run.id.clone(), candidate.id.clone()])
            .metadata(json!({
                "constraint_compliance": compliance_metadata,
                "parent_ids": proposal.parent_ids,
            }));
        store
            .append_candidate_provenance(&candidate.id, entry)
            .await?;

        let stored = store.get_candidate(&candidate.id).await.unwrap_or(candidate);
        created.push(stored);
    }

    let count = created.len();
    info!(
        run_id = %run.id,
        candidates = count,
        "design phase generated candidates"
    );

    Ok(DesignPhaseResult {
        candidates: created,
        reasoning: outcome.value.reasoning,
        count,
        duration_seconds: started.elapsed().as_secs_f64(),
        usage_summary,
    })
}
