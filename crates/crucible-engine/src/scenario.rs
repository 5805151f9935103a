use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crucible_agents::{agent_names, aggregate_usage, AgentGateway, AgentOutcome, UsageSummary};
use crucible_store::Store;
use crucible_types::{
    CrucibleError, Result, Run, Scenario, ScenarioGeneratorResponse, ScenarioSuite,
};

use crate::design::problem_spec_payload;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioPhaseResult {
    pub scenario_suite: ScenarioSuite,
    pub scenarios: Vec<Scenario>,
    pub reasoning: String,
    pub count: usize,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_summary: Option<UsageSummary>,
}

/// Weights land in [0, 1]; duplicate scenario ids keep the first occurrence.
fn sanitize_scenarios(raw: Vec<Scenario>) -> Vec<Scenario> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut scenarios = Vec::with_capacity(raw.len());
    for mut scenario in raw {
        if !seen.insert(scenario.id.clone()) {
            warn!(scenario_id = %scenario.id, "dropping scenario with duplicate id");
            continue;
        }
        scenario.weight = scenario.weight.clamp(0.0, 1.0);
        scenarios.push(scenario);
    }
    scenarios
}

/// Generate (or regenerate) the run's scenario suite. The suite is a
/// singleton per run: an existing suite is overwritten in place.
pub(crate) async fn run_scenario_phase(
    store: &Store,
    gateway: &AgentGateway,
    run: &Run,
    num_scenarios: u32,
    cancel: &CancellationToken,
) -> Result<ScenarioPhaseResult> {
    let started = Instant::now();
    if cancel.is_cancelled() {
        return Err(CrucibleError::Cancelled);
    }

    let problem_spec = store.get_problem_spec(&run.project_id).await;
    let world_model = store.get_world_model(&run.project_id).await;
    let candidates: Vec<_> = store
        .list_candidates(Some(&run.id), None)
        .await
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "mechanism_description": c.mechanism_description,
                "predicted_effects": c.predicted_effects,
            })
        })
        .collect();

    let task = json!({
        "problem_spec": problem_spec.as_ref().map(problem_spec_payload),
        "world_model": world_model.as_ref().map(|m| m.model_data.clone()),
        "candidates": candidates,
        "num_scenarios": num_scenarios,
    });

    let outcome: AgentOutcome<ScenarioGeneratorResponse> = gateway
        .invoke(agent_names::SCENARIO_GENERATOR, &task)
        .await?;
    let usage_summary = aggregate_usage([outcome.usage.as_ref()]);

    let scenarios = sanitize_scenarios(outcome.value.scenarios);
    let suite = store
        .upsert_scenario_suite(&run.id, scenarios.clone())
        .await?;

    let count = scenarios.len();
    info!(run_id = %run.id, scenarios = count, "scenario phase generated suite");

    Ok(ScenarioPhaseResult {
        scenario_suite: suite,
        scenarios,
        reasoning: outcome.value.reasoning,
        count,
        duration_seconds: started.elapsed().as_secs_f64(),
        usage_summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_types::ScenarioType;

    fn scenario(id: &str, weight: f64) -> Scenario {
        Scenario {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            scenario_type: ScenarioType::EdgeCase,
            focus: String::new(),
            initial_state: None,
            events: None,
            expected_outcomes: None,
            weight,
        }
    }

    #[test]
    fn weights_are_clamped_into_unit_interval() {
        let scenarios = sanitize_scenarios(vec![scenario("a", 1.7), scenario("b", -0.2)]);
        assert_eq!(scenarios[0].weight, 1.0);
        assert_eq!(scenarios[1].weight, 0.0);
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let scenarios = sanitize_scenarios(vec![
            scenario("a", 0.5),
            scenario("a", 0.9),
            scenario("b", 0.3),
        ]);
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[0].weight, 0.5);
    }
}
