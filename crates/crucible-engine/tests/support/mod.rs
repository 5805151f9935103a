#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use crucible_agents::{agent_names, AgentGateway, AgentRegistry, ScriptedAgent};
use crucible_engine::{RemediationEngine, RunOrchestrator, SnapshotEngine};
use crucible_store::{ProblemSpecUpdate, Store};
use crucible_types::{Constraint, Project, ResolutionLevel, RunMode};

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub store: Arc<Store>,
    pub orchestrator: RunOrchestrator,
}

impl Harness {
    pub async fn new(registry: AgentRegistry) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::new(dir.path()).await.expect("store"));
        let gateway = Arc::new(AgentGateway::new(registry));
        let orchestrator = RunOrchestrator::new(store.clone(), gateway, 4);
        Self {
            _dir: dir,
            store,
            orchestrator,
        }
    }

    pub fn remediation(&self) -> RemediationEngine {
        RemediationEngine::new(self.store.clone(), self.orchestrator.clone())
    }

    pub fn snapshots(&self) -> SnapshotEngine {
        SnapshotEngine::new(self.store.clone(), self.orchestrator.clone())
    }

    /// Project with a ProblemSpec (given constraints) and a WorldModel.
    pub async fn seeded_project(&self, constraints: Vec<Constraint>) -> Project {
        let project = self
            .store
            .create_project("Irrigation network redesign", None)
            .await
            .expect("project");
        self.store
            .upsert_problem_spec(
                &project.id,
                ProblemSpecUpdate {
                    constraints,
                    goals: vec!["maximize crop yield".to_string()],
                    resolution: ResolutionLevel::Medium,
                    mode: RunMode::FullSearch,
                    provenance_log: None,
                },
            )
            .await
            .expect("problem spec");
        self.store
            .upsert_world_model(
                &project.id,
                json!({
                    "actors": [{"id": "farmers", "name": "Farmers"}],
                    "mechanisms": [{"id": "canal", "name": "Canal network"}],
                    "resources": [{"id": "water", "name": "Water"}],
                    "constraints": [],
                    "assumptions": [],
                    "simplifications": [],
                    "provenance": [],
                }),
            )
            .await
            .expect("world model");
        project
    }
}

pub fn soft_constraint(name: &str, weight: u32) -> Constraint {
    Constraint {
        name: name.to_string(),
        description: format!("{name} constraint"),
        weight,
    }
}

/// Designer that emits the requested number of candidates, numbered from 1,
/// with 0.9 compliance estimates for every spec constraint.
pub fn scripted_designer() -> ScriptedAgent {
    ScriptedAgent::new(agent_names::DESIGNER, |task| {
        let count = task["num_candidates"].as_u64().unwrap_or(1);
        let constraint_names: Vec<String> = task["problem_spec"]["constraints"]
            .as_array()
            .map(|constraints| {
                constraints
                    .iter()
                    .filter_map(|c| c["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let compliance: Value = constraint_names
            .iter()
            .map(|name| (name.clone(), json!(0.9)))
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let candidates: Vec<Value> = (1..=count)
            .map(|index| {
                json!({
                    "mechanism_description": format!("Mechanism {index}"),
                    "predicted_effects": {
                        "actors_affected": [],
                        "resources_impacted": [],
                        "mechanisms_modified": [],
                    },
                    "constraint_compliance": compliance,
                    "reasoning": format!("Distinct approach {index}"),
                })
            })
            .collect();
        Ok(json!({"candidates": candidates, "reasoning": "diverse mechanisms"}).to_string())
    })
}

/// Scenario generator emitting `scenario-<n>` ids with mixed types.
pub fn scripted_scenario_generator() -> ScriptedAgent {
    ScriptedAgent::new(agent_names::SCENARIO_GENERATOR, |task| {
        let count = task["num_scenarios"].as_u64().unwrap_or(1);
        let types = ["stress_test", "edge_case", "normal_operation", "failure_mode"];
        let scenarios: Vec<Value> = (1..=count)
            .map(|index| {
                json!({
                    "id": format!("scenario-{index}"),
                    "name": format!("Scenario {index}"),
                    "description": "generated",
                    "type": types[(index as usize - 1) % types.len()],
                    "focus": "coverage",
                    "initial_state": {"supply": "normal"},
                    "events": [],
                    "expected_outcomes": {},
                    "weight": 0.5,
                })
            })
            .collect();
        Ok(json!({"scenarios": scenarios, "reasoning": "covering the phase space"}).to_string())
    })
}

/// Candidate index parsed from `Mechanism <n>` descriptions; 0 when absent.
pub fn candidate_index(task: &Value) -> u64 {
    task["candidate"]["mechanism_description"]
        .as_str()
        .and_then(|description| description.rsplit(' ').next())
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0)
}

/// Evaluator returning fixed P/R per candidate index and satisfying every
/// spec constraint.
pub fn scripted_evaluator<F>(scores: F) -> ScriptedAgent
where
    F: Fn(u64) -> (f64, f64) + Send + Sync + 'static,
{
    ScriptedAgent::new(agent_names::EVALUATOR, move |task| {
        let (p, r) = scores(candidate_index(task));
        let satisfaction: serde_json::Map<String, Value> = task["problem_spec"]["constraints"]
            .as_array()
            .map(|constraints| {
                constraints
                    .iter()
                    .filter_map(|c| c["name"].as_str())
                    .map(|name| {
                        (
                            name.to_string(),
                            json!({"satisfied": true, "score": 0.9, "explanation": "holds in this scenario"}),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({
            "P": {"overall": p},
            "R": {"overall": r},
            "constraint_satisfaction": satisfaction,
            "explanation": "scripted evaluation",
        })
        .to_string())
    })
}

/// Registry with a designer, scenario generator and the given evaluator.
pub fn registry_with_evaluator(evaluator: ScriptedAgent) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(scripted_designer()));
    registry.register(Arc::new(scripted_scenario_generator()));
    registry.register(Arc::new(evaluator));
    registry
}

/// Everyone scores P=0.9, R=0.5.
pub fn default_registry() -> AgentRegistry {
    registry_with_evaluator(scripted_evaluator(|_| (0.9, 0.5)))
}
