use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::Scenario;
use crate::scores::{ConstraintVerdict, MetricScore};

/// The documented fallback structure an agent contract degrades to when the
/// gateway cannot extract valid JSON from the raw response.
pub trait SafeDefault {
    fn safe_default() -> Self;
}

/// Untagged compliance estimate: designers may answer with a boolean or a
/// score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComplianceEstimate {
    Flag(bool),
    Score(f64),
}

impl ComplianceEstimate {
    pub fn satisfied(self) -> bool {
        match self {
            ComplianceEstimate::Flag(flag) => flag,
            ComplianceEstimate::Score(score) => score > 0.5,
        }
    }

    pub fn score(self) -> f64 {
        match self {
            ComplianceEstimate::Flag(true) => 1.0,
            ComplianceEstimate::Flag(false) => 0.0,
            ComplianceEstimate::Score(score) => score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProposal {
    #[serde(default)]
    pub mechanism_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_effects: Option<Value>,
    #[serde(default)]
    pub constraint_compliance: BTreeMap<String, ComplianceEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, alias = "parents")]
    pub parent_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignerResponse {
    #[serde(default)]
    pub candidates: Vec<CandidateProposal>,
    #[serde(default)]
    pub reasoning: String,
}

impl SafeDefault for DesignerResponse {
    fn safe_default() -> Self {
        Self {
            candidates: Vec::new(),
            reasoning: "Failed to parse agent response. Please try again.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioGeneratorResponse {
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub reasoning: String,
}

impl SafeDefault for ScenarioGeneratorResponse {
    fn safe_default() -> Self {
        Self {
            scenarios: Vec::new(),
            reasoning: "Failed to parse agent response. Please try again.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorResponse {
    #[serde(rename = "P", default)]
    pub p: MetricScore,
    #[serde(rename = "R", default)]
    pub r: MetricScore,
    #[serde(default)]
    pub constraint_satisfaction: BTreeMap<String, ConstraintVerdict>,
    #[serde(default)]
    pub explanation: String,
}

impl SafeDefault for EvaluatorResponse {
    fn safe_default() -> Self {
        Self {
            p: MetricScore::default(),
            r: MetricScore::default(),
            constraint_satisfaction: BTreeMap::new(),
            explanation: "Failed to parse evaluator response; neutral scores applied.".to_string(),
        }
    }
}

/// A structured change record emitted by the world-modeller agent alongside
/// the updated model. Consumed by the delta computer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldModelChange {
    #[serde(rename = "type", default)]
    pub change_type: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
}
