use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_overall() -> f64 {
    0.5
}

fn default_verdict_satisfied() -> bool {
    true
}

fn default_verdict_score() -> f64 {
    0.5
}

/// A prediction-quality (P) or resource-cost (R) score with an overall value
/// in [0, 1] and optional free-form components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricScore {
    #[serde(default = "default_overall")]
    pub overall: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Value>,
}

impl MetricScore {
    pub fn overall(overall: f64) -> Self {
        Self {
            overall,
            components: None,
        }
    }
}

impl Default for MetricScore {
    fn default() -> Self {
        Self::overall(default_overall())
    }
}

/// Per-constraint satisfaction verdict from a single evaluation, or the
/// AND/mean aggregate across a candidate's evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintVerdict {
    #[serde(default = "default_verdict_satisfied")]
    pub satisfied: bool,
    #[serde(default = "default_verdict_score")]
    pub score: f64,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingFactors {
    #[serde(default)]
    pub top_positive_factors: Vec<String>,
    #[serde(default)]
    pub top_negative_factors: Vec<String>,
}

/// Aggregated scores persisted on a candidate.
///
/// The design phase writes only initial `constraint_satisfaction` estimates;
/// the ranking phase fills in P, R, I and the explanation fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateScores {
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub p: Option<MetricScore>,
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    pub r: Option<MetricScore>,
    #[serde(rename = "I", default, skip_serializing_if = "Option::is_none")]
    pub i: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraint_satisfaction: BTreeMap<String, ConstraintVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranking_explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranking_factors: Option<RankingFactors>,
}

impl CandidateScores {
    pub fn i_score(&self) -> f64 {
        self.i.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_round_trip_uses_upper_case_metric_keys() {
        let scores = CandidateScores {
            p: Some(MetricScore::overall(0.9)),
            r: Some(MetricScore::overall(0.5)),
            i: Some(1.8),
            ..CandidateScores::default()
        };
        let raw = serde_json::to_value(&scores).expect("serialize");
        assert_eq!(raw["P"]["overall"], 0.9);
        assert_eq!(raw["I"], 1.8);
        let back: CandidateScores = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(back.i_score(), 1.8);
    }

    #[test]
    fn constraint_verdict_defaults_to_neutral() {
        let verdict: ConstraintVerdict = serde_json::from_value(serde_json::json!({})).expect("ok");
        assert!(verdict.satisfied);
        assert_eq!(verdict.score, 0.5);
        assert!(verdict.explanation.is_empty());
    }
}
