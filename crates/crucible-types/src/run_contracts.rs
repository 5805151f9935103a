use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTriggerSource {
    RunConfigPanel,
    ApiClient,
    IntegrationTest,
    CliTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunBlockerCode {
    MissingProblemSpec,
    MissingWorldModel,
    InsufficientCandidates,
    ValidationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunWarningCode {
    HighBudget,
    LargeCandidateCount,
    DeprecatedMode,
}

/// Parameters after preflight clamping: candidate and scenario counts land
/// in [1, 50], other numeric fields are echoed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRunConfig {
    pub num_candidates: u32,
    pub num_scenarios: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPrerequisites {
    pub problem_spec: bool,
    pub world_model: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPreflightResult {
    pub ready: bool,
    pub blockers: Vec<RunBlockerCode>,
    pub warnings: Vec<RunWarningCode>,
    pub normalized_config: NormalizedRunConfig,
    pub prerequisites: RunPrerequisites,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Top candidate summary included in post-run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummaryCandidate {
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "I", default, skip_serializing_if = "Option::is_none")]
    pub i: Option<f64>,
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub p: Option<f64>,
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    pub r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Structured payload stored in post-run summary chat messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub project_id: String,
    pub mode: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub top_candidates: Vec<RunSummaryCandidate>,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_label: Option<String>,
}
