use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInvariant {
    #[serde(rename = "type")]
    pub invariant_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl SnapshotInvariant {
    pub fn new(invariant_type: impl Into<String>, value: Value) -> Self {
        Self {
            invariant_type: invariant_type.into(),
            value: Some(value),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantStatus {
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheck {
    #[serde(rename = "type")]
    pub invariant_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    pub status: InvariantStatus,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantValidation {
    pub all_passed: bool,
    pub results: Vec<InvariantCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhases {
    Full,
    Design,
    Evaluate,
}

impl Default for ReplayPhases {
    fn default() -> Self {
        ReplayPhases::Full
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayOptions {
    #[serde(default)]
    pub reuse_project: bool,
    #[serde(default)]
    pub phases: ReplayPhases,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_candidates: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_scenarios: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub replay_run_id: String,
    pub project_id: String,
    pub status: String,
    pub results: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_snapshots: Option<usize>,
    #[serde(default)]
    pub stop_on_first_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit_usd: Option<f64>,
    #[serde(flatten)]
    pub replay: ReplayOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<f64>,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTestResult {
    pub snapshot_id: String,
    pub snapshot_name: String,
    pub status: SnapshotTestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invariants: Vec<InvariantCheck>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub metrics_delta: std::collections::BTreeMap<String, MetricDelta>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTestReport {
    pub summary: SnapshotTestSummary,
    pub results: Vec<SnapshotTestResult>,
    pub total_cost_usd: f64,
}
