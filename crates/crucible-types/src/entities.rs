use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::provenance::ProvenanceEntry;
use crate::run_contracts::RunTriggerSource;
use crate::scores::{CandidateScores, ConstraintVerdict, MetricScore};
use crate::snapshot::SnapshotInvariant;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSessionMode {
    Setup,
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    System,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionLevel {
    Coarse,
    Medium,
    Fine,
}

impl Default for ResolutionLevel {
    fn default() -> Self {
        ResolutionLevel::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    FullSearch,
    EvalOnly,
    Seeded,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::FullSearch => "full_search",
            RunMode::EvalOnly => "eval_only",
            RunMode::Seeded => "seeded",
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::FullSearch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    New,
    UnderTest,
    Promising,
    Weak,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateStatus::New => "new",
            CandidateStatus::UnderTest => "under_test",
            CandidateStatus::Promising => "promising",
            CandidateStatus::Weak => "weak",
            CandidateStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Model,
    Constraint,
    Evaluator,
    Scenario,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Model => "model",
            IssueType::Constraint => "constraint",
            IssueType::Evaluator => "evaluator",
            IssueType::Scenario => "scenario",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Minor,
    Important,
    Catastrophic,
}

impl IssueSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueSeverity::Minor => "minor",
            IssueSeverity::Important => "important",
            IssueSeverity::Catastrophic => "catastrophic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueResolutionStatus {
    Open,
    Resolved,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    StressTest,
    EdgeCase,
    NormalOperation,
    FailureMode,
}

/// Top-level container for a problem domain and all related work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(title: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A named constraint with a weight in [0, 100]; weight 100 marks a hard
/// constraint whose violation forces candidate rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub weight: u32,
}

impl Constraint {
    pub fn is_hard(&self) -> bool {
        self.weight >= 100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub resolution: ResolutionLevel,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub provenance_log: Vec<ProvenanceEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProblemSpec {
    pub fn new(project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_id: project_id.into(),
            constraints: Vec::new(),
            goals: Vec::new(),
            resolution: ResolutionLevel::default(),
            mode: RunMode::default(),
            provenance_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn constraint_weights(&self) -> BTreeMap<String, u32> {
        self.constraints
            .iter()
            .map(|c| (c.name.clone(), c.weight))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldModel {
    pub id: String,
    pub project_id: String,
    pub model_data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorldModel {
    pub fn new(project_id: impl Into<String>, model_data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_id: project_id.into(),
            model_data,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Recognized run configuration options; unrecognized keys are carried
/// through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_candidates: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_scenarios: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_s: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub mode: RunMode,
    #[serde(default)]
    pub config: RunConfig,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_config_snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_trigger_source: Option<RunTriggerSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_trigger_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_summary_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(project_id: impl Into<String>, mode: RunMode, config: RunConfig) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_id: project_id.into(),
            mode,
            config,
            status: RunStatus::Created,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            candidate_count: None,
            scenario_count: None,
            evaluation_count: None,
            metrics: None,
            llm_usage: None,
            error_summary: None,
            chat_session_id: None,
            recommended_config_snapshot: None,
            ui_trigger_id: None,
            ui_trigger_source: None,
            ui_trigger_metadata: None,
            ui_triggered_at: None,
            run_summary_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub run_id: String,
    pub project_id: String,
    pub origin: CandidateOrigin,
    pub mechanism_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_effects: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<CandidateScores>,
    pub status: CandidateStatus,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub provenance_log: Vec<ProvenanceEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub scenario_type: ScenarioType,
    #[serde(default)]
    pub focus: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcomes: Option<Value>,
    #[serde(default = "default_scenario_weight")]
    pub weight: f64,
}

fn default_scenario_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSuite {
    pub id: String,
    pub run_id: String,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub candidate_id: String,
    pub run_id: String,
    pub scenario_id: String,
    #[serde(rename = "P")]
    pub p: MetricScore,
    #[serde(rename = "R")]
    pub r: MetricScore,
    #[serde(default)]
    pub constraint_satisfaction: BTreeMap<String, ConstraintVerdict>,
    #[serde(default)]
    pub explanation: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub description: String,
    pub resolution_status: IssueResolutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub snapshot_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_metrics: Option<Value>,
    #[serde(default)]
    pub invariants: Vec<SnapshotInvariant>,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub mode: ChatSessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_config_carries_unrecognized_keys() {
        let raw = serde_json::json!({
            "num_candidates": 3,
            "seed_candidate_ids": ["c1"],
        });
        let config: RunConfig = serde_json::from_value(raw).expect("config");
        assert_eq!(config.num_candidates, Some(3));
        assert!(config.extra.contains_key("seed_candidate_ids"));
    }

    #[test]
    fn hard_constraints_require_full_weight() {
        let hard = Constraint {
            name: "safety".into(),
            description: String::new(),
            weight: 100,
        };
        let soft = Constraint {
            name: "cost".into(),
            description: String::new(),
            weight: 99,
        };
        assert!(hard.is_hard());
        assert!(!soft.is_hard());
    }

    #[test]
    fn scenario_type_uses_snake_case_wire_names() {
        let scenario: Scenario = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "type": "stress_test",
        }))
        .expect("scenario");
        assert_eq!(scenario.scenario_type, ScenarioType::StressTest);
        assert_eq!(scenario.weight, 1.0);
    }
}
