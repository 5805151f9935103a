use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::IssueSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    PatchAndRescore,
    PartialRerun,
    FullRerun,
    InvalidateCandidates,
}

impl RemediationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RemediationAction::PatchAndRescore => "patch_and_rescore",
            RemediationAction::PartialRerun => "partial_rerun",
            RemediationAction::FullRerun => "full_rerun",
            RemediationAction::InvalidateCandidates => "invalidate_candidates",
        }
    }

    /// Default action when the caller does not pick one. Catastrophic issues
    /// that name candidates invalidate them instead of rerunning.
    pub fn default_for(severity: IssueSeverity, has_candidate_ids: bool) -> Self {
        match severity {
            IssueSeverity::Minor => RemediationAction::PatchAndRescore,
            IssueSeverity::Important => RemediationAction::PartialRerun,
            IssueSeverity::Catastrophic if has_candidate_ids => {
                RemediationAction::InvalidateCandidates
            }
            IssueSeverity::Catastrophic => RemediationAction::FullRerun,
        }
    }

    /// Rescore-style actions require the issue to reference a run.
    pub fn requires_run(self) -> bool {
        matches!(
            self,
            RemediationAction::PatchAndRescore | RemediationAction::PartialRerun
        )
    }
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationRequest {
    #[serde(
        default,
        alias = "remediation_action",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<RemediationAction>,
    #[serde(
        default,
        alias = "remediation_metadata",
        skip_serializing_if = "Option::is_none"
    )]
    pub patch: Option<Value>,
    #[serde(default)]
    pub candidate_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub status: String,
    #[serde(alias = "remediation_action")]
    pub action: RemediationAction,
    pub action_upgraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_remediation_action: Option<RemediationAction>,
    pub issue_id: String,
    #[serde(default)]
    pub patches_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_run_id: Option<String>,
    #[serde(default)]
    pub invalidated_candidates: Vec<String>,
    pub message: String,
}
