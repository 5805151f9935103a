use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crucible_store::{IssueUpdate, NewIssue, ProblemSpecUpdate, Store};
use crucible_types::{
    CandidateStatus, Constraint, CrucibleError, Issue, IssueResolutionStatus, IssueSeverity,
    IssueType, ProvenanceActor, ProvenanceEntry, RemediationAction, RemediationOutcome,
    RemediationRequest, ResolutionLevel, Result, RunConfig, RunMode,
};

use crate::delta::compute_spec_delta;
use crate::merge::{deep_merge_model, push_model_provenance};
use crate::orchestrator::RunOrchestrator;

const DEFAULT_RERUN_CANDIDATES: u32 = 5;
const DEFAULT_RERUN_SCENARIOS: u32 = 8;

/// Create an issue after validating its references, and record the event in
/// the project's ProblemSpec provenance when a spec exists.
pub async fn create_issue(
    store: &Store,
    project_id: &str,
    issue_type: IssueType,
    severity: IssueSeverity,
    description: impl Into<String>,
    run_id: Option<String>,
    candidate_id: Option<String>,
) -> Result<Issue> {
    store.require_project(project_id).await?;

    if let Some(run_id) = &run_id {
        let run = store.require_run(run_id).await?;
        if run.project_id != project_id {
            return Err(CrucibleError::validation(format!(
                "Run {run_id} does not belong to project {project_id}"
            )));
        }
    }
    if let Some(candidate_id) = &candidate_id {
        let candidate = store
            .get_candidate(candidate_id)
            .await
            .ok_or_else(|| CrucibleError::not_found("Candidate", candidate_id.clone()))?;
        if candidate.project_id != project_id {
            return Err(CrucibleError::validation(format!(
                "Candidate {candidate_id} does not belong to project {project_id}"
            )));
        }
    }

    let issue = store
        .create_issue(NewIssue {
            project_id: project_id.to_string(),
            run_id: run_id.clone(),
            candidate_id: candidate_id.clone(),
            issue_type,
            severity,
            description: description.into(),
        })
        .await?;

    if store.get_problem_spec(project_id).await.is_some() {
        let entry = ProvenanceEntry::new("issue_created", ProvenanceActor::User)
            .source("issue_service:create_issue")
            .description(format!(
                "Issue created: {} - {}",
                issue.issue_type.as_str(),
                issue.severity.as_str()
            ))
            .reference_ids([issue.id.clone(), project_id.to_string()])
            .metadata(json!({
                "issue_type": issue.issue_type,
                "issue_severity": issue.severity,
                "run_id": run_id,
                "candidate_id": candidate_id,
            }));
        store
            .append_problem_spec_provenance(project_id, entry)
            .await?;
    }

    Ok(issue)
}

/// Bundle everything a feedback driver needs to reason about an issue.
pub async fn issue_context(store: &Store, issue_id: &str) -> Result<Value> {
    let issue = store.require_issue(issue_id).await?;

    let mut context = json!({
        "issue": issue,
        "project": Value::Null,
        "problem_spec": Value::Null,
        "world_model": Value::Null,
        "run": Value::Null,
        "candidate": Value::Null,
        "evaluations": Value::Null,
    });

    if let Some(project) = store.get_project(&issue.project_id).await {
        context["project"] = json!({
            "id": project.id,
            "title": project.title,
            "description": project.description,
        });
    }
    if let Some(spec) = store.get_problem_spec(&issue.project_id).await {
        context["problem_spec"] = json!({
            "id": spec.id,
            "constraints": spec.constraints,
            "goals": spec.goals,
            "resolution": spec.resolution,
            "mode": spec.mode,
        });
    }
    if let Some(model) = store.get_world_model(&issue.project_id).await {
        context["world_model"] = json!({
            "id": model.id,
            "model_data": model.model_data,
        });
    }
    if let Some(run_id) = &issue.run_id {
        if let Some(run) = store.get_run(run_id).await {
            context["run"] = json!({
                "id": run.id,
                "mode": run.mode,
                "status": run.status,
                "candidate_count": run.candidate_count,
                "scenario_count": run.scenario_count,
            });
        }
    }
    if let Some(candidate_id) = &issue.candidate_id {
        if let Some(candidate) = store.get_candidate(candidate_id).await {
            context["candidate"] = json!({
                "id": candidate.id,
                "origin": candidate.origin,
                "mechanism_description": candidate.mechanism_description,
                "scores": candidate.scores,
                "status": candidate.status,
            });
            let evaluations = store
                .list_evaluations(Some(candidate_id), issue.run_id.as_deref())
                .await;
            if !evaluations.is_empty() {
                context["evaluations"] = json!(evaluations);
            }
        }
    }

    Ok(context)
}

/// Validated patch content for a ProblemSpec, built before any write.
struct SpecPatchPlan {
    update: ProblemSpecUpdate,
    touched_sections: Vec<String>,
}

/// Maps issues to remediation actions and re-executes the matching pipeline
/// subset. Severity picks a default action; rescore-style actions on an
/// issue with no run auto-upgrade to a full rerun.
#[derive(Clone)]
pub struct RemediationEngine {
    store: Arc<Store>,
    orchestrator: RunOrchestrator,
}

impl RemediationEngine {
    pub fn new(store: Arc<Store>, orchestrator: RunOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    pub async fn resolve(
        &self,
        issue_id: &str,
        request: RemediationRequest,
        cancel: &CancellationToken,
    ) -> Result<RemediationOutcome> {
        let issue = self.store.require_issue(issue_id).await?;

        let requested = request.action.unwrap_or_else(|| {
            RemediationAction::default_for(issue.severity, !request.candidate_ids.is_empty())
        });
        let (action, action_upgraded, original) =
            if requested.requires_run() && issue.run_id.is_none() {
                (RemediationAction::FullRerun, true, Some(requested))
            } else {
                (requested, false, None)
            };

        let mut outcome = RemediationOutcome {
            status: "success".to_string(),
            action,
            action_upgraded,
            original_remediation_action: original,
            issue_id: issue_id.to_string(),
            patches_applied: Vec::new(),
            new_run_id: None,
            invalidated_candidates: Vec::new(),
            message: if action_upgraded {
                format!(
                    "Remediation action auto-upgraded to {action} because the issue has no associated run."
                )
            } else {
                format!("Remediation action {action} completed.")
            },
        };

        match action {
            RemediationAction::PatchAndRescore => {
                if issue.severity != IssueSeverity::Minor {
                    warn!(
                        issue_id,
                        severity = issue.severity.as_str(),
                        "patch_and_rescore is typically for minor issues"
                    );
                }
                outcome.patches_applied = self
                    .apply_patches(&issue, request.patch.as_ref(), "remediation:patch_and_rescore")
                    .await?;
                let run_id = issue.run_id.clone().ok_or_else(|| {
                    CrucibleError::precondition(format!(
                        "Issue {issue_id} has no associated run_id for rescoring"
                    ))
                })?;
                self.orchestrator
                    .execute_evaluate_and_rank_phase(&run_id, cancel)
                    .await?;
                self.record_rerun(
                    &issue,
                    action,
                    &outcome.patches_applied,
                    &run_id,
                    format!("Re-scored run {run_id} after patch"),
                )
                .await;
            }
            RemediationAction::PartialRerun => {
                outcome.patches_applied = self
                    .apply_patches(&issue, request.patch.as_ref(), "remediation:partial_rerun")
                    .await?;
                let run_id = issue.run_id.clone().ok_or_else(|| {
                    CrucibleError::precondition(format!(
                        "Issue {issue_id} has no associated run_id for partial rerun"
                    ))
                })?;
                self.orchestrator
                    .execute_evaluate_and_rank_phase(&run_id, cancel)
                    .await?;
                self.record_rerun(
                    &issue,
                    action,
                    &outcome.patches_applied,
                    &run_id,
                    format!("Partial rerun executed for run {run_id}"),
                )
                .await;
            }
            RemediationAction::FullRerun => {
                outcome.patches_applied = self
                    .apply_patches(&issue, request.patch.as_ref(), "remediation:full_rerun")
                    .await?;
                let (mode, config) = rerun_config(request.run_config.as_ref())?;
                let num_candidates = config.num_candidates.unwrap_or(DEFAULT_RERUN_CANDIDATES);
                let num_scenarios = config.num_scenarios.unwrap_or(DEFAULT_RERUN_SCENARIOS);
                let new_run = self
                    .store
                    .create_run(&issue.project_id, mode, config, None)
                    .await?;
                self.orchestrator
                    .execute_full_pipeline(&new_run.id, num_candidates, num_scenarios, cancel)
                    .await?;
                self.record_rerun(
                    &issue,
                    action,
                    &outcome.patches_applied,
                    &new_run.id,
                    format!("Full rerun executed due to issue {issue_id}"),
                )
                .await;
                outcome.new_run_id = Some(new_run.id);
            }
            RemediationAction::InvalidateCandidates => {
                outcome.invalidated_candidates = self
                    .invalidate_candidates(
                        &issue,
                        &request.candidate_ids,
                        request.reason.as_deref(),
                    )
                    .await?;
            }
        }

        self.record_dispatch(&issue, requested, action, action_upgraded)
            .await;
        self.store
            .update_issue(
                issue_id,
                IssueUpdate {
                    description: None,
                    resolution_status: Some(IssueResolutionStatus::Resolved),
                    resolved_at: Some(Utc::now()),
                },
            )
            .await?;

        info!(
            issue_id,
            action = action.as_str(),
            upgraded = action_upgraded,
            "remediation completed"
        );
        Ok(outcome)
    }

    /// The driver's intent survives in provenance even when the executed
    /// action differs from the requested one.
    async fn record_dispatch(
        &self,
        issue: &Issue,
        requested: RemediationAction,
        executed: RemediationAction,
        upgraded: bool,
    ) {
        if self.store.get_problem_spec(&issue.project_id).await.is_none() {
            return;
        }
        let entry = ProvenanceEntry::new("remediation", ProvenanceActor::User)
            .source(format!("issue:{}", issue.id))
            .description(format!("Remediation dispatched for issue {}", issue.id))
            .reference_ids([issue.id.clone(), issue.project_id.clone()])
            .metadata(json!({
                "requested_action": requested,
                "executed_action": executed,
                "action_upgraded": upgraded,
            }));
        if let Err(err) = self
            .store
            .append_problem_spec_provenance(&issue.project_id, entry)
            .await
        {
            warn!(issue_id = %issue.id, error = %err, "failed to record remediation dispatch");
        }
    }

    async fn record_rerun(
        &self,
        issue: &Issue,
        action: RemediationAction,
        patches_applied: &[String],
        run_id: &str,
        description: String,
    ) {
        if self.store.get_problem_spec(&issue.project_id).await.is_none() {
            return;
        }
        let entry = ProvenanceEntry::new("feedback_patch", ProvenanceActor::System)
            .source(format!("remediation:{}", action.as_str()))
            .description(description)
            .reference_ids([issue.id.clone(), run_id.to_string()])
            .metadata(json!({
                "action": action,
                "patches_applied": patches_applied,
            }));
        if let Err(err) = self
            .store
            .append_problem_spec_provenance(&issue.project_id, entry)
            .await
        {
            warn!(issue_id = %issue.id, error = %err, "failed to record rerun provenance");
        }
    }

    /// Validate and apply `patch.problem_spec` and `patch.world_model`.
    /// All validation happens before the first write, so a bad patch leaves
    /// no state behind.
    async fn apply_patches(
        &self,
        issue: &Issue,
        patch: Option<&Value>,
        source: &str,
    ) -> Result<Vec<String>> {
        let Some(patch) = patch else {
            return Ok(Vec::new());
        };

        let current_spec = self.store.get_problem_spec(&issue.project_id).await;
        let spec_plan = match (patch.get("problem_spec"), &current_spec) {
            (Some(spec_patch), Some(current)) => Some(plan_spec_patch(current, spec_patch)?),
            _ => None,
        };

        let current_model = self.store.get_world_model(&issue.project_id).await;

        let mut patches_applied = Vec::new();

        if let Some(plan) = spec_plan {
            let spec_patch = patch.get("problem_spec").cloned().unwrap_or(Value::Null);
            self.store
                .upsert_problem_spec(&issue.project_id, plan.update)
                .await?;
            let entry = ProvenanceEntry::new("feedback_patch", ProvenanceActor::System)
                .source(source)
                .description(format!("ProblemSpec patched due to issue {}", issue.id))
                .reference_ids([issue.id.clone(), issue.project_id.clone()])
                .metadata(json!({
                    "patch_type": "problem_spec",
                    "updates": spec_patch,
                    "touched_sections": plan.touched_sections,
                }));
            self.store
                .append_problem_spec_provenance(&issue.project_id, entry)
                .await?;
            patches_applied.push("problem_spec".to_string());
        }

        if let (Some(model_patch), Some(model)) = (patch.get("world_model"), current_model) {
            let mut merged = deep_merge_model(&model.model_data, model_patch);
            let entry = ProvenanceEntry::new("feedback_patch", ProvenanceActor::System)
                .source(source)
                .description(format!("WorldModel patched due to issue {}", issue.id))
                .reference_ids([issue.id.clone(), issue.project_id.clone()])
                .metadata(json!({
                    "patch_type": "world_model",
                    "updates": model_patch,
                }));
            push_model_provenance(&mut merged, json!(entry));
            self.store
                .upsert_world_model(&issue.project_id, merged)
                .await?;
            patches_applied.push("world_model".to_string());
        }

        Ok(patches_applied)
    }

    async fn invalidate_candidates(
        &self,
        issue: &Issue,
        candidate_ids: &[String],
        reason: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut invalidated = Vec::new();
        for candidate_id in candidate_ids {
            let Some(candidate) = self.store.get_candidate(candidate_id).await else {
                warn!(candidate_id, "candidate not found, skipping invalidation");
                continue;
            };
            if candidate.project_id != issue.project_id {
                warn!(
                    candidate_id,
                    project_id = %issue.project_id,
                    "candidate does not belong to the issue's project, skipping"
                );
                continue;
            }

            self.store
                .update_candidate_status(candidate_id, CandidateStatus::Rejected)
                .await?;
            let entry = ProvenanceEntry::new("feedback_patch", ProvenanceActor::System)
                .source("remediation:invalidate_candidates")
                .description(format!(
                    "Candidate invalidated due to issue {}: {}",
                    issue.id,
                    reason.unwrap_or("Catastrophic issue")
                ))
                .reference_ids([issue.id.clone(), candidate_id.clone()])
                .metadata(json!({"reason": reason, "issue_id": issue.id}));
            self.store
                .append_candidate_provenance(candidate_id, entry)
                .await?;
            invalidated.push(candidate_id.clone());
        }
        Ok(invalidated)
    }
}

/// Validate a ProblemSpec patch and produce the full replacement content.
/// Fields present in the patch replace the current value; invalid enum
/// values reject the whole patch.
fn plan_spec_patch(current: &crucible_types::ProblemSpec, patch: &Value) -> Result<SpecPatchPlan> {
    let constraints = match patch.get("constraints") {
        Some(raw) => serde_json::from_value::<Vec<Constraint>>(raw.clone())
            .map_err(|err| CrucibleError::validation(format!("Invalid constraints: {err}")))?,
        None => current.constraints.clone(),
    };
    let goals = match patch.get("goals") {
        Some(raw) => serde_json::from_value::<Vec<String>>(raw.clone())
            .map_err(|err| CrucibleError::validation(format!("Invalid goals: {err}")))?,
        None => current.goals.clone(),
    };
    let resolution = match patch.get("resolution") {
        Some(raw) => serde_json::from_value::<ResolutionLevel>(raw.clone()).map_err(|_| {
            CrucibleError::validation(format!("Invalid resolution: {raw}"))
        })?,
        None => current.resolution,
    };
    let mode = match patch.get("mode") {
        Some(raw) => serde_json::from_value::<RunMode>(raw.clone())
            .map_err(|_| CrucibleError::validation(format!("Invalid mode: {raw}")))?,
        None => current.mode,
    };

    let mut updated = current.clone();
    updated.constraints = constraints.clone();
    updated.goals = goals.clone();
    updated.resolution = resolution;
    updated.mode = mode;
    let delta = compute_spec_delta(Some(current), &updated);

    Ok(SpecPatchPlan {
        update: ProblemSpecUpdate {
            constraints,
            goals,
            resolution,
            mode,
            provenance_log: None,
        },
        touched_sections: delta.touched_sections,
    })
}

/// Parse the caller-supplied run config for a full rerun; unrecognized keys
/// ride along in `config.extra`.
fn rerun_config(raw: Option<&Value>) -> Result<(RunMode, RunConfig)> {
    let Some(raw) = raw else {
        return Ok((RunMode::FullSearch, RunConfig::default()));
    };
    let mode = match raw.get("mode") {
        Some(mode_raw) => serde_json::from_value::<RunMode>(mode_raw.clone())
            .map_err(|_| CrucibleError::validation(format!("Invalid mode: {mode_raw}")))?,
        None => RunMode::FullSearch,
    };
    let mut config_raw = raw.clone();
    if let Some(object) = config_raw.as_object_mut() {
        object.remove("mode");
    }
    let config = serde_json::from_value::<RunConfig>(config_raw)
        .map_err(|err| CrucibleError::validation(format!("Invalid run config: {err}")))?;
    Ok((mode, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_types::ProblemSpec;
    use serde_json::json;

    fn current_spec() -> ProblemSpec {
        let mut spec = ProblemSpec::new("project");
        spec.constraints = vec![Constraint {
            name: "safety".into(),
            description: "no harm".into(),
            weight: 100,
        }];
        spec.goals = vec!["g0".into()];
        spec
    }

    #[test]
    fn spec_patch_replaces_only_provided_fields() {
        let current = current_spec();
        let plan =
            plan_spec_patch(&current, &json!({"goals": ["g1", "g2"]})).expect("plan");
        assert_eq!(plan.update.goals, vec!["g1", "g2"]);
        assert_eq!(plan.update.constraints.len(), 1);
        assert_eq!(plan.update.resolution, current.resolution);
        assert_eq!(plan.touched_sections, vec!["goals"]);
    }

    #[test]
    fn invalid_enum_values_reject_the_patch() {
        let current = current_spec();
        let err = plan_spec_patch(&current, &json!({"resolution": "ultra"}))
            .err()
            .expect("error");
        assert!(matches!(err, CrucibleError::Validation(_)));
        let err = plan_spec_patch(&current, &json!({"mode": "chaos"}))
            .err()
            .expect("error");
        assert!(err.to_string().contains("Invalid mode"));
    }

    #[test]
    fn rerun_config_defaults_and_passthrough() {
        let (mode, config) = rerun_config(None).expect("defaults");
        assert_eq!(mode, RunMode::FullSearch);
        assert!(config.num_candidates.is_none());

        let raw = json!({"mode": "seeded", "num_candidates": 3, "seed_candidate_ids": ["c1"]});
        let (mode, config) = rerun_config(Some(&raw)).expect("parsed");
        assert_eq!(mode, RunMode::Seeded);
        assert_eq!(config.num_candidates, Some(3));
        assert!(config.extra.contains_key("seed_candidate_ids"));
    }
}
