use serde::Serialize;

use crucible_store::Store;
use crucible_types::{Candidate, CrucibleError, Result, RunStatus};

#[derive(Debug, Clone, Serialize)]
pub struct RunCompleteness {
    pub is_complete: bool,
    pub run_status: RunStatus,
    pub has_problem_spec: bool,
    pub has_world_model: bool,
    pub candidate_count: usize,
    pub scenario_count: usize,
    pub evaluation_count: usize,
    pub expected_evaluations: usize,
    pub missing_evaluations: usize,
    pub issues: Vec<String>,
}

/// Verify that a run has all the entities a completed pipeline implies.
pub async fn verify_run_completeness(store: &Store, run_id: &str) -> Result<RunCompleteness> {
    let run = store.require_run(run_id).await?;
    let mut issues = Vec::new();

    let has_problem_spec = store.get_problem_spec(&run.project_id).await.is_some();
    let has_world_model = store.get_world_model(&run.project_id).await.is_some();
    if !has_problem_spec {
        issues.push(format!("ProblemSpec not found for project {}", run.project_id));
    }
    if !has_world_model {
        issues.push(format!("WorldModel not found for project {}", run.project_id));
    }

    let candidate_count = store.list_candidates(Some(run_id), None).await.len();
    let scenario_count = store
        .get_scenario_suite(run_id)
        .await
        .map(|suite| suite.scenarios.len())
        .unwrap_or(0);
    let evaluation_count = store.list_evaluations(None, Some(run_id)).await.len();

    let expected_evaluations = if scenario_count > 0 {
        candidate_count * scenario_count
    } else {
        0
    };
    let missing_evaluations = expected_evaluations.saturating_sub(evaluation_count);
    if missing_evaluations > 0 {
        issues.push(format!(
            "Missing {missing_evaluations} evaluations (expected {expected_evaluations}, found {evaluation_count})"
        ));
    }

    let is_complete = run.status == RunStatus::Completed
        && has_problem_spec
        && has_world_model
        && candidate_count > 0
        && scenario_count > 0
        && missing_evaluations == 0;

    if run.status != RunStatus::Completed && issues.is_empty() {
        issues.push(format!(
            "Run status is {}, expected 'completed'",
            run.status
        ));
    }

    Ok(RunCompleteness {
        is_complete,
        run_status: run.status,
        has_problem_spec,
        has_world_model,
        candidate_count,
        scenario_count,
        evaluation_count,
        expected_evaluations,
        missing_evaluations,
        issues,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunIntegrity {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub candidate_issues: Vec<String>,
    pub evaluation_issues: Vec<String>,
}

/// Cross-check ownership links between a run's entities.
pub async fn verify_data_integrity(store: &Store, run_id: &str) -> Result<RunIntegrity> {
    let run = store.require_run(run_id).await?;

    let mut issues = Vec::new();
    let mut candidate_issues = Vec::new();
    let mut evaluation_issues = Vec::new();

    let candidates = store.list_candidates(Some(run_id), None).await;
    for candidate in &candidates {
        if candidate.project_id != run.project_id {
            candidate_issues.push(format!(
                "Candidate {} has incorrect project_id: {}",
                candidate.id, candidate.project_id
            ));
        }
    }

    let candidate_ids: std::collections::HashSet<&str> =
        candidates.iter().map(|c| c.id.as_str()).collect();
    for evaluation in store.list_evaluations(None, Some(run_id)).await {
        if !candidate_ids.contains(evaluation.candidate_id.as_str()) {
            evaluation_issues.push(format!(
                "Evaluation {} references non-existent candidate: {}",
                evaluation.id, evaluation.candidate_id
            ));
        }
    }

    if let Some(suite) = store.get_scenario_suite(run_id).await {
        if suite.run_id != run_id {
            issues.push(format!(
                "ScenarioSuite {} has incorrect run_id: {}",
                suite.id, suite.run_id
            ));
        }
    }

    let is_valid = issues.is_empty() && candidate_issues.is_empty() && evaluation_issues.is_empty();
    Ok(RunIntegrity {
        is_valid,
        issues,
        candidate_issues,
        evaluation_issues,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub run_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub duration_seconds: Option<f64>,
    pub candidate_count: usize,
    pub scenario_count: usize,
    pub evaluation_count: usize,
    pub has_rankings: bool,
}

pub async fn get_run_statistics(store: &Store, run_id: &str) -> Result<RunStatistics> {
    let run = store
        .get_run(run_id)
        .await
        .ok_or_else(|| CrucibleError::not_found("Run", run_id))?;

    let candidates = store.list_candidates(Some(run_id), None).await;
    let scenario_count = store
        .get_scenario_suite(run_id)
        .await
        .map(|suite| suite.scenarios.len())
        .unwrap_or(0);
    let evaluation_count = store.list_evaluations(None, Some(run_id)).await.len();

    let has_rankings = candidates.iter().any(|c| c.scores.is_some());
    let duration_seconds = match (run.started_at, run.completed_at) {
        (Some(started), Some(completed)) => {
            Some((completed - started).num_milliseconds() as f64 / 1000.0)
        }
        _ => None,
    };

    Ok(RunStatistics {
        run_id: run.id,
        project_id: run.project_id,
        status: run.status,
        duration_seconds,
        candidate_count: candidates.len(),
        scenario_count,
        evaluation_count,
        has_rankings,
    })
}

/// Highest I score across a run's candidates, if any candidate was ranked.
pub fn top_i_score(candidates: &[Candidate]) -> Option<f64> {
    candidates
        .iter()
        .filter_map(|c| c.scores.as_ref().and_then(|s| s.i))
        .fold(None, |best, i| match best {
            Some(current) if current >= i => Some(current),
            _ => Some(i),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_types::{CandidateOrigin, CandidateScores, CandidateStatus};

    fn candidate(i: Option<f64>) -> Candidate {
        let now = chrono::Utc::now();
        Candidate {
            id: "c".into(),
            run_id: "r".into(),
            project_id: "p".into(),
            origin: CandidateOrigin::System,
            mechanism_description: String::new(),
            predicted_effects: None,
            scores: i.map(|i| CandidateScores {
                i: Some(i),
                ..CandidateScores::default()
            }),
            status: CandidateStatus::New,
            parent_ids: Vec::new(),
            provenance_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn top_i_score_is_the_maximum() {
        let candidates = vec![candidate(Some(0.6)), candidate(Some(1.8)), candidate(None)];
        assert_eq!(top_i_score(&candidates), Some(1.8));
    }

    #[test]
    fn top_i_score_is_none_without_ranked_candidates() {
        let candidates = vec![candidate(None)];
        assert_eq!(top_i_score(&candidates), None);
        assert_eq!(top_i_score(&[]), None);
    }
}
