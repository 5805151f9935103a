use crucible_store::Store;
use crucible_types::{
    NormalizedRunConfig, RunBlockerCode, RunConfig, RunMode, RunPreflightResult, RunPrerequisites,
    RunWarningCode,
};

const MIN_COUNT: u32 = 1;
const MAX_COUNT: u32 = 50;
const LARGE_COUNT: u32 = 20;

fn clamp_count(value: Option<u32>, default: u32) -> u32 {
    value.unwrap_or(default).clamp(MIN_COUNT, MAX_COUNT)
}

/// Non-mutating readiness check for a prospective run.
pub async fn run_preflight(
    store: &Store,
    project_id: &str,
    mode: RunMode,
    parameters: &RunConfig,
) -> RunPreflightResult {
    let _ = mode;
    let normalized_config = NormalizedRunConfig {
        num_candidates: clamp_count(parameters.num_candidates, 5),
        num_scenarios: clamp_count(parameters.num_scenarios, 8),
        budget_tokens: parameters.budget_tokens,
        budget_usd: parameters.budget_usd,
        max_runtime_s: parameters.max_runtime_s,
    };

    let prerequisites = RunPrerequisites {
        problem_spec: store.get_problem_spec(project_id).await.is_some(),
        world_model: store.get_world_model(project_id).await.is_some(),
    };

    let mut blockers = Vec::new();
    if !prerequisites.problem_spec {
        blockers.push(RunBlockerCode::MissingProblemSpec);
    }
    if !prerequisites.world_model {
        blockers.push(RunBlockerCode::MissingWorldModel);
    }

    let mut warnings = Vec::new();
    if normalized_config.num_candidates > LARGE_COUNT
        || normalized_config.num_scenarios > LARGE_COUNT
    {
        warnings.push(RunWarningCode::LargeCandidateCount);
    }

    RunPreflightResult {
        ready: blockers.is_empty(),
        blockers,
        warnings,
        normalized_config,
        prerequisites,
        notes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_store::ProblemSpecUpdate;
    use crucible_types::ResolutionLevel;

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path()).await.expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn missing_artifacts_block_the_run() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let result = run_preflight(
            &store,
            &project.id,
            RunMode::FullSearch,
            &RunConfig::default(),
        )
        .await;
        assert!(!result.ready);
        assert!(result.blockers.contains(&RunBlockerCode::MissingProblemSpec));
        assert!(result.blockers.contains(&RunBlockerCode::MissingWorldModel));
        assert!(!result.prerequisites.problem_spec);
    }

    #[tokio::test]
    async fn parameters_are_clamped_into_range() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let params = RunConfig {
            num_candidates: Some(500),
            num_scenarios: Some(0),
            budget_usd: Some(2.5),
            ..RunConfig::default()
        };
        let result = run_preflight(&store, &project.id, RunMode::FullSearch, &params).await;
        assert_eq!(result.normalized_config.num_candidates, 50);
        assert_eq!(result.normalized_config.num_scenarios, 1);
        assert_eq!(result.normalized_config.budget_usd, Some(2.5));
        assert!(result
            .warnings
            .contains(&RunWarningCode::LargeCandidateCount));
    }

    #[tokio::test]
    async fn ready_once_both_prerequisites_exist() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        store
            .upsert_problem_spec(
                &project.id,
                ProblemSpecUpdate {
                    resolution: ResolutionLevel::Medium,
                    ..ProblemSpecUpdate::default()
                },
            )
            .await
            .expect("spec");
        store
            .upsert_world_model(&project.id, serde_json::json!({"actors": []}))
            .await
            .expect("model");

        let result = run_preflight(
            &store,
            &project.id,
            RunMode::FullSearch,
            &RunConfig::default(),
        )
        .await;
        assert!(result.ready);
        assert!(result.blockers.is_empty());
    }
}
