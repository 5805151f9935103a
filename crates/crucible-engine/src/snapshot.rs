use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crucible_store::{NewSnapshot, ProblemSpecUpdate, Store};
use crucible_types::{
    ChatSessionMode, Constraint, CrucibleError, InvariantCheck, InvariantStatus,
    InvariantValidation, MetricDelta, ProvenanceEntry, ReplayOptions, ReplayOutcome, ReplayPhases,
    ResolutionLevel, Result, RunConfig, RunMode, RunStatus, Snapshot, SnapshotInvariant,
    SnapshotTestOptions, SnapshotTestReport, SnapshotTestResult, SnapshotTestStatus,
    SnapshotTestSummary,
};

use crate::orchestrator::RunOrchestrator;
use crate::verification::{get_run_statistics, top_i_score};

pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Default)]
pub struct CreateSnapshotRequest {
    pub project_id: String,
    pub run_id: Option<String>,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub invariants: Vec<SnapshotInvariant>,
    pub include_chat_context: bool,
    pub max_chat_messages: usize,
}

/// Content-addressable snapshot capture, restore, replay and invariant
/// validation against reference metrics.
#[derive(Clone)]
pub struct SnapshotEngine {
    store: Arc<Store>,
    orchestrator: RunOrchestrator,
}

impl SnapshotEngine {
    pub fn new(store: Arc<Store>, orchestrator: RunOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Freeze a project's inputs: the ProblemSpec and WorldModel are
    /// required, the originating run config and recent setup-chat context
    /// are optional extras.
    pub async fn capture_snapshot_data(
        &self,
        project_id: &str,
        run_id: Option<&str>,
        include_chat_context: bool,
        max_chat_messages: usize,
    ) -> Result<Value> {
        let spec = self.store.get_problem_spec(project_id).await.ok_or_else(|| {
            CrucibleError::precondition(format!("ProblemSpec not found for project {project_id}"))
        })?;
        let model = self.store.get_world_model(project_id).await.ok_or_else(|| {
            CrucibleError::precondition(format!("WorldModel not found for project {project_id}"))
        })?;

        let mut snapshot_data = json!({
            "version": SNAPSHOT_VERSION,
            "problem_spec": {
                "constraints": spec.constraints,
                "goals": spec.goals,
                "resolution": spec.resolution,
                "mode": spec.mode,
                "provenance_log": spec.provenance_log,
            },
            "world_model": {
                "model_data": model.model_data,
            },
        });

        if let Some(run_id) = run_id {
            if let Some(run) = self.store.get_run(run_id).await {
                snapshot_data["run_config"] = json!({
                    "mode": run.mode,
                    "config": run.config,
                });
            }
        }

        if include_chat_context {
            let sessions = self.store.list_chat_sessions(Some(project_id)).await;
            if let Some(setup) = sessions
                .iter()
                .find(|session| session.mode == ChatSessionMode::Setup)
            {
                let messages = self.store.list_messages(&setup.id).await;
                let skip = messages.len().saturating_sub(max_chat_messages);
                let context: Vec<Value> = messages
                    .into_iter()
                    .skip(skip)
                    .map(|message| {
                        json!({
                            "id": message.id,
                            "role": message.role,
                            "content": message.content,
                            "message_metadata": message.metadata,
                            "created_at": message.created_at,
                        })
                    })
                    .collect();
                snapshot_data["chat_context"] = Value::Array(context);
            }
        }

        Ok(snapshot_data)
    }

    /// Reference outputs used to detect regressions after replay.
    pub async fn capture_reference_metrics(&self, run_id: &str) -> Result<Value> {
        let run = self.store.require_run(run_id).await?;
        let candidates = self.store.list_candidates(Some(run_id), None).await;
        Ok(json!({
            "candidate_count": run.candidate_count.unwrap_or(0),
            "scenario_count": run.scenario_count.unwrap_or(0),
            "evaluation_count": run.evaluation_count.unwrap_or(0),
            "status": run.status,
            "duration_seconds": run.duration_seconds,
            "llm_usage": run.llm_usage,
            "error_summary": run.error_summary,
            "top_i_score": top_i_score(&candidates),
            "metrics": run.metrics,
        }))
    }

    /// Capture and persist a snapshot in one step.
    pub async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<Snapshot> {
        let snapshot_data = self
            .capture_snapshot_data(
                &request.project_id,
                request.run_id.as_deref(),
                request.include_chat_context,
                request.max_chat_messages,
            )
            .await?;
        let reference_metrics = match &request.run_id {
            Some(run_id) => Some(self.capture_reference_metrics(run_id).await?),
            None => None,
        };
        self.store
            .create_snapshot(NewSnapshot {
                project_id: request.project_id,
                run_id: request.run_id,
                name: request.name,
                description: request.description,
                tags: request.tags,
                snapshot_data,
                reference_metrics,
                invariants: request.invariants,
            })
            .await
    }

    /// Upsert the snapshot's ProblemSpec and WorldModel into a project.
    /// Only snapshot version "1.0" is understood; anything else is refused.
    pub async fn restore_snapshot_data(
        &self,
        project_id: &str,
        snapshot_data: &Value,
    ) -> Result<()> {
        let version = snapshot_data
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or(SNAPSHOT_VERSION);
        if version != SNAPSHOT_VERSION {
            return Err(CrucibleError::validation(format!(
                "Unsupported snapshot version: {version}"
            )));
        }

        let spec_data = snapshot_data
            .get("problem_spec")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let constraints = parse_field::<Vec<Constraint>>(&spec_data, "constraints")?;
        let goals = parse_field::<Vec<String>>(&spec_data, "goals")?;
        let resolution = parse_field::<ResolutionLevel>(&spec_data, "resolution")?;
        let mode = parse_field::<RunMode>(&spec_data, "mode")?;
        let provenance_log = parse_field::<Vec<ProvenanceEntry>>(&spec_data, "provenance_log")?;

        self.store
            .upsert_problem_spec(
                project_id,
                ProblemSpecUpdate {
                    constraints,
                    goals,
                    resolution,
                    mode,
                    provenance_log: Some(provenance_log),
                },
            )
            .await?;

        let model_data = snapshot_data
            .get("world_model")
            .and_then(|m| m.get("model_data"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        self.store.upsert_world_model(project_id, model_data).await?;

        Ok(())
    }

    /// Restore a snapshot into a project (fresh and ephemeral by default)
    /// and re-run the requested pipeline subset.
    pub async fn replay_snapshot(
        &self,
        snapshot_id: &str,
        options: ReplayOptions,
        cancel: &CancellationToken,
    ) -> Result<ReplayOutcome> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await
            .ok_or_else(|| CrucibleError::not_found("Snapshot", snapshot_id))?;

        let project_id = if options.reuse_project {
            self.store.require_project(&snapshot.project_id).await?.id
        } else {
            self.store
                .create_project(
                    format!("Snapshot Replay: {}", snapshot.name),
                    Some(format!(
                        "Temporary project for replaying snapshot {}",
                        snapshot.name
                    )),
                )
                .await?
                .id
        };

        self.restore_snapshot_data(&project_id, &snapshot.snapshot_data)
            .await?;

        let run_config = snapshot
            .snapshot_data
            .get("run_config")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let mode = match run_config.get("mode") {
            Some(raw) if !raw.is_null() => serde_json::from_value::<RunMode>(raw.clone())
                .map_err(|_| CrucibleError::validation(format!("Invalid run mode: {raw}")))?,
            _ => RunMode::FullSearch,
        };
        let mut config = match run_config.get("config") {
            Some(raw) if !raw.is_null() => serde_json::from_value::<RunConfig>(raw.clone())
                .map_err(|err| CrucibleError::validation(format!("Invalid run config: {err}")))?,
            _ => RunConfig::default(),
        };
        if let Some(num_candidates) = options.num_candidates {
            config.num_candidates = Some(num_candidates);
        }
        if let Some(num_scenarios) = options.num_scenarios {
            config.num_scenarios = Some(num_scenarios);
        }
        let num_candidates = config.num_candidates.unwrap_or(5);
        let num_scenarios = config.num_scenarios.unwrap_or(8);

        let run = self
            .store
            .create_run(&project_id, mode, config, None)
            .await?;

        info!(
            snapshot_id,
            replay_run_id = %run.id,
            phases = ?options.phases,
            "replaying snapshot"
        );

        let results = match options.phases {
            ReplayPhases::Full => self
                .orchestrator
                .execute_full_pipeline(&run.id, num_candidates, num_scenarios, cancel)
                .await
                .map(|result| serde_json::to_value(result).unwrap_or(Value::Null)),
            ReplayPhases::Design => self
                .orchestrator
                .execute_design_and_scenario_phase(&run.id, num_candidates, num_scenarios, cancel)
                .await
                .map(|result| serde_json::to_value(result).unwrap_or(Value::Null)),
            ReplayPhases::Evaluate => self
                .orchestrator
                .execute_evaluate_and_rank_phase(&run.id, cancel)
                .await
                .map(|result| serde_json::to_value(result).unwrap_or(Value::Null)),
        };

        match results {
            Ok(results) => Ok(ReplayOutcome {
                replay_run_id: run.id,
                project_id,
                status: "completed".to_string(),
                results,
            }),
            Err(err) => {
                error!(snapshot_id, run_id = %run.id, error = %err, "snapshot replay failed");
                if let Some(current) = self.store.get_run(&run.id).await {
                    if !current.status.is_terminal() {
                        let _ = self
                            .store
                            .update_run_status(&run.id, RunStatus::Failed, None, None)
                            .await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Check declarative invariants against a replayed run.
    pub async fn validate_invariants(
        &self,
        run_id: &str,
        invariants: &[SnapshotInvariant],
        reference_metrics: Option<&Value>,
    ) -> Result<InvariantValidation> {
        let _ = reference_metrics;
        let run = self.store.require_run(run_id).await?;
        let stats = get_run_statistics(&self.store, run_id).await?;
        let candidates = self.store.list_candidates(Some(run_id), None).await;
        let top_i = top_i_score(&candidates);

        let mut results = Vec::new();
        let mut all_passed = true;

        for invariant in invariants {
            let expected = invariant.value.clone();
            let mut check = InvariantCheck {
                invariant_type: invariant.invariant_type.clone(),
                description: invariant.description.clone(),
                expected: expected.clone(),
                actual: None,
                status: InvariantStatus::Error,
                message: String::new(),
            };

            let expected_number = expected.as_ref().and_then(|v| v.as_f64());
            match invariant.invariant_type.as_str() {
                "min_candidates" | "max_candidates" | "min_scenarios" | "max_scenarios" => {
                    let (actual, noun) = match invariant.invariant_type.as_str() {
                        "min_candidates" | "max_candidates" => {
                            (stats.candidate_count as f64, "candidates")
                        }
                        _ => (stats.scenario_count as f64, "scenarios"),
                    };
                    check.actual = Some(json!(actual));
                    match expected_number {
                        Some(value) => {
                            let is_min = invariant.invariant_type.starts_with("min");
                            let passed = if is_min { actual >= value } else { actual <= value };
                            if passed {
                                check.status = InvariantStatus::Passed;
                            } else {
                                check.status = InvariantStatus::Failed;
                                let bound = if is_min { "at least" } else { "at most" };
                                check.message =
                                    format!("Expected {bound} {value} {noun}, got {actual}");
                            }
                        }
                        None => check.message = "Invariant value must be a number".to_string(),
                    }
                }
                "run_status" => {
                    let actual = run.status.to_string();
                    check.actual = Some(json!(actual));
                    let expected_status =
                        expected.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
                    if actual == expected_status {
                        check.status = InvariantStatus::Passed;
                    } else {
                        check.status = InvariantStatus::Failed;
                        check.message =
                            format!("Expected status {expected_status}, got {actual}");
                    }
                }
                "min_top_i_score" | "max_top_i_score" => {
                    check.actual = top_i.map(|v| json!(v));
                    match (expected_number, top_i) {
                        (Some(value), Some(actual)) => {
                            let is_min = invariant.invariant_type.starts_with("min");
                            let passed = if is_min { actual >= value } else { actual <= value };
                            if passed {
                                check.status = InvariantStatus::Passed;
                            } else {
                                check.status = InvariantStatus::Failed;
                                let op = if is_min { ">=" } else { "<=" };
                                check.message =
                                    format!("Expected top I-score {op} {value}, got {actual}");
                            }
                        }
                        (Some(value), None) => {
                            check.status = InvariantStatus::Failed;
                            check.message =
                                format!("Expected top I-score bound {value}, but no candidate was ranked");
                        }
                        (None, _) => {
                            check.message = "Invariant value must be a number".to_string()
                        }
                    }
                }
                "no_hard_constraint_violations" => {
                    let mut violations = Vec::new();
                    for candidate in &candidates {
                        let Some(scores) = &candidate.scores else {
                            continue;
                        };
                        for (constraint_id, verdict) in &scores.constraint_satisfaction {
                            if !verdict.satisfied {
                                violations.push(format!("{}: {}", candidate.id, constraint_id));
                            }
                        }
                    }
                    check.actual = Some(json!(violations.is_empty()));
                    if violations.is_empty() {
                        check.status = InvariantStatus::Passed;
                    } else {
                        check.status = InvariantStatus::Failed;
                        check.message = format!(
                            "Found {} hard constraint violations: {}",
                            violations.len(),
                            violations
                                .iter()
                                .take(5)
                                .cloned()
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                    }
                }
                "max_duration_seconds" => {
                    check.actual = run.duration_seconds.map(|v| json!(v));
                    match (expected_number, run.duration_seconds) {
                        (Some(value), Some(actual)) => {
                            if actual <= value {
                                check.status = InvariantStatus::Passed;
                            } else {
                                check.status = InvariantStatus::Failed;
                                check.message =
                                    format!("Expected duration <= {value}s, got {actual}s");
                            }
                        }
                        (Some(value), None) => {
                            check.status = InvariantStatus::Failed;
                            check.message =
                                format!("Expected duration <= {value}s, but none was recorded");
                        }
                        (None, _) => {
                            check.message = "Invariant value must be a number".to_string()
                        }
                    }
                }
                "min_evaluation_coverage" => {
                    let denominator = stats.candidate_count * stats.scenario_count;
                    let coverage = if denominator == 0 {
                        1.0
                    } else {
                        stats.evaluation_count as f64 / denominator as f64
                    };
                    check.actual = Some(json!(coverage));
                    match expected_number {
                        Some(value) => {
                            if coverage >= value {
                                check.status = InvariantStatus::Passed;
                            } else {
                                check.status = InvariantStatus::Failed;
                                check.message = format!(
                                    "Expected evaluation coverage >= {value}, got {coverage:.2}"
                                );
                            }
                        }
                        None => check.message = "Invariant value must be a number".to_string(),
                    }
                }
                other => {
                    check.message = format!("Unknown invariant type: {other}");
                }
            }

            if check.status != InvariantStatus::Passed {
                all_passed = false;
            }
            results.push(check);
        }

        Ok(InvariantValidation {
            all_passed,
            results,
        })
    }

    /// Replay each snapshot, validate its declared invariants and compare
    /// replay metrics against the stored reference metrics.
    pub async fn run_snapshot_tests(
        &self,
        snapshot_ids: Option<Vec<String>>,
        options: SnapshotTestOptions,
        cancel: &CancellationToken,
    ) -> Result<SnapshotTestReport> {
        let mut snapshot_ids = match snapshot_ids {
            Some(ids) => ids,
            None => self
                .store
                .list_snapshots()
                .await
                .into_iter()
                .map(|s| s.id)
                .collect(),
        };
        if let Some(max) = options.max_snapshots {
            snapshot_ids.truncate(max);
        }

        let mut results = Vec::new();
        let mut total_cost_usd = 0.0;
        let mut passed = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;

        for snapshot_id in &snapshot_ids {
            let Some(snapshot) = self.store.get_snapshot(snapshot_id).await else {
                skipped += 1;
                results.push(SnapshotTestResult {
                    snapshot_id: snapshot_id.clone(),
                    snapshot_name: "Unknown".to_string(),
                    status: SnapshotTestStatus::Skipped,
                    replay_run_id: None,
                    invariants: Vec::new(),
                    metrics_delta: BTreeMap::new(),
                    cost_usd: 0.0,
                    message: Some("Snapshot not found".to_string()),
                });
                continue;
            };

            if let Some(limit) = options.cost_limit_usd {
                if total_cost_usd >= limit {
                    skipped += 1;
                    results.push(SnapshotTestResult {
                        snapshot_id: snapshot_id.clone(),
                        snapshot_name: snapshot.name.clone(),
                        status: SnapshotTestStatus::Skipped,
                        replay_run_id: None,
                        invariants: Vec::new(),
                        metrics_delta: BTreeMap::new(),
                        cost_usd: 0.0,
                        message: Some(format!("Cost limit ({limit}) exceeded")),
                    });
                    continue;
                }
            }

            match self
                .replay_snapshot(snapshot_id, options.replay.clone(), cancel)
                .await
            {
                Ok(replay) => {
                    let replay_run = self.store.get_run(&replay.replay_run_id).await;
                    let cost_usd = replay_run
                        .as_ref()
                        .and_then(|run| run.llm_usage.as_ref())
                        .and_then(|usage| usage.get("total"))
                        .and_then(|total| total.get("cost_usd"))
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    total_cost_usd += cost_usd;

                    let validation = self
                        .validate_invariants(
                            &replay.replay_run_id,
                            &snapshot.invariants,
                            snapshot.reference_metrics.as_ref(),
                        )
                        .await?;

                    let metrics_delta = snapshot
                        .reference_metrics
                        .as_ref()
                        .zip(replay_run.as_ref())
                        .map(|(reference, run)| {
                            let mut delta = BTreeMap::new();
                            delta.insert(
                                "candidate_count".to_string(),
                                metric_delta(
                                    reference.get("candidate_count").and_then(|v| v.as_f64()),
                                    run.candidate_count.map(|v| v as f64),
                                ),
                            );
                            delta.insert(
                                "scenario_count".to_string(),
                                metric_delta(
                                    reference.get("scenario_count").and_then(|v| v.as_f64()),
                                    run.scenario_count.map(|v| v as f64),
                                ),
                            );
                            delta.insert(
                                "duration_seconds".to_string(),
                                metric_delta(
                                    reference.get("duration_seconds").and_then(|v| v.as_f64()),
                                    run.duration_seconds,
                                ),
                            );
                            delta
                        })
                        .unwrap_or_default();

                    let status = if validation.all_passed {
                        passed += 1;
                        SnapshotTestStatus::Passed
                    } else {
                        failed += 1;
                        SnapshotTestStatus::Failed
                    };
                    let stop = options.stop_on_first_failure
                        && status == SnapshotTestStatus::Failed;

                    results.push(SnapshotTestResult {
                        snapshot_id: snapshot_id.clone(),
                        snapshot_name: snapshot.name.clone(),
                        status,
                        replay_run_id: Some(replay.replay_run_id),
                        invariants: validation.results,
                        metrics_delta,
                        cost_usd,
                        message: None,
                    });

                    if stop {
                        break;
                    }
                }
                Err(err) => {
                    warn!(snapshot_id, error = %err, "snapshot test replay failed");
                    failed += 1;
                    results.push(SnapshotTestResult {
                        snapshot_id: snapshot_id.clone(),
                        snapshot_name: snapshot.name.clone(),
                        status: SnapshotTestStatus::Failed,
                        replay_run_id: None,
                        invariants: Vec::new(),
                        metrics_delta: BTreeMap::new(),
                        cost_usd: 0.0,
                        message: Some(format!("Error during replay: {err}")),
                    });
                    if options.stop_on_first_failure {
                        break;
                    }
                }
            }
        }

        Ok(SnapshotTestReport {
            summary: SnapshotTestSummary {
                total: snapshot_ids.len(),
                passed,
                failed,
                skipped,
            },
            results,
            total_cost_usd,
        })
    }
}

fn metric_delta(baseline: Option<f64>, replay: Option<f64>) -> MetricDelta {
    MetricDelta {
        baseline,
        replay,
        delta: replay.unwrap_or(0.0) - baseline.unwrap_or(0.0),
    }
}

fn parse_field<T>(data: &Value, field: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match data.get(field) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(raw) => serde_json::from_value::<T>(raw.clone()).map_err(|err| {
            CrucibleError::validation(format!("Invalid snapshot field `{field}`: {err}"))
        }),
    }
}
