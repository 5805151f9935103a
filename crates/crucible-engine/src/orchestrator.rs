use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crucible_agents::{merge_usage_summaries, AgentGateway, UsageSummary};
use crucible_observability::{emit_event, PipelineEvent, ProcessKind};
use crucible_store::{RunObservability, Store};
use crucible_types::{
    CrucibleError, MessageRole, Result, Run, RunStatus, RunSummary, RunSummaryCandidate,
};

use crate::design::{run_design_phase, DesignPhaseResult};
use crate::evaluate::{run_evaluation_phase, EvaluationPhaseResult};
use crate::rank::{run_ranking_phase, RankingPhaseResult};
use crate::scenario::{run_scenario_phase, ScenarioPhaseResult};

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DesignScenarioResult {
    pub candidates: DesignPhaseResult,
    pub scenarios: ScenarioPhaseResult,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluateRankResult {
    pub evaluations: EvaluationPhaseResult,
    pub rankings: RankingPhaseResult,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineTiming {
    pub total: f64,
    pub phase1: f64,
    pub phase2: f64,
    pub design: f64,
    pub scenarios: f64,
    pub evaluation: f64,
    pub ranking: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub candidates: DesignPhaseResult,
    pub scenarios: ScenarioPhaseResult,
    pub evaluations: EvaluationPhaseResult,
    pub rankings: RankingPhaseResult,
    pub status: String,
    pub timing: PipelineTiming,
}

#[derive(Default)]
struct PipelineInstrumentation {
    phase_timings: BTreeMap<String, PhaseTiming>,
    resource_breakdown: BTreeMap<String, Value>,
    phase_usage: BTreeMap<String, UsageSummary>,
    candidate_count: Option<u64>,
    scenario_count: Option<u64>,
    evaluation_count: Option<u64>,
}

impl PipelineInstrumentation {
    fn record_phase(
        &mut self,
        name: &str,
        started_at: DateTime<Utc>,
        duration_seconds: f64,
        usage: Option<&UsageSummary>,
        resources: Value,
    ) {
        self.phase_timings.insert(
            name.to_string(),
            PhaseTiming {
                started_at,
                completed_at: Utc::now(),
                duration_seconds,
            },
        );
        self.resource_breakdown.insert(name.to_string(), resources);
        if let Some(usage) = usage {
            self.phase_usage.insert(name.to_string(), usage.clone());
        }
    }

    fn metrics_payload(&self, notes: &[String]) -> Value {
        let mut payload = json!({
            "phase_timings": self.phase_timings,
            "resource_breakdown": self.resource_breakdown,
        });
        if !notes.is_empty() {
            payload["notes"] = json!(notes);
        }
        payload
    }

    fn llm_usage_payload(&self) -> Option<Value> {
        if self.phase_usage.is_empty() {
            return None;
        }
        let mut payload = json!({"phases": self.phase_usage});
        if let Some(total) = merge_usage_summaries(self.phase_usage.values()) {
            payload["total"] = json!(total);
        }
        Some(payload)
    }
}

fn phase_event(run: &Run, phase: &str, status: &str) {
    emit_event(
        Level::INFO,
        ProcessKind::Api,
        PipelineEvent {
            event: "pipeline.phase",
            component: "engine.orchestrator",
            project_id: Some(&run.project_id),
            run_id: Some(&run.id),
            phase: Some(phase),
            status: Some(status),
            error_code: None,
            detail: None,
        },
    );
}

/// Drives the four-phase pipeline for a run. A single orchestrator task owns
/// each run's status; within the evaluation phase independent pairs fan out
/// up to `concurrency` at a time.
#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<Store>,
    gateway: Arc<AgentGateway>,
    concurrency: usize,
}

impl RunOrchestrator {
    pub fn new(store: Arc<Store>, gateway: Arc<AgentGateway>, concurrency: usize) -> Self {
        Self {
            store,
            gateway,
            concurrency,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Mark the run failed and record why, unless it already reached a
    /// terminal state. `completed` stays completed no matter what broke
    /// afterwards.
    async fn handle_phase_error(&self, run_id: &str, err: &CrucibleError) {
        let Some(run) = self.store.get_run(run_id).await else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        if let Err(status_err) = self
            .store
            .update_run_status(run_id, RunStatus::Failed, None, None)
            .await
        {
            warn!(run_id, error = %status_err, "could not mark run as failed");
            return;
        }
        if let Err(summary_err) = self
            .store
            .update_run_error_summary(run_id, Some(err.to_string()))
            .await
        {
            warn!(run_id, error = %summary_err, "could not record error summary");
        }
    }

    pub async fn execute_design_phase(
        &self,
        run_id: &str,
        num_candidates: u32,
        cancel: &CancellationToken,
    ) -> Result<DesignPhaseResult> {
        let run = self.store.require_run(run_id).await?;
        let started_at = run.started_at.is_none().then(Utc::now);
        self.store
            .update_run_status(run_id, RunStatus::Running, started_at, None)
            .await?;

        match run_design_phase(&self.store, &self.gateway, &run, num_candidates, cancel).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(run_id, error = %err, "design phase failed");
                self.handle_phase_error(run_id, &err).await;
                Err(err)
            }
        }
    }

    pub async fn execute_scenario_phase(
        &self,
        run_id: &str,
        num_scenarios: u32,
        cancel: &CancellationToken,
    ) -> Result<ScenarioPhaseResult> {
        let run = self.store.require_run(run_id).await?;
        match run_scenario_phase(&self.store, &self.gateway, &run, num_scenarios, cancel).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(run_id, error = %err, "scenario phase failed");
                self.handle_phase_error(run_id, &err).await;
                Err(err)
            }
        }
    }

    pub async fn execute_design_and_scenario_phase(
        &self,
        run_id: &str,
        num_candidates: u32,
        num_scenarios: u32,
        cancel: &CancellationToken,
    ) -> Result<DesignScenarioResult> {
        let run = self.store.require_run(run_id).await?;
        self.check_prerequisites(&run).await?;

        let candidates = self
            .execute_design_phase(run_id, num_candidates, cancel)
            .await?;
        let scenarios = self
            .execute_scenario_phase(run_id, num_scenarios, cancel)
            .await?;

        Ok(DesignScenarioResult {
            candidates,
            scenarios,
            status: "completed".to_string(),
        })
    }

    pub async fn execute_evaluation_phase(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<EvaluationPhaseResult> {
        let run = self.store.require_run(run_id).await?;
        match run_evaluation_phase(&self.store, &self.gateway, &run, self.concurrency, cancel)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(run_id, error = %err, "evaluation phase failed");
                self.handle_phase_error(run_id, &err).await;
                Err(err)
            }
        }
    }

    pub async fn execute_ranking_phase(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RankingPhaseResult> {
        let run = self.store.require_run(run_id).await?;
        if cancel.is_cancelled() {
            let err = CrucibleError::Cancelled;
            self.handle_phase_error(run_id, &err).await;
            return Err(err);
        }
        match run_ranking_phase(&self.store, &run).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(run_id, error = %err, "ranking phase failed");
                self.handle_phase_error(run_id, &err).await;
                Err(err)
            }
        }
    }

    pub async fn execute_evaluate_and_rank_phase(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<EvaluateRankResult> {
        self.store.require_run(run_id).await?;
        let evaluations = self.execute_evaluation_phase(run_id, cancel).await?;
        let rankings = self.execute_ranking_phase(run_id, cancel).await?;
        Ok(EvaluateRankResult {
            evaluations,
            rankings,
            status: "completed".to_string(),
        })
    }

    /// Fail with a detailed precondition error when the project is missing
    /// its ProblemSpec or WorldModel; the existing project ids go into the
    /// message as a debugging aid.
    async fn check_prerequisites(&self, run: &Run) -> Result<()> {
        if self.store.get_problem_spec(&run.project_id).await.is_none() {
            let project_ids = self.store.list_project_ids().await;
            let message = format!(
                "ProblemSpec not found for project {}. Available projects: {:?}",
                run.project_id, project_ids
            );
            error!(run_id = %run.id, "{message}");
            let err = CrucibleError::precondition(message);
            self.handle_phase_error(&run.id, &err).await;
            return Err(err);
        }
        if self.store.get_world_model(&run.project_id).await.is_none() {
            let project_ids = self.store.list_project_ids().await;
            let message = format!(
                "WorldModel not found for project {}. Available projects: {:?}",
                run.project_id, project_ids
            );
            error!(run_id = %run.id, "{message}");
            let err = CrucibleError::precondition(message);
            self.handle_phase_error(&run.id, &err).await;
            return Err(err);
        }
        Ok(())
    }

    async fn run_pipeline_phases(
        &self,
        run: &Run,
        num_candidates: u32,
        num_scenarios: u32,
        cancel: &CancellationToken,
        instrumentation: &mut PipelineInstrumentation,
    ) -> Result<(
        DesignPhaseResult,
        ScenarioPhaseResult,
        EvaluationPhaseResult,
        RankingPhaseResult,
    )> {
        phase_event(run, "design", "start");
        let design_started = Utc::now();
        let design = self
            .execute_design_phase(&run.id, num_candidates, cancel)
            .await?;
        instrumentation.candidate_count = Some(design.count as u64);
        instrumentation.record_phase(
            "design",
            design_started,
            design.duration_seconds,
            design.usage_summary.as_ref(),
            json!({
                "requested_candidates": num_candidates,
                "candidates_generated": design.count,
                "llm_calls": design.usage_summary.as_ref().map(|u| u.call_count).unwrap_or(0),
            }),
        );
        phase_event(run, "design", "completed");

        phase_event(run, "scenarios", "start");
        let scenario_started = Utc::now();
        let scenarios = self
            .execute_scenario_phase(&run.id, num_scenarios, cancel)
            .await?;
        instrumentation.scenario_count = Some(scenarios.count as u64);
        instrumentation.record_phase(
            "scenarios",
            scenario_started,
            scenarios.duration_seconds,
            scenarios.usage_summary.as_ref(),
            json!({
                "requested_scenarios": num_scenarios,
                "scenarios_generated": scenarios.count,
                "llm_calls": scenarios.usage_summary.as_ref().map(|u| u.call_count).unwrap_or(0),
            }),
        );
        phase_event(run, "scenarios", "completed");

        phase_event(run, "evaluation", "start");
        let evaluation_started = Utc::now();
        let evaluations = self.execute_evaluation_phase(&run.id, cancel).await?;
        instrumentation.evaluation_count = Some(evaluations.count as u64);
        instrumentation.record_phase(
            "evaluation",
            evaluation_started,
            evaluations.duration_seconds,
            evaluations.usage_summary.as_ref(),
            json!({
                "evaluations_created": evaluations.count,
                "candidates_evaluated": evaluations.candidates_evaluated,
                "scenarios_used": evaluations.scenarios_used,
                "attempted_pairs": evaluations.attempted_pairs,
                "skipped_existing": evaluations.skipped_existing,
                "llm_calls": evaluations.llm_call_count,
            }),
        );
        phase_event(run, "evaluation", "completed");

        phase_event(run, "ranking", "start");
        let ranking_started = Utc::now();
        let rankings = self.execute_ranking_phase(&run.id, cancel).await?;
        instrumentation.record_phase(
            "ranking",
            ranking_started,
            rankings.duration_seconds,
            None,
            json!({
                "candidates_ranked": rankings.count,
                "hard_constraint_violations": rankings.hard_constraint_violations.len(),
            }),
        );
        phase_event(run, "ranking", "completed");

        Ok((design, scenarios, evaluations, rankings))
    }

    /// Execute all four phases in order, persist per-phase instrumentation
    /// and aggregated usage on both the success and failure path, and emit a
    /// run summary into the project's chat once the run completes.
    pub async fn execute_full_pipeline(
        &self,
        run_id: &str,
        num_candidates: u32,
        num_scenarios: u32,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let overall_start = Instant::now();
        let run = self.store.require_run(run_id).await?;
        info!(run_id, project_id = %run.project_id, status = %run.status, "starting full pipeline");

        // Re-read prerequisites past any stale cache.
        self.store
            .invalidate_caches()
            .await
            .map_err(CrucibleError::Internal)?;
        self.check_prerequisites(&run).await?;

        // max_runtime_s rides the cancellation token.
        let cancel = cancel.child_token();
        let timeout_task = run.config.max_runtime_s.map(|secs| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                cancel.cancel();
            })
        });

        let notes = vec![
            "Counts derive from phase service outputs.".to_string(),
            "LLM usage only appears when providers emit token telemetry.".to_string(),
        ];
        let mut instrumentation = PipelineInstrumentation::default();

        let phases = self
            .run_pipeline_phases(&run, num_candidates, num_scenarios, &cancel, &mut instrumentation)
            .await;
        if let Some(task) = timeout_task {
            task.abort();
        }

        match phases {
            Ok((design, scenarios, evaluations, rankings)) => {
                self.store
                    .update_run_status(run_id, RunStatus::Completed, None, Some(Utc::now()))
                    .await?;

                if let Some(refreshed) = self.store.get_run(run_id).await {
                    self.post_run_summary(&refreshed, &design, &scenarios, &evaluations, &rankings)
                        .await;
                }

                let total = overall_start.elapsed().as_secs_f64();
                info!(run_id, duration_seconds = total, "full pipeline completed");

                self.persist_observability(
                    run_id,
                    &instrumentation,
                    &notes,
                    Some(total),
                    None,
                )
                .await;

                let timing = PipelineTiming {
                    total,
                    phase1: design.duration_seconds + scenarios.duration_seconds,
                    phase2: evaluations.duration_seconds + rankings.duration_seconds,
                    design: design.duration_seconds,
                    scenarios: scenarios.duration_seconds,
                    evaluation: evaluations.duration_seconds,
                    ranking: rankings.duration_seconds,
                };

                Ok(PipelineResult {
                    candidates: design,
                    scenarios,
                    evaluations,
                    rankings,
                    status: "completed".to_string(),
                    timing,
                })
            }
            Err(err) => {
                error!(run_id, project_id = %run.project_id, error = %err, "full pipeline failed");
                emit_event(
                    Level::ERROR,
                    ProcessKind::Api,
                    PipelineEvent {
                        event: "pipeline.failed",
                        component: "engine.orchestrator",
                        project_id: Some(&run.project_id),
                        run_id: Some(run_id),
                        phase: None,
                        status: Some("failed"),
                        error_code: None,
                        detail: Some(&err.to_string()),
                    },
                );
                self.handle_phase_error(run_id, &err).await;
                self.persist_observability(
                    run_id,
                    &instrumentation,
                    &notes,
                    Some(overall_start.elapsed().as_secs_f64()),
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn persist_observability(
        &self,
        run_id: &str,
        instrumentation: &PipelineInstrumentation,
        notes: &[String],
        duration_seconds: Option<f64>,
        error_summary: Option<String>,
    ) {
        let observability = RunObservability {
            duration_seconds,
            candidate_count: instrumentation.candidate_count,
            scenario_count: instrumentation.scenario_count,
            evaluation_count: instrumentation.evaluation_count,
            metrics: Some(instrumentation.metrics_payload(notes)),
            llm_usage: instrumentation.llm_usage_payload(),
            error_summary,
        };
        if let Err(err) = self.store.update_run_observability(run_id, observability).await {
            warn!(run_id, error = %err, "failed to persist run observability");
        }
    }

    /// Post a structured summary message to the project's first chat
    /// session. Summary failures are logged and never fail the run.
    async fn post_run_summary(
        &self,
        run: &Run,
        design: &DesignPhaseResult,
        scenarios: &ScenarioPhaseResult,
        evaluations: &EvaluationPhaseResult,
        rankings: &RankingPhaseResult,
    ) {
        let sessions = self.store.list_chat_sessions(Some(&run.project_id)).await;
        let Some(session) = sessions.first() else {
            info!(
                project_id = %run.project_id,
                "no chat sessions found; skipping run summary message"
            );
            return;
        };

        let summary = build_run_summary(run, design, scenarios, evaluations, rankings);
        let content = format_run_summary_text(&summary);
        let metadata = json!({
            "agent_name": "Architect",
            "run_summary": summary,
        });

        match self
            .store
            .create_message(&session.id, MessageRole::Agent, content, Some(metadata))
            .await
        {
            Ok(message) => {
                if let Err(err) = self.store.set_run_summary_message(&run.id, &message.id).await {
                    warn!(run_id = %run.id, error = %err, "failed to link run summary message");
                }
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "failed to post run summary");
            }
        }
    }
}

fn build_run_summary(
    run: &Run,
    design: &DesignPhaseResult,
    scenarios: &ScenarioPhaseResult,
    evaluations: &EvaluationPhaseResult,
    rankings: &RankingPhaseResult,
) -> RunSummary {
    let mut counts = BTreeMap::new();
    counts.insert("candidates".to_string(), design.count as u64);
    counts.insert("scenarios".to_string(), scenarios.count as u64);
    counts.insert("evaluations".to_string(), evaluations.count as u64);

    let top_candidates = rankings
        .ranked_candidates
        .iter()
        .take(3)
        .map(|candidate| RunSummaryCandidate {
            candidate_id: candidate.id.clone(),
            label: Some(candidate.mechanism_description.clone()),
            i: candidate.scores.i,
            p: candidate.scores.p.as_ref().map(|m| m.overall),
            r: candidate.scores.r.as_ref().map(|m| m.overall),
            notes: None,
        })
        .collect();

    let duration_seconds = match (run.started_at, run.completed_at) {
        (Some(started), Some(completed)) => {
            Some((completed - started).num_milliseconds() as f64 / 1000.0)
        }
        _ => None,
    };

    let mut links = BTreeMap::new();
    links.insert("results_view".to_string(), format!("/runs/{}", run.id));

    RunSummary {
        run_id: run.id.clone(),
        project_id: run.project_id.clone(),
        mode: run.mode.as_str().to_string(),
        status: run.status.to_string(),
        started_at: run.started_at,
        completed_at: run.completed_at,
        duration_seconds,
        counts,
        top_candidates,
        links,
        summary_label: Some(format!("Run {} summary", run.id)),
    }
}

fn format_run_summary_text(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("Run {} ({}) completed.", summary.run_id, summary.mode),
        format!(
            "Counts: {} candidates, {} scenarios, {} evaluations.",
            summary.counts.get("candidates").copied().unwrap_or(0),
            summary.counts.get("scenarios").copied().unwrap_or(0),
            summary.counts.get("evaluations").copied().unwrap_or(0),
        ),
    ];
    if !summary.top_candidates.is_empty() {
        lines.push("Top candidates:".to_string());
        for (index, candidate) in summary.top_candidates.iter().enumerate() {
            let label = candidate
                .label
                .clone()
                .unwrap_or_else(|| candidate.candidate_id.clone());
            match candidate.i {
                Some(i) => lines.push(format!("{}. {} I={:.2}", index + 1, label, i)),
                None => lines.push(format!("{}. {}", index + 1, label)),
            }
        }
    }
    lines.push("Open the run panel to inspect full results and provenance.".to_string());
    lines.join("\n")
}
