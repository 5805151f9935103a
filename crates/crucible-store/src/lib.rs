use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crucible_types::{
    Candidate, CandidateOrigin, CandidateScores, CandidateStatus, ChatSession, ChatSessionMode,
    Constraint, ConstraintVerdict, CrucibleError, Evaluation, Issue, IssueResolutionStatus,
    IssueSeverity, IssueType, Message, MessageRole, MetricScore, ProblemSpec, Project,
    ProvenanceEntry, ResolutionLevel, Result, Run, RunConfig, RunMode, RunStatus, Scenario,
    ScenarioSuite, Snapshot, SnapshotInvariant, WorldModel,
};

const PROJECTS_FILE: &str = "projects.json";
const PROBLEM_SPECS_FILE: &str = "problem_specs.json";
const WORLD_MODELS_FILE: &str = "world_models.json";
const RUNS_FILE: &str = "runs.json";
const CANDIDATES_FILE: &str = "candidates.json";
const SCENARIO_SUITES_FILE: &str = "scenario_suites.json";
const EVALUATIONS_FILE: &str = "evaluations.json";
const ISSUES_FILE: &str = "issues.json";
const SNAPSHOTS_FILE: &str = "snapshots.json";
const CHAT_SESSIONS_FILE: &str = "chat_sessions.json";
const MESSAGES_FILE: &str = "messages.json";

pub const ERROR_SUMMARY_MAX_CHARS: usize = 512;

/// Problem-spec content for an upsert. `provenance_log: None` keeps the
/// existing log; restores pass the full log explicitly.
#[derive(Debug, Clone, Default)]
pub struct ProblemSpecUpdate {
    pub constraints: Vec<Constraint>,
    pub goals: Vec<String>,
    pub resolution: ResolutionLevel,
    pub mode: RunMode,
    pub provenance_log: Option<Vec<ProvenanceEntry>>,
}

#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub run_id: String,
    pub project_id: String,
    pub origin: CandidateOrigin,
    pub mechanism_description: String,
    pub predicted_effects: Option<Value>,
    pub parent_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub candidate_id: String,
    pub run_id: String,
    pub scenario_id: String,
    pub p: MetricScore,
    pub r: MetricScore,
    pub constraint_satisfaction: std::collections::BTreeMap<String, ConstraintVerdict>,
    pub explanation: String,
}

#[derive(Debug, Clone)]
pub struct NewIssue {
    pub project_id: String,
    pub run_id: Option<String>,
    pub candidate_id: Option<String>,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub description: Option<String>,
    pub resolution_status: Option<IssueResolutionStatus>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub project_id: String,
    pub run_id: Option<String>,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub snapshot_data: Value,
    pub reference_metrics: Option<Value>,
    pub invariants: Vec<SnapshotInvariant>,
}

/// Observability fields persisted onto a run after pipeline execution.
/// Counts and duration update only when present; metrics, usage and the
/// (truncated) error summary are written as given.
#[derive(Debug, Clone, Default)]
pub struct RunObservability {
    pub duration_seconds: Option<f64>,
    pub candidate_count: Option<u64>,
    pub scenario_count: Option<u64>,
    pub evaluation_count: Option<u64>,
    pub metrics: Option<Value>,
    pub llm_usage: Option<Value>,
    pub error_summary: Option<String>,
}

/// File-backed entity store. Each entity type lives in one JSON document;
/// every mutating operation applies the whole logical change behind write
/// locks and then flushes, so concurrent readers never observe a partial
/// update. `invalidate_caches` reloads from disk so results committed by an
/// earlier pipeline phase are visible to later ones.
pub struct Store {
    base: PathBuf,
    projects: RwLock<HashMap<String, Project>>,
    problem_specs: RwLock<HashMap<String, ProblemSpec>>,
    world_models: RwLock<HashMap<String, WorldModel>>,
    runs: RwLock<HashMap<String, Run>>,
    candidates: RwLock<HashMap<String, Candidate>>,
    scenario_suites: RwLock<HashMap<String, ScenarioSuite>>,
    evaluations: RwLock<HashMap<String, Evaluation>>,
    issues: RwLock<HashMap<String, Issue>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
    chat_sessions: RwLock<HashMap<String, ChatSession>>,
    messages: RwLock<HashMap<String, Message>>,
}

async fn load_map<T: DeserializeOwned>(base: &Path, file: &str) -> anyhow::Result<HashMap<String, T>> {
    let path = base.join(file);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(&path).await?;
    Ok(serde_json::from_str::<HashMap<String, T>>(&raw).unwrap_or_default())
}

async fn write_map<T: Serialize>(
    base: &Path,
    file: &str,
    map: &HashMap<String, T>,
) -> anyhow::Result<()> {
    let payload = serde_json::to_string_pretty(map)?;
    fs::write(base.join(file), payload).await?;
    Ok(())
}

fn newest_first<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> (DateTime<Utc>, String),
{
    items.sort_by(|a, b| {
        let (at, aid) = key(a);
        let (bt, bid) = key(b);
        bt.cmp(&at).then_with(|| aid.cmp(&bid))
    });
    items
}

fn run_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Created, Running)
            | (Created, Failed)
            | (Created, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

pub fn truncate_error_summary(summary: &str) -> String {
    summary.chars().take(ERROR_SUMMARY_MAX_CHARS).collect()
}

impl Store {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self {
            projects: RwLock::new(load_map(&base, PROJECTS_FILE).await?),
            problem_specs: RwLock::new(load_map(&base, PROBLEM_SPECS_FILE).await?),
            world_models: RwLock::new(load_map(&base, WORLD_MODELS_FILE).await?),
            runs: RwLock::new(load_map(&base, RUNS_FILE).await?),
            candidates: RwLock::new(load_map(&base, CANDIDATES_FILE).await?),
            scenario_suites: RwLock::new(load_map(&base, SCENARIO_SUITES_FILE).await?),
            evaluations: RwLock::new(load_map(&base, EVALUATIONS_FILE).await?),
            issues: RwLock::new(load_map(&base, ISSUES_FILE).await?),
            snapshots: RwLock::new(load_map(&base, SNAPSHOTS_FILE).await?),
            chat_sessions: RwLock::new(load_map(&base, CHAT_SESSIONS_FILE).await?),
            messages: RwLock::new(load_map(&base, MESSAGES_FILE).await?),
            base,
        })
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        write_map(&self.base, PROJECTS_FILE, &*self.projects.read().await).await?;
        write_map(
            &self.base,
            PROBLEM_SPECS_FILE,
            &*self.problem_specs.read().await,
        )
        .await?;
        write_map(&self.base, WORLD_MODELS_FILE, &*self.world_models.read().await).await?;
        write_map(&self.base, RUNS_FILE, &*self.runs.read().await).await?;
        write_map(&self.base, CANDIDATES_FILE, &*self.candidates.read().await).await?;
        write_map(
            &self.base,
            SCENARIO_SUITES_FILE,
            &*self.scenario_suites.read().await,
        )
        .await?;
        write_map(&self.base, EVALUATIONS_FILE, &*self.evaluations.read().await).await?;
        write_map(&self.base, ISSUES_FILE, &*self.issues.read().await).await?;
        write_map(&self.base, SNAPSHOTS_FILE, &*self.snapshots.read().await).await?;
        write_map(
            &self.base,
            CHAT_SESSIONS_FILE,
            &*self.chat_sessions.read().await,
        )
        .await?;
        write_map(&self.base, MESSAGES_FILE, &*self.messages.read().await).await?;
        Ok(())
    }

    /// Drop in-process caches and re-read every map from disk. The pipeline
    /// calls this before prerequisite checks so data committed by earlier
    /// phases is never hidden by a stale cache.
    pub async fn invalidate_caches(&self) -> anyhow::Result<()> {
        *self.projects.write().await = load_map(&self.base, PROJECTS_FILE).await?;
        *self.problem_specs.write().await = load_map(&self.base, PROBLEM_SPECS_FILE).await?;
        *self.world_models.write().await = load_map(&self.base, WORLD_MODELS_FILE).await?;
        *self.runs.write().await = load_map(&self.base, RUNS_FILE).await?;
        *self.candidates.write().await = load_map(&self.base, CANDIDATES_FILE).await?;
        *self.scenario_suites.write().await = load_map(&self.base, SCENARIO_SUITES_FILE).await?;
        *self.evaluations.write().await = load_map(&self.base, EVALUATIONS_FILE).await?;
        *self.issues.write().await = load_map(&self.base, ISSUES_FILE).await?;
        *self.snapshots.write().await = load_map(&self.base, SNAPSHOTS_FILE).await?;
        *self.chat_sessions.write().await = load_map(&self.base, CHAT_SESSIONS_FILE).await?;
        *self.messages.write().await = load_map(&self.base, MESSAGES_FILE).await?;
        Ok(())
    }

    // ---- Projects ----

    pub async fn create_project(
        &self,
        title: impl Into<String>,
        description: Option<String>,
    ) -> Result<Project> {
        let project = Project::new(title, description);
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        self.flush().await?;
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.projects.read().await.get(id).cloned()
    }

    pub async fn require_project(&self, id: &str) -> Result<Project> {
        self.get_project(id)
            .await
            .ok_or_else(|| CrucibleError::not_found("Project", id))
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let all = self.projects.read().await.values().cloned().collect();
        newest_first(all, |p: &Project| (p.created_at, p.id.clone()))
    }

    pub async fn list_project_ids(&self) -> Vec<String> {
        self.list_projects().await.into_iter().map(|p| p.id).collect()
    }

    /// Remove a project and cascade to everything it owns.
    pub async fn delete_project(&self, id: &str) -> Result<bool> {
        let removed = self.projects.write().await.remove(id).is_some();
        if !removed {
            return Ok(false);
        }
        self.problem_specs.write().await.remove(id);
        self.world_models.write().await.remove(id);

        let run_ids: Vec<String> = {
            let mut runs = self.runs.write().await;
            let ids = runs
                .values()
                .filter(|r| r.project_id == id)
                .map(|r| r.id.clone())
                .collect::<Vec<_>>();
            runs.retain(|_, r| r.project_id != id);
            ids
        };
        self.candidates.write().await.retain(|_, c| c.project_id != id);
        self.scenario_suites
            .write()
            .await
            .retain(|run_id, _| !run_ids.contains(run_id));
        self.evaluations
            .write()
            .await
            .retain(|_, e| !run_ids.contains(&e.run_id));
        self.issues.write().await.retain(|_, i| i.project_id != id);
        self.snapshots.write().await.retain(|_, s| s.project_id != id);

        let session_ids: Vec<String> = {
            let mut sessions = self.chat_sessions.write().await;
            let ids = sessions
                .values()
                .filter(|s| s.project_id == id)
                .map(|s| s.id.clone())
                .collect::<Vec<_>>();
            sessions.retain(|_, s| s.project_id != id);
            ids
        };
        self.messages
            .write()
            .await
            .retain(|_, m| !session_ids.contains(&m.chat_session_id));

        self.flush().await?;
        Ok(true)
    }

    // ---- ProblemSpec (per-project singleton) ----

    pub async fn get_problem_spec(&self, project_id: &str) -> Option<ProblemSpec> {
        self.problem_specs.read().await.get(project_id).cloned()
    }

    pub async fn upsert_problem_spec(
        &self,
        project_id: &str,
        update: ProblemSpecUpdate,
    ) -> Result<ProblemSpec> {
        self.require_project(project_id).await?;
        let spec = {
            let mut specs = self.problem_specs.write().await;
            let spec = specs
                .entry(project_id.to_string())
                .or_insert_with(|| ProblemSpec::new(project_id));
            spec.constraints = update.constraints;
            spec.goals = update.goals;
            spec.resolution = update.resolution;
            spec.mode = update.mode;
            if let Some(log) = update.provenance_log {
                spec.provenance_log = log;
            }
            spec.updated_at = Utc::now();
            spec.clone()
        };
        self.flush().await?;
        Ok(spec)
    }

    pub async fn append_problem_spec_provenance(
        &self,
        project_id: &str,
        entry: ProvenanceEntry,
    ) -> Result<()> {
        {
            let mut specs = self.problem_specs.write().await;
            let spec = specs
                .get_mut(project_id)
                .ok_or_else(|| CrucibleError::not_found("ProblemSpec", project_id))?;
            spec.provenance_log.push(entry);
            spec.updated_at = Utc::now();
        }
        self.flush().await?;
        Ok(())
    }

    // ---- WorldModel (per-project singleton) ----

    pub async fn get_world_model(&self, project_id: &str) -> Option<WorldModel> {
        self.world_models.read().await.get(project_id).cloned()
    }

    pub async fn upsert_world_model(&self, project_id: &str, model_data: Value) -> Result<WorldModel> {
        self.require_project(project_id).await?;
        let model = {
            let mut models = self.world_models.write().await;
            let model = models
                .entry(project_id.to_string())
                .or_insert_with(|| WorldModel::new(project_id, Value::Null));
            model.model_data = model_data;
            model.updated_at = Utc::now();
            model.clone()
        };
        self.flush().await?;
        Ok(model)
    }

    // ---- Runs ----

    pub async fn create_run(
        &self,
        project_id: &str,
        mode: RunMode,
        config: RunConfig,
        chat_session_id: Option<String>,
    ) -> Result<Run> {
        self.require_project(project_id).await?;
        let mut run = Run::new(project_id, mode, config);
        run.chat_session_id = chat_session_id;
        self.runs.write().await.insert(run.id.clone(), run.clone());
        self.flush().await?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> Option<Run> {
        self.runs.read().await.get(id).cloned()
    }

    pub async fn require_run(&self, id: &str) -> Result<Run> {
        self.get_run(id)
            .await
            .ok_or_else(|| CrucibleError::not_found("Run", id))
    }

    pub async fn list_runs(
        &self,
        project_id: Option<&str>,
        chat_session_id: Option<&str>,
    ) -> Vec<Run> {
        let all: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| project_id.is_none_or(|p| r.project_id == p))
            .filter(|r| chat_session_id.is_none_or(|c| r.chat_session_id.as_deref() == Some(c)))
            .cloned()
            .collect();
        newest_first(all, |r: &Run| (r.created_at, r.id.clone()))
    }

    /// Sole mutator of `Run.status`. Enforces the run state machine;
    /// terminal states reject every further transition, so a `completed`
    /// run can never be demoted. Same-status calls are no-ops.
    pub async fn update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Run> {
        let run = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Run", id))?;
            if run.status != status {
                if !run_transition_allowed(run.status, status) {
                    return Err(CrucibleError::validation(format!(
                        "illegal run status transition: {} -> {}",
                        run.status, status
                    )));
                }
                run.status = status;
            }
            if let Some(started) = started_at {
                run.started_at = Some(started);
            }
            if let Some(completed) = completed_at {
                run.completed_at = Some(completed);
            }
            run.updated_at = Utc::now();
            run.clone()
        };
        self.flush().await?;
        Ok(run)
    }

    pub async fn update_run_observability(
        &self,
        id: &str,
        observability: RunObservability,
    ) -> Result<Run> {
        let run = {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Run", id))?;
            if let Some(duration) = observability.duration_seconds {
                run.duration_seconds = Some(duration);
            }
            if let Some(count) = observability.candidate_count {
                run.candidate_count = Some(count);
            }
            if let Some(count) = observability.scenario_count {
                run.scenario_count = Some(count);
            }
            if let Some(count) = observability.evaluation_count {
                run.evaluation_count = Some(count);
            }
            run.metrics = observability.metrics;
            run.llm_usage = observability.llm_usage;
            run.error_summary = observability.error_summary.map(|s| truncate_error_summary(&s));
            run.updated_at = Utc::now();
            run.clone()
        };
        self.flush().await?;
        Ok(run)
    }

    /// Set just the error summary, leaving metrics and usage untouched.
    pub async fn update_run_error_summary(
        &self,
        run_id: &str,
        error_summary: Option<String>,
    ) -> Result<()> {
        {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CrucibleError::not_found("Run", run_id))?;
            run.error_summary = error_summary.map(|s| truncate_error_summary(&s));
            run.updated_at = Utc::now();
        }
        self.flush().await?;
        Ok(())
    }

    pub async fn set_run_summary_message(&self, run_id: &str, message_id: &str) -> Result<()> {
        {
            let mut runs = self.runs.write().await;
            let run = runs
                .get_mut(run_id)
                .ok_or_else(|| CrucibleError::not_found("Run", run_id))?;
            run.run_summary_message_id = Some(message_id.to_string());
            run.updated_at = Utc::now();
        }
        self.flush().await?;
        Ok(())
    }

    // ---- Candidates ----

    pub async fn create_candidate(&self, new: NewCandidate) -> Result<Candidate> {
        self.require_run(&new.run_id).await?;
        let now = Utc::now();
        let candidate = Candidate {
            id: Uuid::new_v4().to_string(),
            run_id: new.run_id,
            project_id: new.project_id,
            origin: new.origin,
            mechanism_description: new.mechanism_description,
            predicted_effects: new.predicted_effects,
            scores: None,
            status: CandidateStatus::New,
            parent_ids: new.parent_ids,
            provenance_log: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.candidates
            .write()
            .await
            .insert(candidate.id.clone(), candidate.clone());
        self.flush().await?;
        Ok(candidate)
    }

    pub async fn get_candidate(&self, id: &str) -> Option<Candidate> {
        self.candidates.read().await.get(id).cloned()
    }

    pub async fn list_candidates(
        &self,
        run_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Vec<Candidate> {
        let all: Vec<Candidate> = self
            .candidates
            .read()
            .await
            .values()
            .filter(|c| run_id.is_none_or(|r| c.run_id == r))
            .filter(|c| project_id.is_none_or(|p| c.project_id == p))
            .cloned()
            .collect();
        newest_first(all, |c: &Candidate| (c.created_at, c.id.clone()))
    }

    pub async fn update_candidate_scores(&self, id: &str, scores: CandidateScores) -> Result<()> {
        {
            let mut candidates = self.candidates.write().await;
            let candidate = candidates
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Candidate", id))?;
            candidate.scores = Some(scores);
            candidate.updated_at = Utc::now();
        }
        self.flush().await?;
        Ok(())
    }

    pub async fn update_candidate_status(&self, id: &str, status: CandidateStatus) -> Result<()> {
        {
            let mut candidates = self.candidates.write().await;
            let candidate = candidates
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Candidate", id))?;
            candidate.status = status;
            candidate.updated_at = Utc::now();
        }
        self.flush().await?;
        Ok(())
    }

    pub async fn append_candidate_provenance(
        &self,
        id: &str,
        entry: ProvenanceEntry,
    ) -> Result<()> {
        {
            let mut candidates = self.candidates.write().await;
            let candidate = candidates
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Candidate", id))?;
            candidate.provenance_log.push(entry);
            candidate.updated_at = Utc::now();
        }
        self.flush().await?;
        Ok(())
    }

    // ---- ScenarioSuite (per-run singleton) ----

    pub async fn get_scenario_suite(&self, run_id: &str) -> Option<ScenarioSuite> {
        self.scenario_suites.read().await.get(run_id).cloned()
    }

    /// Create the run's suite or overwrite its scenarios in place.
    pub async fn upsert_scenario_suite(
        &self,
        run_id: &str,
        scenarios: Vec<Scenario>,
    ) -> Result<ScenarioSuite> {
        self.require_run(run_id).await?;
        let suite = {
            let mut suites = self.scenario_suites.write().await;
            let now = Utc::now();
            let suite = suites
                .entry(run_id.to_string())
                .or_insert_with(|| ScenarioSuite {
                    id: Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    scenarios: Vec::new(),
                    created_at: now,
                    updated_at: now,
                });
            suite.scenarios = scenarios;
            suite.updated_at = now;
            suite.clone()
        };
        self.flush().await?;
        Ok(suite)
    }

    // ---- Evaluations ----

    pub async fn create_evaluation(&self, new: NewEvaluation) -> Result<Evaluation> {
        self.require_run(&new.run_id).await?;
        let evaluation = {
            let mut evaluations = self.evaluations.write().await;
            let duplicate = evaluations.values().any(|e| {
                e.run_id == new.run_id
                    && e.candidate_id == new.candidate_id
                    && e.scenario_id == new.scenario_id
            });
            if duplicate {
                return Err(CrucibleError::validation(format!(
                    "evaluation already exists for candidate {} and scenario {}",
                    new.candidate_id, new.scenario_id
                )));
            }
            let evaluation = Evaluation {
                id: Uuid::new_v4().to_string(),
                candidate_id: new.candidate_id,
                run_id: new.run_id,
                scenario_id: new.scenario_id,
                p: new.p,
                r: new.r,
                constraint_satisfaction: new.constraint_satisfaction,
                explanation: new.explanation,
                created_at: Utc::now(),
            };
            evaluations.insert(evaluation.id.clone(), evaluation.clone());
            evaluation
        };
        self.flush().await?;
        Ok(evaluation)
    }

    pub async fn list_evaluations(
        &self,
        candidate_id: Option<&str>,
        run_id: Option<&str>,
    ) -> Vec<Evaluation> {
        let all: Vec<Evaluation> = self
            .evaluations
            .read()
            .await
            .values()
            .filter(|e| candidate_id.is_none_or(|c| e.candidate_id == c))
            .filter(|e| run_id.is_none_or(|r| e.run_id == r))
            .cloned()
            .collect();
        newest_first(all, |e: &Evaluation| (e.created_at, e.id.clone()))
    }

    // ---- Issues ----

    pub async fn create_issue(&self, new: NewIssue) -> Result<Issue> {
        self.require_project(&new.project_id).await?;
        let now = Utc::now();
        let issue = Issue {
            id: Uuid::new_v4().to_string(),
            project_id: new.project_id,
            run_id: new.run_id,
            candidate_id: new.candidate_id,
            issue_type: new.issue_type,
            severity: new.severity,
            description: new.description,
            resolution_status: IssueResolutionStatus::Open,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };
        self.issues
            .write()
            .await
            .insert(issue.id.clone(), issue.clone());
        self.flush().await?;
        Ok(issue)
    }

    pub async fn get_issue(&self, id: &str) -> Option<Issue> {
        self.issues.read().await.get(id).cloned()
    }

    pub async fn require_issue(&self, id: &str) -> Result<Issue> {
        self.get_issue(id)
            .await
            .ok_or_else(|| CrucibleError::not_found("Issue", id))
    }

    pub async fn update_issue(&self, id: &str, update: IssueUpdate) -> Result<Issue> {
        let issue = {
            let mut issues = self.issues.write().await;
            let issue = issues
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Issue", id))?;
            if let Some(description) = update.description {
                issue.description = description;
            }
            if let Some(status) = update.resolution_status {
                issue.resolution_status = status;
            }
            if let Some(resolved_at) = update.resolved_at {
                issue.resolved_at = Some(resolved_at);
            }
            issue.updated_at = Utc::now();
            issue.clone()
        };
        self.flush().await?;
        Ok(issue)
    }

    pub async fn list_issues(&self, project_id: Option<&str>) -> Vec<Issue> {
        let all: Vec<Issue> = self
            .issues
            .read()
            .await
            .values()
            .filter(|i| project_id.is_none_or(|p| i.project_id == p))
            .cloned()
            .collect();
        newest_first(all, |i: &Issue| (i.created_at, i.id.clone()))
    }

    // ---- Snapshots ----

    pub async fn create_snapshot(&self, new: NewSnapshot) -> Result<Snapshot> {
        self.require_project(&new.project_id).await?;
        let snapshot = {
            let mut snapshots = self.snapshots.write().await;
            if snapshots.values().any(|s| s.name == new.name) {
                return Err(CrucibleError::validation(format!(
                    "snapshot name already exists: {}",
                    new.name
                )));
            }
            let now = Utc::now();
            let snapshot = Snapshot {
                id: Uuid::new_v4().to_string(),
                project_id: new.project_id,
                run_id: new.run_id,
                name: new.name,
                description: new.description,
                tags: new.tags,
                snapshot_data: new.snapshot_data,
                reference_metrics: new.reference_metrics,
                invariants: new.invariants,
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            };
            snapshots.insert(snapshot.id.clone(), snapshot.clone());
            snapshot
        };
        self.flush().await?;
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.read().await.get(id).cloned()
    }

    pub async fn list_snapshots(&self) -> Vec<Snapshot> {
        let all = self.snapshots.read().await.values().cloned().collect();
        newest_first(all, |s: &Snapshot| (s.created_at, s.id.clone()))
    }

    /// `snapshot_data` is immutable after creation; only description, tags
    /// and invariants may change.
    pub async fn update_snapshot(
        &self,
        id: &str,
        description: Option<String>,
        tags: Option<Vec<String>>,
        invariants: Option<Vec<SnapshotInvariant>>,
    ) -> Result<Snapshot> {
        let snapshot = {
            let mut snapshots = self.snapshots.write().await;
            let snapshot = snapshots
                .get_mut(id)
                .ok_or_else(|| CrucibleError::not_found("Snapshot", id))?;
            if let Some(description) = description {
                snapshot.description = description;
            }
            if let Some(tags) = tags {
                snapshot.tags = tags;
            }
            if let Some(invariants) = invariants {
                snapshot.invariants = invariants;
            }
            snapshot.updated_at = Utc::now();
            snapshot.clone()
        };
        self.flush().await?;
        Ok(snapshot)
    }

    // ---- Chat sessions and messages ----

    pub async fn create_chat_session(
        &self,
        project_id: &str,
        title: Option<String>,
        mode: ChatSessionMode,
    ) -> Result<ChatSession> {
        self.require_project(project_id).await?;
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title,
            mode,
            run_id: None,
            candidate_id: None,
            created_at: now,
            updated_at: now,
        };
        self.chat_sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.flush().await?;
        Ok(session)
    }

    pub async fn list_chat_sessions(&self, project_id: Option<&str>) -> Vec<ChatSession> {
        let all: Vec<ChatSession> = self
            .chat_sessions
            .read()
            .await
            .values()
            .filter(|s| project_id.is_none_or(|p| s.project_id == p))
            .cloned()
            .collect();
        newest_first(all, |s: &ChatSession| (s.created_at, s.id.clone()))
    }

    pub async fn create_message(
        &self,
        chat_session_id: &str,
        role: MessageRole,
        content: impl Into<String>,
        metadata: Option<Value>,
    ) -> Result<Message> {
        if !self
            .chat_sessions
            .read()
            .await
            .contains_key(chat_session_id)
        {
            return Err(CrucibleError::not_found("ChatSession", chat_session_id));
        }
        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_session_id: chat_session_id.to_string(),
            role,
            content: content.into(),
            metadata,
            created_at: Utc::now(),
        };
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message.clone());
        self.flush().await?;
        Ok(message)
    }

    pub async fn get_message(&self, id: &str) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    /// Messages come back oldest-first so a thread reads top to bottom.
    pub async fn list_messages(&self, chat_session_id: &str) -> Vec<Message> {
        let mut all: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.chat_session_id == chat_session_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path()).await.expect("store");
        (dir, store)
    }

    fn spec_update() -> ProblemSpecUpdate {
        ProblemSpecUpdate {
            constraints: vec![Constraint {
                name: "safety".into(),
                description: "no harm".into(),
                weight: 100,
            }],
            goals: vec!["minimize cost".into()],
            resolution: ResolutionLevel::Medium,
            mode: RunMode::FullSearch,
            provenance_log: None,
        }
    }

    #[tokio::test]
    async fn run_status_machine_rejects_illegal_transitions() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let run = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("run");

        // created -> completed is not reachable without running first
        let err = store
            .update_run_status(&run.id, RunStatus::Completed, None, None)
            .await
            .err()
            .expect("error");
        assert!(matches!(err, CrucibleError::Validation(_)));

        store
            .update_run_status(&run.id, RunStatus::Running, Some(Utc::now()), None)
            .await
            .expect("running");
        store
            .update_run_status(&run.id, RunStatus::Completed, None, Some(Utc::now()))
            .await
            .expect("completed");

        // completed is sticky
        let err = store
            .update_run_status(&run.id, RunStatus::Failed, None, None)
            .await
            .err()
            .expect("sticky");
        assert!(matches!(err, CrucibleError::Validation(_)));
        let reloaded = store.get_run(&run.id).await.expect("run");
        assert_eq!(reloaded.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn run_can_fail_straight_from_created() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let run = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("run");
        let failed = store
            .update_run_status(&run.id, RunStatus::Failed, None, None)
            .await
            .expect("failed");
        assert_eq!(failed.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_evaluation_pairs_are_rejected() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let run = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("run");
        let candidate = store
            .create_candidate(NewCandidate {
                run_id: run.id.clone(),
                project_id: project.id.clone(),
                origin: CandidateOrigin::System,
                mechanism_description: "m".into(),
                predicted_effects: None,
                parent_ids: Vec::new(),
            })
            .await
            .expect("candidate");

        let new_eval = || NewEvaluation {
            candidate_id: candidate.id.clone(),
            run_id: run.id.clone(),
            scenario_id: "scenario-1".into(),
            p: MetricScore::overall(0.9),
            r: MetricScore::overall(0.5),
            constraint_satisfaction: Default::default(),
            explanation: String::new(),
        };

        store.create_evaluation(new_eval()).await.expect("first");
        let err = store.create_evaluation(new_eval()).await.err().expect("dup");
        assert!(matches!(err, CrucibleError::Validation(_)));
        assert_eq!(store.list_evaluations(None, Some(&run.id)).await.len(), 1);
    }

    #[tokio::test]
    async fn lists_come_back_newest_first() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let first = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("first");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("second");

        let runs = store.list_runs(Some(&project.id), None).await;
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].id, first.id);
    }

    #[tokio::test]
    async fn cache_invalidation_reloads_committed_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = Store::new(dir.path()).await.expect("writer");
        let reader = Store::new(dir.path()).await.expect("reader");

        let project = writer.create_project("p", None).await.expect("project");
        writer
            .upsert_problem_spec(&project.id, spec_update())
            .await
            .expect("spec");

        assert!(reader.get_problem_spec(&project.id).await.is_none());
        reader.invalidate_caches().await.expect("invalidate");
        assert!(reader.get_problem_spec(&project.id).await.is_some());
    }

    #[tokio::test]
    async fn project_deletion_cascades_to_children() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        store
            .upsert_problem_spec(&project.id, spec_update())
            .await
            .expect("spec");
        store
            .upsert_world_model(&project.id, json!({"actors": []}))
            .await
            .expect("model");
        let run = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("run");
        let candidate = store
            .create_candidate(NewCandidate {
                run_id: run.id.clone(),
                project_id: project.id.clone(),
                origin: CandidateOrigin::System,
                mechanism_description: "m".into(),
                predicted_effects: None,
                parent_ids: Vec::new(),
            })
            .await
            .expect("candidate");
        let session = store
            .create_chat_session(&project.id, None, ChatSessionMode::Setup)
            .await
            .expect("session");
        store
            .create_message(&session.id, MessageRole::User, "hi", None)
            .await
            .expect("message");

        assert!(store.delete_project(&project.id).await.expect("delete"));
        assert!(store.get_run(&run.id).await.is_none());
        assert!(store.get_candidate(&candidate.id).await.is_none());
        assert!(store.get_problem_spec(&project.id).await.is_none());
        assert!(store.get_world_model(&project.id).await.is_none());
        assert!(store.list_messages(&session.id).await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_names_are_unique_and_data_is_immutable() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let new_snapshot = |name: &str| NewSnapshot {
            project_id: project.id.clone(),
            run_id: None,
            name: name.to_string(),
            description: String::new(),
            tags: Vec::new(),
            snapshot_data: json!({"version": "1.0"}),
            reference_metrics: None,
            invariants: Vec::new(),
        };

        let snapshot = store
            .create_snapshot(new_snapshot("baseline"))
            .await
            .expect("snapshot");
        let err = store
            .create_snapshot(new_snapshot("baseline"))
            .await
            .err()
            .expect("duplicate name");
        assert!(matches!(err, CrucibleError::Validation(_)));

        let updated = store
            .update_snapshot(
                &snapshot.id,
                Some("regression baseline".into()),
                Some(vec!["nightly".into()]),
                None,
            )
            .await
            .expect("update");
        assert_eq!(updated.description, "regression baseline");
        assert_eq!(updated.snapshot_data, json!({"version": "1.0"}));
    }

    #[tokio::test]
    async fn error_summary_is_truncated_to_limit() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let run = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("run");
        let long = "x".repeat(2000);
        let updated = store
            .update_run_observability(
                &run.id,
                RunObservability {
                    error_summary: Some(long),
                    ..RunObservability::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(
            updated.error_summary.map(|s| s.len()),
            Some(ERROR_SUMMARY_MAX_CHARS)
        );
    }

    #[tokio::test]
    async fn scenario_suite_is_a_singleton_per_run() {
        let (_dir, store) = store().await;
        let project = store.create_project("p", None).await.expect("project");
        let run = store
            .create_run(&project.id, RunMode::FullSearch, RunConfig::default(), None)
            .await
            .expect("run");

        let scenario = |id: &str| Scenario {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            scenario_type: crucible_types::ScenarioType::NormalOperation,
            focus: String::new(),
            initial_state: None,
            events: None,
            expected_outcomes: None,
            weight: 1.0,
        };

        let first = store
            .upsert_scenario_suite(&run.id, vec![scenario("a")])
            .await
            .expect("first");
        let second = store
            .upsert_scenario_suite(&run.id, vec![scenario("b"), scenario("c")])
            .await
            .expect("second");
        assert_eq!(first.id, second.id);
        assert_eq!(
            store
                .get_scenario_suite(&run.id)
                .await
                .expect("suite")
                .scenarios
                .len(),
            2
        );
    }
}
