use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crucible_types::{CrucibleError, Result, SafeDefault};

/// Names of the agents reachable through the gateway.
pub mod agent_names {
    pub const PROBLEM_SPEC: &str = "problem_spec";
    pub const WORLD_MODELLER: &str = "world_modeller";
    pub const DESIGNER: &str = "designer";
    pub const SCENARIO_GENERATOR: &str = "scenario_generator";
    pub const EVALUATOR: &str = "evaluator";
    pub const FEEDBACK: &str = "feedback";
    pub const GUIDANCE: &str = "guidance";

    pub const ALL: [&str; 7] = [
        PROBLEM_SPEC,
        WORLD_MODELLER,
        DESIGNER,
        SCENARIO_GENERATOR,
        EVALUATOR,
        FEEDBACK,
        GUIDANCE,
    ];
}

const RAW_LOG_PREFIX_CHARS: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub call_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, u64>,
}

/// Aggregate usage entries into a single summary; `None` when nothing was
/// recorded so absent telemetry never shows up as zeros.
pub fn aggregate_usage<'a, I>(entries: I) -> Option<UsageSummary>
where
    I: IntoIterator<Item = Option<&'a AgentUsage>>,
{
    let entries: Vec<&AgentUsage> = entries.into_iter().flatten().collect();
    if entries.is_empty() {
        return None;
    }

    let mut summary = UsageSummary {
        call_count: entries.len(),
        ..UsageSummary::default()
    };
    let mut cost_total = 0.0;
    let mut cost_seen = false;

    for entry in entries {
        summary.input_tokens += entry.input_tokens;
        summary.output_tokens += entry.output_tokens;
        summary.total_tokens += entry.total_tokens;
        if let Some(cost) = entry.cost_usd {
            cost_seen = true;
            cost_total += cost;
        }
        if let Some(provider) = &entry.provider {
            *summary.providers.entry(provider.clone()).or_default() += 1;
        }
        if let Some(model) = &entry.model {
            *summary.models.entry(model.clone()).or_default() += 1;
        }
    }

    if cost_seen {
        summary.cost_usd = Some((cost_total * 1e6).round() / 1e6);
    }
    Some(summary)
}

/// Merge per-phase summaries into a run-level total.
pub fn merge_usage_summaries<'a, I>(summaries: I) -> Option<UsageSummary>
where
    I: IntoIterator<Item = &'a UsageSummary>,
{
    let mut merged = UsageSummary::default();
    let mut cost_total = 0.0;
    let mut cost_seen = false;
    let mut any = false;

    for summary in summaries {
        any = true;
        merged.input_tokens += summary.input_tokens;
        merged.output_tokens += summary.output_tokens;
        merged.total_tokens += summary.total_tokens;
        merged.call_count += summary.call_count;
        if let Some(cost) = summary.cost_usd {
            cost_seen = true;
            cost_total += cost;
        }
        for (provider, count) in &summary.providers {
            *merged.providers.entry(provider.clone()).or_default() += count;
        }
        for (model, count) in &summary.models {
            *merged.models.entry(model.clone()).or_default() += count;
        }
    }

    if !any {
        return None;
    }
    if cost_seen {
        merged.cost_usd = Some((cost_total * 1e6).round() / 1e6);
    }
    Some(merged)
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: String,
    pub usage: Option<AgentUsage>,
}

/// An opaque agent: takes a task object, returns text that should contain a
/// JSON object. All LLM-flavoured malformedness is handled by the gateway;
/// services above it only ever see structured data.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, task: &Value) -> anyhow::Result<AgentReply>;
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the full LLM-backed roster from one transport config.
    pub fn from_llm_config(config: &LlmAgentConfig) -> Self {
        let mut registry = Self::new();
        let client = Client::new();
        for name in agent_names::ALL {
            registry.register(Arc::new(LlmAgent::new(name, config.clone(), client.clone())));
        }
        registry
    }
}

/// Outcome of a gateway invocation. `parse_failed` is the non-throwing
/// channel through which extraction failures are reported: the value is the
/// agent's documented safe default and callers proceed with degraded quality.
#[derive(Debug, Clone)]
pub struct AgentOutcome<T> {
    pub value: T,
    pub usage: Option<AgentUsage>,
    pub parse_failed: bool,
}

#[derive(Clone, Default)]
pub struct AgentGateway {
    registry: AgentRegistry,
}

impl AgentGateway {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub async fn invoke<T>(&self, agent_name: &str, task: &Value) -> Result<AgentOutcome<T>>
    where
        T: DeserializeOwned + SafeDefault,
    {
        let agent = self.registry.get(agent_name).ok_or_else(|| {
            CrucibleError::agent_failure(agent_name, "agent is not registered with the gateway")
        })?;

        let reply = agent
            .execute(task)
            .await
            .map_err(|err| CrucibleError::agent_failure(agent_name, err.to_string()))?;

        let parsed = extract_json(&reply.content)
            .and_then(|value| serde_json::from_value::<T>(value).ok());
        let (value, parse_failed) = match parsed {
            Some(value) => (value, false),
            None => {
                let prefix: String = reply.content.chars().take(RAW_LOG_PREFIX_CHARS).collect();
                warn!(
                    agent = agent_name,
                    raw_prefix = %prefix,
                    "failed to extract structured JSON from agent response; using safe default"
                );
                (T::safe_default(), true)
            }
        };

        Ok(AgentOutcome {
            value,
            usage: reply.usage,
            parse_failed,
        })
    }
}

/// Pull a JSON object out of agent text: bare JSON, a ```json fence, or the
/// first unlabelled fence. The first matching fence wins.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    let candidate = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let end = rest.find("```")?;
        rest[..end].trim()
    } else if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let end = rest.find("```")?;
        rest[..end].trim()
    } else {
        trimmed
    };

    serde_json::from_str::<Value>(candidate).ok()
}

#[derive(Debug, Clone)]
pub struct LlmAgentConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub provider_id: String,
}

impl Default for LlmAgentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            provider_id: "openai".to_string(),
        }
    }
}

/// OpenAI-compatible chat-completions agent. The task object is embedded in
/// the prompt verbatim; the response is expected to be a single JSON object.
pub struct LlmAgent {
    name: String,
    instructions: &'static str,
    config: LlmAgentConfig,
    client: Client,
}

impl LlmAgent {
    pub fn new(name: &str, config: LlmAgentConfig, client: Client) -> Self {
        Self {
            name: name.to_string(),
            instructions: instructions_for(name),
            config,
            client,
        }
    }

    fn build_prompt(&self, task: &Value) -> String {
        let task_body =
            serde_json::to_string_pretty(task).unwrap_or_else(|_| task.to_string());
        format!(
            "{}\n\nTask:\n{}\n\nRespond with a single JSON object and nothing else.",
            self.instructions, task_body
        )
    }
}

fn instructions_for(name: &str) -> &'static str {
    match name {
        agent_names::PROBLEM_SPEC => {
            "You refine problem specifications. Given conversation context and the current spec, \
             propose an updated spec with `constraints`, `goals`, `resolution` and `mode`, plus \
             `follow_up_questions`, `reasoning` and `ready_to_run`."
        }
        agent_names::WORLD_MODELLER => {
            "You maintain a structured world model with actors, mechanisms, resources, \
             constraints, assumptions and simplifications. Return `updated_model`, a `changes` \
             list with type/entity_type/entity_id/description, `reasoning` and `ready_to_run`."
        }
        agent_names::DESIGNER => {
            "You generate diverse candidate solutions from a world model. Propose distinct \
             mechanisms, not small variants. Return `candidates` (each with \
             `mechanism_description`, `predicted_effects`, `constraint_compliance`, `reasoning`, \
             optional `parent_ids`) and an overall `reasoning`."
        }
        agent_names::SCENARIO_GENERATOR => {
            "You design test scenarios covering stress tests, edge cases, normal operation and \
             failure modes. Return `scenarios` (id, name, description, type, focus, \
             initial_state, events, expected_outcomes, weight in [0,1]) and `reasoning`."
        }
        agent_names::EVALUATOR => {
            "You evaluate one candidate against one scenario. Return `P` and `R` objects with an \
             `overall` score in [0,1] and optional components, `constraint_satisfaction` mapping \
             constraint ids to {satisfied, score, explanation}, and an `explanation`."
        }
        agent_names::FEEDBACK => {
            "You analyse an issue and its context and propose a remediation. Return \
             `feedback_message`, `clarifying_questions`, `remediation_proposal` and \
             `needs_clarification`."
        }
        agent_names::GUIDANCE => {
            "You advise on next steps for a project. Return `guidance_message`, \
             `suggested_actions` and `reasoning`."
        }
        _ => "Respond to the task with a single JSON object.",
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Value) -> anyhow::Result<AgentReply> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": "Always respond with valid JSON only."},
                {"role": "user", "content": self.build_prompt(task)},
            ],
            "stream": false,
        });

        let mut request = self.client.post(url).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_api_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_api_error(&value) {
            anyhow::bail!(detail);
        }

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "provider returned no completion content (response: {})",
                    truncate_for_error(&value.to_string(), RAW_LOG_PREFIX_CHARS)
                )
            })?;

        let usage = extract_usage(&value, &self.config);
        Ok(AgentReply { content, usage })
    }
}

fn extract_api_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_usage(value: &Value, config: &LlmAgentConfig) -> Option<AgentUsage> {
    let usage = value.get("usage")?;
    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(input_tokens.saturating_add(output_tokens));
    Some(AgentUsage {
        input_tokens,
        output_tokens,
        total_tokens,
        cost_usd: None,
        model: Some(config.model.clone()),
        provider: Some(config.provider_id.clone()),
    })
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        input.to_string()
    } else {
        let prefix: String = input.chars().take(max_len).collect();
        format!("{prefix}...")
    }
}

type ScriptFn = dyn Fn(&Value) -> anyhow::Result<String> + Send + Sync;

/// Deterministic agent for tests and offline runs: a closure maps the task
/// object to the reply text.
pub struct ScriptedAgent {
    name: String,
    script: Box<ScriptFn>,
    usage: Option<AgentUsage>,
}

impl ScriptedAgent {
    pub fn new<F>(name: &str, script: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            usage: Some(AgentUsage {
                input_tokens: 100,
                output_tokens: 50,
                total_tokens: 150,
                cost_usd: Some(0.0005),
                model: Some("scripted-1".to_string()),
                provider: Some("scripted".to_string()),
            }),
        }
    }

    pub fn without_usage(mut self) -> Self {
        self.usage = None;
        self
    }

    /// An agent whose transport always fails, for failure-containment tests.
    pub fn erroring(name: &str, message: &str) -> Self {
        let message = message.to_string();
        let mut agent = Self::new(name, move |_| anyhow::bail!("{message}"));
        agent.usage = None;
        agent
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Value) -> anyhow::Result<AgentReply> {
        let content = (self.script)(task)?;
        Ok(AgentReply {
            content,
            usage: self.usage.clone(),
        })
    }
}
