use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceActor {
    User,
    Agent,
    System,
}

impl ProvenanceActor {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvenanceActor::User => "user",
            ProvenanceActor::Agent => "agent",
            ProvenanceActor::System => "system",
        }
    }
}

/// One append-only audit event attached to an entity or embedded in a
/// WorldModel blob. Entries are never modified or deleted after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub timestamp: String,
    pub actor: ProvenanceActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ProvenanceEntry {
    pub fn new(entry_type: impl Into<String>, actor: ProvenanceActor) -> Self {
        Self {
            entry_type: entry_type.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            actor,
            source: None,
            description: None,
            reference_ids: Vec::new(),
            metadata: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn reference_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reference_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceLastEvent {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub timestamp: String,
    pub actor: ProvenanceActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Lightweight summary for UI and API listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceSummary {
    pub event_count: usize,
    pub last_event: ProvenanceLastEvent,
}

pub fn summarize_provenance_log(log: &[ProvenanceEntry]) -> Option<ProvenanceSummary> {
    let last = log.last()?;
    Some(ProvenanceSummary {
        event_count: log.len(),
        last_event: ProvenanceLastEvent {
            entry_type: last.entry_type.clone(),
            timestamp: last.timestamp.clone(),
            actor: last.actor,
            description: last.description.clone(),
            source: last.source.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let entry = ProvenanceEntry::new("ranking", ProvenanceActor::System)
            .source("run:r1")
            .description("Ranker computed I=1.80")
            .reference_ids(["r1", "c1"]);
        assert_eq!(entry.entry_type, "ranking");
        assert_eq!(entry.source.as_deref(), Some("run:r1"));
        assert_eq!(entry.reference_ids, vec!["r1", "c1"]);
        assert!(entry.timestamp.ends_with('Z'));
    }

    #[test]
    fn summary_reports_last_event_and_count() {
        let log = vec![
            ProvenanceEntry::new("design", ProvenanceActor::Agent),
            ProvenanceEntry::new("ranking", ProvenanceActor::System).description("done"),
        ];
        let summary = summarize_provenance_log(&log).expect("summary");
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.last_event.entry_type, "ranking");
        assert_eq!(summary.last_event.description.as_deref(), Some("done"));
    }

    #[test]
    fn summary_is_none_for_empty_log() {
        assert!(summarize_provenance_log(&[]).is_none());
    }
}
