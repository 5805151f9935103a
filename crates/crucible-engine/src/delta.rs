use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crucible_types::{ProblemSpec, WorldModelChange};

pub const WORLD_MODEL_SECTIONS: [&str; 6] = [
    "actors",
    "mechanisms",
    "resources",
    "constraints",
    "assumptions",
    "simplifications",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintDeltaItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintsDelta {
    pub added: Vec<ConstraintDeltaItem>,
    pub updated: Vec<ConstraintDeltaItem>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalsDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecDelta {
    pub touched_sections: Vec<String>,
    pub constraints: ConstraintsDelta,
    pub goals: GoalsDelta,
    pub resolution_changed: bool,
    pub mode_changed: bool,
}

/// Structured diff between two problem specs. Constraints are keyed by name;
/// goals are compared as sets, so reordering alone changes nothing.
pub fn compute_spec_delta(current: Option<&ProblemSpec>, updated: &ProblemSpec) -> SpecDelta {
    let mut delta = SpecDelta::default();
    let mut touched: Vec<String> = Vec::new();

    let current_constraints: BTreeMap<&str, _> = current
        .map(|spec| {
            spec.constraints
                .iter()
                .map(|c| (c.name.as_str(), c))
                .collect()
        })
        .unwrap_or_default();
    let updated_constraints: BTreeMap<&str, _> = updated
        .constraints
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();

    for (name, constraint) in &updated_constraints {
        match current_constraints.get(name) {
            None => {
                delta.constraints.added.push(ConstraintDeltaItem {
                    name: (*name).to_string(),
                    description: constraint.description.clone(),
                });
                touched.push("constraints".to_string());
            }
            Some(existing) => {
                if existing.description != constraint.description
                    || existing.weight != constraint.weight
                {
                    delta.constraints.updated.push(ConstraintDeltaItem {
                        name: (*name).to_string(),
                        description: constraint.description.clone(),
                    });
                    touched.push("constraints".to_string());
                }
            }
        }
    }
    for name in current_constraints.keys() {
        if !updated_constraints.contains_key(name) {
            delta.constraints.removed.push((*name).to_string());
            touched.push("constraints".to_string());
        }
    }

    let current_goals: std::collections::BTreeSet<&str> = current
        .map(|spec| spec.goals.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let updated_goals: std::collections::BTreeSet<&str> =
        updated.goals.iter().map(String::as_str).collect();

    for goal in updated_goals.difference(&current_goals) {
        delta.goals.added.push((*goal).to_string());
    }
    for goal in current_goals.difference(&updated_goals) {
        delta.goals.removed.push((*goal).to_string());
    }
    if !delta.goals.added.is_empty() || !delta.goals.removed.is_empty() {
        touched.push("goals".to_string());
    }

    if current.map(|spec| spec.resolution) != Some(updated.resolution) {
        delta.resolution_changed = true;
        touched.push("resolution".to_string());
    }
    if current.map(|spec| spec.mode) != Some(updated.mode) {
        delta.mode_changed = true;
        touched.push("mode".to_string());
    }

    touched.sort();
    touched.dedup();
    delta.touched_sections = touched;
    delta
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionDelta {
    pub added: Vec<SectionItem>,
    pub modified: Vec<SectionItem>,
    pub removed: Vec<SectionItem>,
    /// Set only by the length heuristic, which can classify a section but
    /// cannot name the items that changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred: Option<DeltaKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldModelDelta {
    pub touched_sections: Vec<String>,
    pub sections: BTreeMap<String, SectionDelta>,
}

fn section_for_entity_type(entity_type: &str) -> Option<&'static str> {
    match entity_type.to_ascii_lowercase().as_str() {
        "actor" | "actors" => Some("actors"),
        "mechanism" | "mechanisms" => Some("mechanisms"),
        "resource" | "resources" => Some("resources"),
        "constraint" | "constraints" => Some("constraints"),
        "assumption" | "assumptions" => Some("assumptions"),
        "simplification" | "simplifications" => Some("simplifications"),
        _ => None,
    }
}

/// Classify world-model changes per section. Structured `changes` from the
/// agent are authoritative; without them the per-section length heuristic
/// marks the section touched with an inferred kind and no item detail.
pub fn compute_world_model_delta(
    current: Option<&Value>,
    updated: &Value,
    changes: &[WorldModelChange],
) -> WorldModelDelta {
    let mut delta = WorldModelDelta::default();
    if updated.is_null() {
        return delta;
    }

    if !changes.is_empty() {
        for change in changes {
            let Some(section) = section_for_entity_type(&change.entity_type) else {
                continue;
            };
            let entry = delta.sections.entry(section.to_string()).or_default();
            let item = SectionItem {
                id: change.entity_id.clone(),
                name: change
                    .name
                    .clone()
                    .unwrap_or_else(|| change.entity_id.clone()),
            };
            match change.change_type.to_ascii_lowercase().as_str() {
                "add" | "added" | "create" => entry.added.push(item),
                "remove" | "removed" | "delete" => entry.removed.push(item),
                _ => entry.modified.push(item),
            }
            if !delta.touched_sections.contains(&section.to_string()) {
                delta.touched_sections.push(section.to_string());
            }
        }
        return delta;
    }

    let empty = Value::Null;
    let current = current.unwrap_or(&empty);
    for section in WORLD_MODEL_SECTIONS {
        let current_items = current.get(section).and_then(|v| v.as_array());
        let updated_items = updated.get(section).and_then(|v| v.as_array());
        if current_items == updated_items {
            continue;
        }
        let current_len = current_items.map(|v| v.len()).unwrap_or(0);
        let updated_len = updated_items.map(|v| v.len()).unwrap_or(0);
        let kind = match updated_len.cmp(&current_len) {
            std::cmp::Ordering::Greater => DeltaKind::Added,
            std::cmp::Ordering::Less => DeltaKind::Removed,
            std::cmp::Ordering::Equal => DeltaKind::Modified,
        };
        delta.sections.insert(
            section.to_string(),
            SectionDelta {
                inferred: Some(kind),
                ..SectionDelta::default()
            },
        );
        delta.touched_sections.push(section.to_string());
    }
    delta
}
