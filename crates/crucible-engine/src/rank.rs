use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crucible_store::Store;
use crucible_types::{
    CandidateScores, CandidateStatus, ConstraintVerdict, CrucibleError, Evaluation, MetricScore,
    ProvenanceActor, ProvenanceEntry, RankingFactors, Result, Run,
};

const PROMISING_THRESHOLD: f64 = 0.8;
const UNDER_TEST_THRESHOLD: f64 = 0.5;
const HARD_CONSTRAINT_WEIGHT: u32 = 100;
const HIGH_WEIGHT: u32 = 50;
const MAX_FACTORS: usize = 4;
const MAX_EXPLANATION_SENTENCES: usize = 3;
const MAX_CONSTRAINT_EXPLANATIONS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub id: String,
    pub mechanism_description: String,
    pub scores: CandidateScores,
    pub status: CandidateStatus,
    pub has_hard_violation: bool,
    pub evaluation_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingPhaseResult {
    pub ranked_candidates: Vec<RankedCandidate>,
    pub count: usize,
    pub hard_constraint_violations: Vec<String>,
    pub duration_seconds: f64,
}

struct Aggregated {
    p: f64,
    r: f64,
    i: f64,
    constraints: BTreeMap<String, ConstraintVerdict>,
}

/// Mean-aggregate a candidate's evaluations: P and R default to 0.5 when no
/// evaluation carries them, I = P/R guarded against a zero denominator, and
/// per-constraint verdicts AND their satisfied flags.
fn aggregate_evaluations(evaluations: &[&Evaluation]) -> Aggregated {
    let p_scores: Vec<f64> = evaluations.iter().map(|e| e.p.overall).collect();
    let r_scores: Vec<f64> = evaluations.iter().map(|e| e.r.overall).collect();

    let p = mean_or_default(&p_scores);
    let r = mean_or_default(&r_scores);
    let i = if r > 0.0 { p / r } else { 0.0 };

    let mut satisfied: BTreeMap<String, bool> = BTreeMap::new();
    let mut scores: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut explanations: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for evaluation in evaluations {
        for (constraint_id, verdict) in &evaluation.constraint_satisfaction {
            let entry = satisfied.entry(constraint_id.clone()).or_insert(true);
            if !verdict.satisfied {
                *entry = false;
            }
            scores
                .entry(constraint_id.clone())
                .or_default()
                .push(verdict.score);
            if !verdict.explanation.is_empty() {
                explanations
                    .entry(constraint_id.clone())
                    .or_default()
                    .push(verdict.explanation.clone());
            }
        }
    }

    let constraints = satisfied
        .into_iter()
        .map(|(constraint_id, satisfied)| {
            let values = scores.remove(&constraint_id).unwrap_or_default();
            let mut distinct: Vec<String> = Vec::new();
            for explanation in explanations.remove(&constraint_id).unwrap_or_default() {
                if !distinct.contains(&explanation) {
                    distinct.push(explanation);
                }
                if distinct.len() == MAX_CONSTRAINT_EXPLANATIONS {
                    break;
                }
            }
            let verdict = ConstraintVerdict {
                satisfied,
                score: mean_or_default(&values),
                explanation: distinct.join("; "),
            };
            (constraint_id, verdict)
        })
        .collect();

    Aggregated {
        p,
        r,
        i,
        constraints,
    }
}

fn mean_or_default(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.5
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.5;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

fn status_for(i: f64, has_hard_violation: bool) -> CandidateStatus {
    if has_hard_violation {
        CandidateStatus::Rejected
    } else if i >= PROMISING_THRESHOLD {
        CandidateStatus::Promising
    } else if i >= UNDER_TEST_THRESHOLD {
        CandidateStatus::UnderTest
    } else {
        CandidateStatus::Weak
    }
}

fn hard_violation_names(
    constraints: &BTreeMap<String, ConstraintVerdict>,
    weights: &BTreeMap<String, u32>,
) -> Vec<String> {
    constraints
        .iter()
        .filter(|(constraint_id, verdict)| {
            weights.get(*constraint_id).copied().unwrap_or(0) >= HARD_CONSTRAINT_WEIGHT
                && !verdict.satisfied
        })
        .map(|(constraint_id, _)| constraint_id.clone())
        .collect()
}

fn position_sentence(index: usize, i: f64, ranked: &[RankedCandidate]) -> String {
    let rank = index + 1;
    if rank == 1 && ranked.len() > 1 {
        let next_i = ranked[1].scores.i_score();
        if next_i > 0.0 {
            let percent = ((i - next_i) / next_i * 100.0).abs();
            return format!("Ranked #1 with I={i:.2}, {percent:.0}% higher than #2.");
        }
    } else if rank > 1 {
        let prev_i = ranked[index - 1].scores.i_score();
        if prev_i > 0.0 {
            let percent = (prev_i - i) / prev_i * 100.0;
            return format!(
                "Ranked #{rank} with I={i:.2}, {percent:.0}% lower than #{}.",
                rank - 1
            );
        }
    }
    format!("Ranked #{rank} with I={i:.2}.")
}

fn quoted_name(factor: &str) -> Option<&str> {
    let start = factor.find('\'')?;
    let rest = &factor[start + 1..];
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

fn generate_explanation(
    index: usize,
    ranked: &[RankedCandidate],
    weights: &BTreeMap<String, u32>,
    median_p: f64,
    median_r: f64,
) -> (String, RankingFactors) {
    let entry = &ranked[index];
    let i = entry.scores.i_score();
    let p = entry.scores.p.as_ref().map(|m| m.overall).unwrap_or(0.5);
    let r = entry.scores.r.as_ref().map(|m| m.overall).unwrap_or(0.5);

    let hard_violations = hard_violation_names(&entry.scores.constraint_satisfaction, weights);

    let mut positive_factors: Vec<String> = Vec::new();
    let mut negative_factors: Vec<String> = Vec::new();

    for name in &hard_violations {
        negative_factors.push(format!("Violates hard constraint '{name}'"));
    }

    for (constraint_id, verdict) in &entry.scores.constraint_satisfaction {
        let weight = weights.get(constraint_id).copied().unwrap_or(0);
        if weight < HIGH_WEIGHT {
            continue;
        }
        if verdict.satisfied && verdict.score > 0.8 {
            if weight >= HARD_CONSTRAINT_WEIGHT {
                positive_factors.push(format!("Satisfies hard constraint '{constraint_id}'"));
            } else {
                positive_factors
                    .push(format!("Satisfies high-weight constraint '{constraint_id}'"));
            }
        } else if (!verdict.satisfied || verdict.score < 0.5)
            && !hard_violations.contains(constraint_id)
        {
            negative_factors.push(format!("Weak on constraint '{constraint_id}'"));
        }
    }

    if p > median_p {
        positive_factors.push("High prediction quality".to_string());
    } else if p < median_p {
        negative_factors.push("Low prediction quality".to_string());
    }
    if r < median_r {
        positive_factors.push("Low resource cost".to_string());
    } else if r > median_r {
        negative_factors.push("High resource cost".to_string());
    }

    // Hard violations stay at the front of the negatives.
    negative_factors.sort_by_key(|factor| {
        (
            !factor.starts_with("Violates hard"),
            factor.clone(),
        )
    });
    negative_factors.truncate(MAX_FACTORS);
    positive_factors.truncate(MAX_FACTORS);

    let mut sentences = vec![position_sentence(index, i, ranked)];

    if !hard_violations.is_empty() {
        let names = hard_violations
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ");
        if hard_violations.len() == 1 {
            sentences.push(format!("Violates hard constraint {names}."));
        } else {
            sentences.push(format!("Violates hard constraints {names}."));
        }
    }

    if p > 0.7 && r < 0.4 {
        sentences.push(format!(
            "High prediction quality (P={p:.2}) with low cost (R={r:.2})."
        ));
    } else if p > 0.7 {
        sentences.push(format!(
            "High prediction quality (P={p:.2}) with moderate cost (R={r:.2})."
        ));
    } else if p < 0.4 {
        sentences.push(format!(
            "Low prediction quality (P={p:.2}) but low cost (R={r:.2})."
        ));
    }

    if let Some(strength) = positive_factors
        .iter()
        .find(|factor| factor.starts_with("Satisfies"))
        .and_then(|factor| quoted_name(factor))
    {
        sentences.push(format!("Excels at satisfying constraint '{strength}'."));
    }

    sentences.truncate(MAX_EXPLANATION_SENTENCES);

    (
        sentences.join(" "),
        RankingFactors {
            top_positive_factors: positive_factors,
            top_negative_factors: negative_factors,
        },
    )
}

/// Aggregate each candidate's evaluations, compute I = P/R, flag hard
/// violations, persist scores and statuses, then synthesize per-candidate
/// ranking explanations against the sorted list.
pub(crate) async fn run_ranking_phase(store: &Store, run: &Run) -> Result<RankingPhaseResult> {
    let started = Instant::now();

    let problem_spec = store
        .get_problem_spec(&run.project_id)
        .await
        .ok_or_else(|| {
            CrucibleError::precondition(format!(
                "ProblemSpec not found for project {}",
                run.project_id
            ))
        })?;
    let weights = problem_spec.constraint_weights();

    let mut candidates = store.list_candidates(Some(&run.id), None).await;
    if candidates.is_empty() {
        return Err(CrucibleError::precondition(format!(
            "No candidates found for run {}",
            run.id
        )));
    }
    // Chronological order: a stable descending sort then preserves insertion
    // order for equal I scores.
    candidates.reverse();

    let evaluations = store.list_evaluations(None, Some(&run.id)).await;
    if evaluations.is_empty() {
        return Err(CrucibleError::precondition(format!(
            "No evaluations found for run {}",
            run.id
        )));
    }
    let total_evaluations = evaluations.len();

    let mut by_candidate: HashMap<&str, Vec<&Evaluation>> = HashMap::new();
    for evaluation in &evaluations {
        by_candidate
            .entry(evaluation.candidate_id.as_str())
            .or_default()
            .push(evaluation);
    }

    let mut ranked: Vec<RankedCandidate> = Vec::new();
    let mut hard_constraint_violations: Vec<String> = Vec::new();

    for candidate in &candidates {
        let Some(candidate_evaluations) = by_candidate.get(candidate.id.as_str()) else {
            warn!(candidate_id = %candidate.id, "no evaluations for candidate; skipping");
            continue;
        };

        let aggregated = aggregate_evaluations(candidate_evaluations);
        let has_hard_violation =
            !hard_violation_names(&aggregated.constraints, &weights).is_empty();

        let scores = CandidateScores {
            p: Some(MetricScore {
                overall: aggregated.p,
                components: Some(json!({
                    "prediction_accuracy": aggregated.p,
                    "scenario_coverage": candidate_evaluations.len() as f64
                        / total_evaluations as f64,
                })),
            }),
            r: Some(MetricScore {
                overall: aggregated.r,
                components: Some(json!({
                    "cost": aggregated.r,
                    "complexity": aggregated.r,
                    "resource_usage": aggregated.r,
                })),
            }),
            i: Some(aggregated.i),
            constraint_satisfaction: aggregated.constraints,
            ranking_explanation: None,
            ranking_factors: None,
        };

        store
            .update_candidate_scores(&candidate.id, scores.clone())
            .await?;

        let status = status_for(aggregated.i, has_hard_violation);
        if has_hard_violation {
            hard_constraint_violations.push(candidate.id.clone());
        }
        store.update_candidate_status(&candidate.id, status).await?;

        let entry = ProvenanceEntry::new("ranking", ProvenanceActor::System)
            .source(format!("run:{}", run.id))
            .description(format!(
                "Ranker computed I={:.2} and set status to {}",
                aggregated.i, status
            ))
            .reference_ids([run.id.clone(), candidate.id.clone()])
            .metadata(json!({
                "scores": scores,
                "has_hard_violation": has_hard_violation,
                "evaluation_count": candidate_evaluations.len(),
            }));
        store.append_candidate_provenance(&candidate.id, entry).await?;

        ranked.push(RankedCandidate {
            id: candidate.id.clone(),
            mechanism_description: candidate.mechanism_description.clone(),
            scores,
            status,
            has_hard_violation,
            evaluation_count: candidate_evaluations.len(),
        });
    }

    // Stable sort: ties keep the order candidates were created in.
    ranked.sort_by(|a, b| {
        b.scores
            .i_score()
            .partial_cmp(&a.scores.i_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let p_values: Vec<f64> = ranked
        .iter()
        .map(|c| c.scores.p.as_ref().map(|m| m.overall).unwrap_or(0.5))
        .collect();
    let r_values: Vec<f64> = ranked
        .iter()
        .map(|c| c.scores.r.as_ref().map(|m| m.overall).unwrap_or(0.5))
        .collect();
    let median_p = median(&p_values);
    let median_r = median(&r_values);

    for index in 0..ranked.len() {
        let (explanation, factors) =
            generate_explanation(index, &ranked, &weights, median_p, median_r);
        let entry = &mut ranked[index];
        entry.scores.ranking_explanation = Some(explanation);
        entry.scores.ranking_factors = Some(factors);
        store
            .update_candidate_scores(&entry.id, entry.scores.clone())
            .await?;
    }

    let count = ranked.len();
    info!(
        run_id = %run.id,
        candidates_ranked = count,
        hard_violations = hard_constraint_violations.len(),
        "ranking phase finished"
    );

    Ok(RankingPhaseResult {
        ranked_candidates: ranked,
        count,
        hard_constraint_violations,
        duration_seconds: started.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn evaluation(p: f64, r: f64, verdicts: &[(&str, bool, f64, &str)]) -> Evaluation {
        Evaluation {
            id: "e".into(),
            candidate_id: "c".into(),
            run_id: "r".into(),
            scenario_id: "s".into(),
            p: MetricScore::overall(p),
            r: MetricScore::overall(r),
            constraint_satisfaction: verdicts
                .iter()
                .map(|(name, satisfied, score, explanation)| {
                    (
                        (*name).to_string(),
                        ConstraintVerdict {
                            satisfied: *satisfied,
                            score: *score,
                            explanation: (*explanation).to_string(),
                        },
                    )
                })
                .collect(),
            explanation: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn aggregation_averages_and_ands_constraints() {
        let a = evaluation(0.9, 0.5, &[("safety", true, 0.9, "clean")]);
        let b = evaluation(0.7, 0.3, &[("safety", false, 0.3, "breach")]);
        let aggregated = aggregate_evaluations(&[&a, &b]);
        assert!((aggregated.p - 0.8).abs() < 1e-9);
        assert!((aggregated.r - 0.4).abs() < 1e-9);
        assert!((aggregated.i - 2.0).abs() < 1e-9);
        let verdict = &aggregated.constraints["safety"];
        assert!(!verdict.satisfied);
        assert!((verdict.score - 0.6).abs() < 1e-9);
        assert_eq!(verdict.explanation, "clean; breach");
    }

    #[test]
    fn i_is_zero_when_r_is_zero() {
        let a = evaluation(0.9, 0.0, &[]);
        let aggregated = aggregate_evaluations(&[&a]);
        assert_eq!(aggregated.i, 0.0);
    }

    #[test]
    fn constraint_explanations_are_distinct_and_capped() {
        let evals: Vec<Evaluation> = (0..5)
            .map(|idx| {
                let text = if idx < 3 { "same" } else { "other" };
                evaluation(0.5, 0.5, &[("c", true, 0.5, text)])
            })
            .collect();
        let refs: Vec<&Evaluation> = evals.iter().collect();
        let aggregated = aggregate_evaluations(&refs);
        assert_eq!(aggregated.constraints["c"].explanation, "same; other");
    }

    #[test]
    fn status_thresholds_match_the_ladder() {
        assert_eq!(status_for(0.85, false), CandidateStatus::Promising);
        assert_eq!(status_for(0.8, false), CandidateStatus::Promising);
        assert_eq!(status_for(0.6, false), CandidateStatus::UnderTest);
        assert_eq!(status_for(0.2, false), CandidateStatus::Weak);
        assert_eq!(status_for(5.0, true), CandidateStatus::Rejected);
    }

    #[test]
    fn median_handles_even_and_odd_sets() {
        assert_eq!(median(&[0.1, 0.9]), 0.5);
        assert_eq!(median(&[0.1, 0.5, 0.9]), 0.5);
        assert_eq!(median(&[]), 0.5);
    }

    fn ranked_entry(id: &str, i: f64) -> RankedCandidate {
        RankedCandidate {
            id: id.into(),
            mechanism_description: String::new(),
            scores: CandidateScores {
                p: Some(MetricScore::overall(0.5)),
                r: Some(MetricScore::overall(0.5)),
                i: Some(i),
                ..CandidateScores::default()
            },
            status: CandidateStatus::UnderTest,
            has_hard_violation: false,
            evaluation_count: 1,
        }
    }

    #[test]
    fn leader_explanation_names_the_gap_to_second_place() {
        let ranked = vec![ranked_entry("a", 1.8), ranked_entry("b", 0.9)];
        let sentence = position_sentence(0, 1.8, &ranked);
        assert_eq!(sentence, "Ranked #1 with I=1.80, 100% higher than #2.");
    }

    #[test]
    fn percent_clause_is_omitted_when_neighbour_scores_zero() {
        let ranked = vec![ranked_entry("a", 1.8), ranked_entry("b", 0.0)];
        assert_eq!(position_sentence(0, 1.8, &ranked), "Ranked #1 with I=1.80.");
        assert_eq!(
            position_sentence(1, 0.0, &ranked),
            "Ranked #2 with I=0.00, 100% lower than #1."
        );
    }

    #[test]
    fn quoted_name_pulls_the_constraint_out_of_a_factor() {
        assert_eq!(
            quoted_name("Satisfies hard constraint 'safety'"),
            Some("safety")
        );
        assert_eq!(quoted_name("High prediction quality"), None);
    }
}
