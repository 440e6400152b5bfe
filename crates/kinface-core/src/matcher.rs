//! Query-vs-roster matching and the accept/reject decision.

use crate::types::{
    Embedding, MatchCandidate, PersonRecord, RecognitionResult, Roster, UNKNOWN_NAME,
};

/// Similarity a person's best score must strictly exceed to be accepted.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for finding the closest enrolled person to a probe embedding.
pub trait Matcher {
    /// Returns the best candidate, or `None` when the roster is empty.
    fn best_match(&self, probe: &Embedding, roster: &Roster) -> Option<MatchCandidate>;
}

/// Cosine matcher over multi-embedding person records.
///
/// A person scores the maximum similarity over all of their enrollment
/// embeddings. The highest-scoring person wins; on equal scores the lowest
/// id (earliest enrolled) is kept.
pub struct CosineMatcher;

impl CosineMatcher {
    /// Best similarity between `probe` and any of the person's embeddings.
    pub fn person_score(probe: &Embedding, person: &PersonRecord) -> f32 {
        person
            .embeddings
            .iter()
            .map(|e| probe.similarity(e))
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, roster: &Roster) -> Option<MatchCandidate> {
        let mut best: Option<MatchCandidate> = None;

        // Strict `>` keeps the first (lowest id) person on ties.
        for (person_id, person) in roster.iter() {
            let similarity = Self::person_score(probe, person);
            let is_better = match best {
                None => true,
                Some(prev) => similarity > prev.similarity,
            };
            if is_better {
                best = Some(MatchCandidate {
                    person_id,
                    similarity,
                });
            }
        }

        if let Some(candidate) = best {
            tracing::trace!(
                person_id = candidate.person_id,
                similarity = candidate.similarity,
                "best roster candidate"
            );
        }
        best
    }
}

/// Similarity as a percentage rounded to two decimals, floored at zero.
pub fn confidence_percent(similarity: f32) -> f64 {
    let pct = f64::from(similarity.max(0.0)) * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Apply the threshold to a candidate and name the result.
///
/// Confidence is reported on both branches: an unknown face still carries
/// its best-effort similarity.
pub fn classify(candidate: MatchCandidate, roster: &Roster, threshold: f32) -> RecognitionResult {
    let confidence = confidence_percent(candidate.similarity);
    match roster.get(candidate.person_id) {
        Some(person) if candidate.similarity > threshold => RecognitionResult {
            name: person.name.clone(),
            relation: person.relation.clone(),
            confidence,
        },
        _ => RecognitionResult {
            name: UNKNOWN_NAME.to_string(),
            relation: String::new(),
            confidence,
        },
    }
}
