use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name reported for a face that did not clear the match threshold.
pub const UNKNOWN_NAME: &str = "unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-norm vector on either side yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Identifies the embedding space a roster was built in.
///
/// Embeddings from different models (or dimensions) are not comparable, so a
/// roster is always read and written against exactly one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model: String,
    pub dimension: usize,
}

impl ModelProfile {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
        }
    }
}

impl std::fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}-dim)", self.model, self.dimension)
    }
}

/// An enrolled person.
///
/// The person's id is its position in the roster and is not stored here;
/// see [`Roster`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub name: String,
    pub relation: String,
    pub enrolled_at: DateTime<Utc>,
    /// One embedding per enrollment photo that yielded a face. Never empty.
    pub embeddings: Vec<Embedding>,
}

/// Externally visible view of a person: embeddings are never exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonSummary {
    pub id: usize,
    pub name: String,
    pub relation: String,
}

/// Ordered sequence of enrolled persons. A person's id is its index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    persons: Vec<PersonRecord>,
}

impl Roster {
    pub fn new(persons: Vec<PersonRecord>) -> Self {
        Self { persons }
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&PersonRecord> {
        self.persons.get(id)
    }

    /// Persons paired with their current positional id.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PersonRecord)> {
        self.persons.iter().enumerate()
    }

    pub fn persons(&self) -> &[PersonRecord] {
        &self.persons
    }

    pub fn summaries(&self) -> Vec<PersonSummary> {
        self.iter()
            .map(|(id, p)| PersonSummary {
                id,
                name: p.name.clone(),
                relation: p.relation.clone(),
            })
            .collect()
    }

    /// Appends a person and returns its id.
    pub fn push(&mut self, person: PersonRecord) -> usize {
        self.persons.push(person);
        self.persons.len() - 1
    }

    /// Removes the person at `id`; later persons shift down by one.
    pub fn remove(&mut self, id: usize) -> Option<PersonRecord> {
        (id < self.persons.len()).then(|| self.persons.remove(id))
    }
}

/// Best roster entry for a query embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    pub person_id: usize,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// Classification of one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub name: String,
    pub relation: String,
    /// Best-effort similarity as a percentage in [0, 100], two decimals.
    pub confidence: f64,
}

impl RecognitionResult {
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_NAME && self.relation.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn person(name: &str) -> PersonRecord {
        PersonRecord {
            name: name.into(),
            relation: "family".into(),
            enrolled_at: Utc::now(),
            embeddings: vec![emb(&[1.0, 0.0])],
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[0.3, -1.2, 4.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_symmetric() {
        let a = emb(&[0.3, -1.2, 4.0]);
        let b = emb(&[2.0, 0.5, -0.7]);
        assert!((a.similarity(&b) - b.similarity(&a)).abs() < 1e-7);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
        assert_eq!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_similarity_ignores_magnitude() {
        let a = emb(&[1.0, 2.0, 3.0]);
        let b = emb(&[10.0, 20.0, 30.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_roster_remove_shifts_ids() {
        let mut roster = Roster::new(vec![person("p0"), person("p1"), person("p2")]);
        let removed = roster.remove(1).unwrap();
        assert_eq!(removed.name, "p1");

        let summaries = roster.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!((summaries[0].id, summaries[0].name.as_str()), (0, "p0"));
        assert_eq!((summaries[1].id, summaries[1].name.as_str()), (1, "p2"));
    }

    #[test]
    fn test_roster_remove_out_of_range() {
        let mut roster = Roster::new(vec![person("p0")]);
        assert!(roster.remove(1).is_none());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_roster_push_returns_position() {
        let mut roster = Roster::default();
        assert_eq!(roster.push(person("a")), 0);
        assert_eq!(roster.push(person("b")), 1);
    }
}
