//! Enrollment: images → embeddings → a new roster record.

use crate::embedder::Embedder;
use crate::store::{RosterStore, StoreError};
use crate::types::{Embedding, PersonRecord};
use chrono::Utc;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("relation must not be empty")]
    EmptyRelation,
    #[error("at least one image is required")]
    NoImages,
    #[error("no face detected in any of the {images} supplied images")]
    NoFaceDetected { images: usize },
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("roster store: {0}")]
    Store(#[from] StoreError),
}

impl EnrollmentError {
    /// Missing or empty required input; the request never reached the embedder.
    pub fn is_input_validation(&self) -> bool {
        matches!(
            self,
            EnrollmentError::EmptyName | EnrollmentError::EmptyRelation | EnrollmentError::NoImages
        )
    }
}

/// Confirmation of a successful enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollReceipt {
    /// Positional id at the time of enrollment.
    pub person_id: usize,
    pub name: String,
    pub relation: String,
    /// Number of images that contributed an embedding.
    pub embeddings: usize,
    /// Number of images skipped (no face, or the embedder failed on them).
    pub skipped: usize,
}

pub struct EnrollmentService {
    embedder: Arc<dyn Embedder>,
    store: Arc<RosterStore>,
}

impl EnrollmentService {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<RosterStore>) -> Self {
        Self { embedder, store }
    }

    /// Enroll a new person from one or more photos.
    ///
    /// Each photo contributes the embedding of its primary face. Photos with
    /// no face, or on which the embedder fails, are skipped; enrollment only
    /// fails if none contributed. Re-enrolling an existing name creates a
    /// separate record.
    pub fn enroll(
        &self,
        images: &[RgbImage],
        name: &str,
        relation: &str,
        cancel: &CancellationToken,
    ) -> Result<EnrollReceipt, EnrollmentError> {
        let name = name.trim();
        let relation = relation.trim();
        if name.is_empty() {
            return Err(EnrollmentError::EmptyName);
        }
        if relation.is_empty() {
            return Err(EnrollmentError::EmptyRelation);
        }
        if images.is_empty() {
            return Err(EnrollmentError::NoImages);
        }

        let dimension = self.store.profile().dimension;
        let mut embeddings: Vec<Embedding> = Vec::with_capacity(images.len());
        let mut skipped = 0usize;

        for (i, image) in images.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(name, image = i, "enroll: cancelled during extraction");
                return Err(EnrollmentError::Cancelled);
            }

            let faces = match self.embedder.embed(image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(name, image = i, error = %e, "enroll: embedder failed; skipping image");
                    skipped += 1;
                    continue;
                }
            };

            let Some(primary) = faces.into_iter().next() else {
                tracing::debug!(name, image = i, "enroll: no face in image");
                skipped += 1;
                continue;
            };

            if primary.embedding.dimension() != dimension || !primary.embedding.is_finite() {
                tracing::warn!(
                    name,
                    image = i,
                    got = primary.embedding.dimension(),
                    expected = dimension,
                    "enroll: unusable embedding; skipping image"
                );
                skipped += 1;
                continue;
            }

            tracing::debug!(
                name,
                image = i,
                confidence = primary.detection.confidence,
                "enroll: face embedded"
            );
            embeddings.push(primary.embedding);
        }

        if embeddings.is_empty() {
            return Err(EnrollmentError::NoFaceDetected {
                images: images.len(),
            });
        }

        let count = embeddings.len();
        let record = PersonRecord {
            name: name.to_string(),
            relation: relation.to_string(),
            enrolled_at: Utc::now(),
            embeddings,
        };
        let person_id = match self.store.append_unless_cancelled(record, cancel) {
            Ok(id) => id,
            Err(StoreError::Cancelled) => return Err(EnrollmentError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(person_id, name, relation, embeddings = count, skipped, "enrolled");

        Ok(EnrollReceipt {
            person_id,
            name: name.to_string(),
            relation: relation.to_string(),
            embeddings: count,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_image, faceless_image, ScriptedEmbedder};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (EnrollmentService, Arc<RosterStore>) {
        let embedder = Arc::new(ScriptedEmbedder::new());
        let store = Arc::new(
            RosterStore::open(dir.path().join("roster.json"), embedder.profile()).unwrap(),
        );
        (EnrollmentService::new(embedder, store.clone()), store)
    }

    #[test]
    fn test_enroll_skips_faceless_images() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);
        let images = vec![face_image(1), faceless_image(), face_image(1)];

        let receipt = service
            .enroll(&images, "Alice", "daughter", &CancellationToken::new())
            .unwrap();
        assert_eq!(receipt.person_id, 0);
        assert_eq!(receipt.embeddings, 2);
        assert_eq!(receipt.skipped, 1);

        let roster = store.snapshot();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get(0).unwrap().embeddings.len(), 2);
    }

    #[test]
    fn test_enroll_all_faceless_fails_without_append() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);
        let images = vec![faceless_image(), faceless_image()];

        let err = service
            .enroll(&images, "Alice", "daughter", &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::NoFaceDetected { images: 2 }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_validates_input() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);
        let token = CancellationToken::new();
        let images = vec![face_image(1)];

        let err = service.enroll(&images, " ", "son", &token).unwrap_err();
        assert!(matches!(err, EnrollmentError::EmptyName));
        assert!(err.is_input_validation());

        let err = service.enroll(&images, "Bob", "", &token).unwrap_err();
        assert!(matches!(err, EnrollmentError::EmptyRelation));

        let err = service.enroll(&[], "Bob", "son", &token).unwrap_err();
        assert!(matches!(err, EnrollmentError::NoImages));

        assert!(store.is_empty());
    }

    #[test]
    fn test_enroll_uses_primary_face_of_group_photo() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);
        let group = ScriptedEmbedder::group_image(&[3, 4]);

        let receipt = service
            .enroll(&[group], "Carol", "mother", &CancellationToken::new())
            .unwrap();
        assert_eq!(receipt.embeddings, 1);

        let stored = store.snapshot().get(0).unwrap().embeddings[0].clone();
        assert_eq!(stored, ScriptedEmbedder::identity_embedding(3));
    }

    #[test]
    fn test_enroll_tolerates_embedder_failure_on_some_images() {
        let dir = TempDir::new().unwrap();
        let (service, _store) = setup(&dir);
        let images = vec![ScriptedEmbedder::failing_image(), face_image(2)];

        let receipt = service
            .enroll(&images, "Dan", "father", &CancellationToken::new())
            .unwrap();
        assert_eq!(receipt.embeddings, 1);
        assert_eq!(receipt.skipped, 1);
    }

    #[test]
    fn test_reenrollment_creates_separate_record() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);
        let token = CancellationToken::new();

        service.enroll(&[face_image(1)], "Alice", "daughter", &token).unwrap();
        let second = service.enroll(&[face_image(1)], "Alice", "daughter", &token).unwrap();
        assert_eq!(second.person_id, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_cancelled_enrollment_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);
        let token = CancellationToken::new();
        token.cancel();

        let err = service
            .enroll(&[face_image(1)], "Alice", "daughter", &token)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Cancelled));
        assert!(store.is_empty());
        assert!(!dir.path().join("roster.json").exists());
    }

    #[test]
    fn test_enroll_trims_labels() {
        let dir = TempDir::new().unwrap();
        let (service, store) = setup(&dir);

        service
            .enroll(&[face_image(1)], "  Alice ", " daughter", &CancellationToken::new())
            .unwrap();
        let listed = store.list();
        assert_eq!(listed[0].name, "Alice");
        assert_eq!(listed[0].relation, "daughter");
    }
}
