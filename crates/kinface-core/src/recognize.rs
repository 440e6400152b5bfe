//! Recognition: image → faces → named classifications.

use crate::embedder::{Embedder, EmbedderError};
use crate::matcher::{classify, CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::store::RosterStore;
use crate::types::RecognitionResult;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no persons enrolled")]
    EmptyRoster,
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("embedder produced a {got}-dim embedding, roster expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("recognition cancelled")]
    Cancelled,
}

pub struct RecognitionService {
    embedder: Arc<dyn Embedder>,
    store: Arc<RosterStore>,
    threshold: f32,
}

impl RecognitionService {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<RosterStore>) -> Self {
        Self {
            embedder,
            store,
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Classify every face in `image`, in detection order.
    ///
    /// "No face" and "nobody enrolled" are reported as distinct errors so
    /// callers can tell them apart from a successful empty result.
    pub fn recognize(
        &self,
        image: &RgbImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecognitionResult>, RecognitionError> {
        let faces = self.embedder.embed(image)?;
        if cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }
        if faces.is_empty() {
            tracing::debug!("recognize: no face detected");
            return Err(RecognitionError::NoFaceDetected);
        }

        let expected = self.store.profile().dimension;
        if let Some(bad) = faces.iter().find(|f| f.embedding.dimension() != expected) {
            return Err(RecognitionError::DimensionMismatch {
                expected,
                got: bad.embedding.dimension(),
            });
        }
        if faces.iter().any(|f| !f.embedding.is_finite()) {
            return Err(RecognitionError::Embedder(EmbedderError::InferenceFailed(
                "embedding has non-finite values".into(),
            )));
        }

        self.store.read(|roster| {
            if roster.is_empty() {
                return Err(RecognitionError::EmptyRoster);
            }

            let matcher = CosineMatcher;
            let mut results = Vec::with_capacity(faces.len());
            for (i, face) in faces.iter().enumerate() {
                let Some(candidate) = matcher.best_match(&face.embedding, roster) else {
                    return Err(RecognitionError::EmptyRoster);
                };
                let result = classify(candidate, roster, self.threshold);
                tracing::info!(
                    face = i,
                    name = %result.name,
                    confidence = result.confidence,
                    detection = face.detection.confidence,
                    "recognize: face classified"
                );
                results.push(result);
            }
            Ok(results)
        })
    }
}
