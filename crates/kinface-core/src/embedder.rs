//! The face-embedding capability the services are built on.

use crate::types::{BoundingBox, Embedding, ModelProfile};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; download from insightface and place in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One detected face and its identity embedding.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub embedding: Embedding,
    pub detection: BoundingBox,
}

/// Turns an image into zero or more face embeddings.
///
/// Faces are returned primary-first (highest detection confidence first).
/// An image without faces is `Ok(vec![])`, not an error.
///
/// # Thread Safety
///
/// Implementations must be safe for concurrent use.
pub trait Embedder: Send + Sync {
    fn embed(&self, image: &RgbImage) -> Result<Vec<FaceEmbedding>, EmbedderError>;

    /// Embedding space produced by this embedder.
    fn profile(&self) -> ModelProfile;
}
