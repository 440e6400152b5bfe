//! kinface-core: household face identification.
//!
//! Converts face images to embeddings through a pluggable [`Embedder`],
//! keeps a durable roster of enrolled persons (several embeddings each),
//! and matches query faces against it by cosine similarity.
//!
//! With the `onnx` feature, [`onnx::OnnxEmbedder`] provides SCRFD detection
//! and ArcFace embeddings via ONNX Runtime.

pub mod embedder;
pub mod enroll;
pub mod geometry;
pub mod matcher;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod recognize;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use embedder::{Embedder, EmbedderError, FaceEmbedding};
pub use enroll::{EnrollReceipt, EnrollmentError, EnrollmentService};
pub use matcher::{CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use recognize::{RecognitionError, RecognitionService};
pub use store::{RosterStore, StoreError};
pub use types::{
    BoundingBox, Embedding, MatchCandidate, ModelProfile, PersonRecord, PersonSummary,
    RecognitionResult, Roster, UNKNOWN_NAME,
};

use std::path::PathBuf;

/// Model identifier recorded in rosters built by the ONNX embedder.
pub const DEFAULT_MODEL: &str = "arcface-w600k_r50";
/// Embedding length produced by [`DEFAULT_MODEL`].
pub const DEFAULT_DIMENSION: usize = 512;

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("kinface")
}

/// Default directory holding `det_10g.onnx` and `w600k_r50.onnx`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Default roster location shared by the daemon and the offline CLI commands.
pub fn default_roster_path() -> PathBuf {
    data_dir().join("roster.json")
}
