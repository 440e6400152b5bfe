//! Deterministic embedder for tests.
//!
//! Test images carry their own script in the first pixels: pixel 0 holds
//! `[kind, face_count, 0]`, and pixel `1..=face_count` holds
//! `[identity, variant, 0]` for each face. Identities map to orthogonal
//! one-hot embeddings; a non-zero variant tilts the vector slightly so it
//! stays well above the match threshold against its own identity.

use crate::embedder::{Embedder, EmbedderError, FaceEmbedding};
use crate::types::{BoundingBox, Embedding, ModelProfile};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const KIND_FACES: u8 = 1;
const KIND_SLOW: u8 = 254;
const KIND_FAIL: u8 = 255;

/// How long a slow image stalls the embedder.
pub const SLOW_IMAGE_DELAY: Duration = Duration::from_millis(400);

pub struct ScriptedEmbedder {
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub const MODEL: &'static str = "scripted";
    pub const DIMENSION: usize = 8;

    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn identity_embedding(identity: u8) -> Embedding {
        variant_embedding(identity, 0)
    }

    /// One image containing a face per listed identity, in order.
    pub fn group_image(identities: &[u8]) -> RgbImage {
        let faces: Vec<(u8, u8)> = identities.iter().map(|&id| (id, 0)).collect();
        scripted_image(KIND_FACES, &faces)
    }

    /// An image the embedder reports an inference failure for.
    pub fn failing_image() -> RgbImage {
        scripted_image(KIND_FAIL, &[])
    }

    /// A single-face image that takes [`SLOW_IMAGE_DELAY`] to embed.
    pub fn slow_image(identity: u8) -> RgbImage {
        scripted_image(KIND_SLOW, &[(identity, 0)])
    }
}

impl Default for ScriptedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

/// A photo with one face of `identity`.
pub fn face_image(identity: u8) -> RgbImage {
    photo(identity, 0)
}

/// Another photo of `identity`, slightly different from the others.
pub fn photo(identity: u8, variant: u8) -> RgbImage {
    scripted_image(KIND_FACES, &[(identity, variant)])
}

/// A photo in which no face is found.
pub fn faceless_image() -> RgbImage {
    scripted_image(KIND_FACES, &[])
}

fn scripted_image(kind: u8, faces: &[(u8, u8)]) -> RgbImage {
    let width = faces.len() as u32 + 1;
    let mut img = RgbImage::new(width, 1);
    img.put_pixel(0, 0, Rgb([kind, faces.len() as u8, 0]));
    for (i, &(identity, variant)) in faces.iter().enumerate() {
        img.put_pixel(i as u32 + 1, 0, Rgb([identity, variant, 0]));
    }
    img
}

fn variant_embedding(identity: u8, variant: u8) -> Embedding {
    let dim = ScriptedEmbedder::DIMENSION;
    let mut values = vec![0.0f32; dim];
    let slot = identity as usize % dim;
    values[slot] = 1.0;
    values[(slot + 1) % dim] += f32::from(variant.min(3)) * 0.1;
    Embedding::new(values)
}

impl Embedder for ScriptedEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Vec<FaceEmbedding>, EmbedderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let Some(&Rgb([kind, count, _])) = image.get_pixel_checked(0, 0) else {
            return Ok(Vec::new());
        };
        match kind {
            KIND_FAIL => return Err(EmbedderError::InferenceFailed("scripted failure".into())),
            KIND_SLOW => std::thread::sleep(SLOW_IMAGE_DELAY),
            KIND_FACES => {}
            _ => return Ok(Vec::new()),
        }

        let faces = (1..=u32::from(count))
            .filter_map(|x| image.get_pixel_checked(x, 0))
            .enumerate()
            .map(|(i, &Rgb([identity, variant, _]))| FaceEmbedding {
                embedding: variant_embedding(identity, variant),
                detection: BoundingBox {
                    x: i as f32 * 100.0,
                    y: 0.0,
                    width: 80.0,
                    height: 80.0,
                    confidence: 0.99 - i as f32 * 0.01,
                    landmarks: None,
                },
            })
            .collect();
        Ok(faces)
    }

    fn profile(&self) -> ModelProfile {
        ModelProfile::new(Self::MODEL, Self::DIMENSION)
    }
}
