//! SCRFD detection + ArcFace embedding via ONNX Runtime.
//!
//! Expects `det_10g.onnx` (SCRFD, 9 outputs: score/bbox/kps for strides
//! 8/16/32) and `w600k_r50.onnx` (ArcFace, 512-dim output) from insightface.

use crate::embedder::{Embedder, EmbedderError, FaceEmbedding};
use crate::geometry::{self, Letterbox, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding, ModelProfile};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

// SCRFD
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

// ArcFace: symmetric normalization, unlike SCRFD
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = crate::DEFAULT_DIMENSION;
const ARCFACE_MODEL: &str = crate::DEFAULT_MODEL;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

struct Sessions {
    detector: Session,
    recognizer: Session,
}

/// [`Embedder`] backed by insightface SCRFD + ArcFace ONNX models.
pub struct OnnxEmbedder {
    sessions: Mutex<Sessions>,
    stride_outputs: [StrideOutputs; 3],
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EmbedderError> {
        let detector = load_session(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = load_session(&model_dir.join(ARCFACE_MODEL_FILE))?;

        let output_names: Vec<String> =
            detector.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(EmbedderError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }
        let stride_outputs = discover_stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            sessions: Mutex::new(Sessions {
                detector,
                recognizer,
            }),
            stride_outputs,
        })
    }

    fn detect(&self, session: &mut Session, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        let letterbox = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
        let input = detector_input(image, &letterbox);

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| EmbedderError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;
            detections.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(geometry::nms(detections, SCRFD_NMS_THRESHOLD))
    }

    fn extract(
        &self,
        session: &mut Session,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, EmbedderError> {
        let landmarks = face.landmarks.as_ref().ok_or_else(|| {
            EmbedderError::InferenceFailed("detection has no landmarks for alignment".into())
        })?;
        let aligned = geometry::align_face(image, landmarks);
        let input = normalized_tensor(&aligned, ARCFACE_MEAN, ARCFACE_STD);

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };
        Ok(Embedding::new(values))
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Vec<FaceEmbedding>, EmbedderError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let mut guard = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let sessions = &mut *guard;

        let detections = self.detect(&mut sessions.detector, image)?;
        tracing::debug!(faces = detections.len(), "SCRFD detections");

        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let embedding = self.extract(&mut sessions.recognizer, image, &detection)?;
            faces.push(FaceEmbedding {
                embedding,
                detection,
            });
        }
        Ok(faces)
    }

    fn profile(&self) -> ModelProfile {
        ModelProfile::new(ARCFACE_MODEL, ARCFACE_EMBEDDING_DIM)
    }
}

fn load_session(path: &Path) -> Result<Session, EmbedderError> {
    if !path.exists() {
        return Err(EmbedderError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    tracing::info!(
        path = %path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Letterboxed 640×640 NCHW input; padding normalizes to zero.
fn detector_input(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let resized = imageops::resize(
        image,
        letterbox.scaled_width,
        letterbox.scaled_height,
        FilterType::Triangle,
    );
    let size = SCRFD_INPUT_SIZE as usize;
    let (x0, y0) = (letterbox.pad_x.floor() as u32, letterbox.pad_y.floor() as u32);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + x0) as usize, (y + y0) as usize);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

/// NCHW tensor of an RGB image with per-channel `(p - mean) / std`.
fn normalized_tensor(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, px) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Map SCRFD outputs to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to the positional export order [scores, bboxes, kps].
fn discover_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| *n == format!("{prefix}_{stride}"));

    let mut by_name = [(0, 0, 0); 3];
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => by_name[i] = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD output names not recognized; using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    by_name
}

/// Decode one stride level into source-image boxes with landmarks.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(b) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let (ax, ay) = ((cell % grid) as f32 * s, (cell / grid) as f32 * s);

        let (x1, y1) = letterbox.to_source(ax - b[0] * s, ay - b[1] * s);
        let (x2, y2) = letterbox.to_source(ax + b[2] * s, ay + b[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.to_source(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_discover_named_outputs_any_order() {
        let n = names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]);
        assert_eq!(discover_stride_outputs(&n), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_positional_fallback() {
        let n = names(&["448", "471", "494", "451", "474", "497", "454", "477", "500"]);
        assert_eq!(discover_stride_outputs(&n), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_maps_to_source() {
        let letterbox = Letterbox::fit(640, 640, SCRFD_INPUT_SIZE);
        let grid = 640 / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut bboxes = vec![0.0; anchors * 4];
        let kps = vec![0.0; anchors * 10];

        // Anchor for cell (x=2, y=1) at stride 32.
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_stride(&scores, &bboxes, &kps, 32, &letterbox);
        assert_eq!(dets.len(), 1);
        assert_eq!((dets[0].x, dets[0].y), (32.0, 0.0));
        assert_eq!((dets[0].width, dets[0].height), (64.0, 64.0));
        assert_eq!(dets[0].landmarks.unwrap()[0], (64.0, 32.0));
    }

    #[test]
    fn test_normalized_tensor_layout() {
        let image = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 127, 0]));
        let t = normalized_tensor(&image, ARCFACE_MEAN, ARCFACE_STD);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_detector_input_pads_to_zero() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        let lb = Letterbox::fit(320, 160, SCRFD_INPUT_SIZE);
        let t = detector_input(&image, &lb);
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        assert!(t[[0, 0, 320, 320]] > 0.9);
    }
}
