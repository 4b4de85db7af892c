//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over strides 8/16/32 with five-point landmarks,
//! followed by non-maximum suppression.

use crate::extractor::ExtractError;
use crate::imaging::{self, LetterboxInfo, Resolution};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = SCRFD_STRIDES.len() * 3;

/// Face box in source-image pixels, with five landmarks:
/// [left_eye, right_eye, nose, left_mouth, right_mouth].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Tensor positions of (score, bbox, kps) for one stride.
type StrideSlots = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    slots: [StrideSlots; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded SCRFD model");

        if names.len() < SCRFD_OUTPUTS {
            return Err(ExtractError::Inference(format!(
                "SCRFD model needs {SCRFD_OUTPUTS} outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }

        let slots = output_slots(&names);
        tracing::debug!(?slots, "SCRFD output mapping");
        Ok(Self { session, slots })
    }

    /// Faces above `min_confidence`, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage, min_confidence: f32) -> Result<Vec<FaceBox>, ExtractError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.slots[pos];
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| ExtractError::Inference(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                scores: tensor(score_idx, "scores")?,
                bboxes: tensor(bbox_idx, "bboxes")?,
                kps: tensor(kps_idx, "kps")?,
                stride,
            };
            faces.extend(head.decode(&letterbox, min_confidence));
        }

        Ok(nms(faces, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox to the square SCRFD input and normalise into NCHW.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let side = SCRFD_INPUT_SIZE as usize;
    let (boxed, letterbox) = imaging::letterbox(image, Resolution::new(SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in boxed.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, letterbox)
}

/// Map output tensors to strides, by name ("score_8", "bbox_16", ...) when
/// the export names them, otherwise by the standard positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn output_slots(names: &[String]) -> [StrideSlots; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognised, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

struct StrideHead<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
    stride: usize,
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &LetterboxInfo, threshold: f32) -> Vec<FaceBox> {
        let side = SCRFD_INPUT_SIZE as usize;
        let grid = side / self.stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let s = self.stride as f32;

        let unbox = |x: f32, y: f32| {
            (
                (x - letterbox.pad_x as f32) / letterbox.scale,
                (y - letterbox.pad_y as f32) / letterbox.scale,
            )
        };

        let mut out = Vec::new();
        for idx in 0..anchors {
            let score = self.scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                continue;
            }
            let Some(b) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;

            let (x1, y1) = unbox(ax - b[0] * s, ay - b[1] * s);
            let (x2, y2) = unbox(ax + b[2] * s, ay + b[3] * s);

            let landmarks = self
                .kps
                .get(idx * 10..idx * 10 + 10)
                .map(|k| std::array::from_fn(|i| unbox(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s)));

            out.push(FaceBox {
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
}

/// Greedy non-maximum suppression; output sorted by confidence descending.
fn nms(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for face in faces {
        if keep.iter().all(|k| iou(k, &face) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let iw = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let ih = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
