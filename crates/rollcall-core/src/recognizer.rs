//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns an aligned 112×112 RGB crop into an L2-normalised descriptor.

use crate::alignment::ALIGNED_SIZE;
use crate::extractor::ExtractError;
use crate::types::FaceDescriptor;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD

pub struct FaceRecognizer {
    session: Session,
    model_version: String,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arcface".to_string());

        tracing::info!(path = %model_path.display(), %model_version, "loaded ArcFace model");
        Ok(Self {
            session,
            model_version,
        })
    }

    /// Describe an aligned face crop.
    pub fn describe(&mut self, aligned: &RgbImage) -> Result<FaceDescriptor, ExtractError> {
        let input = preprocess(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::Inference(format!("embedding extraction: {e}")))?;

        let values = l2_normalize(raw.to_vec());
        FaceDescriptor::new(values, Some(self.model_version.clone()))
            .map_err(|e| ExtractError::Inference(format!("recognizer produced an unusable descriptor: {e}")))
    }
}

fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let side = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in aligned.enumerate_pixels() {
        if x as usize >= side || y as usize >= side {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}
