//! ONNX-backed [`FaceAnalyzer`]: SCRFD detection → alignment → ArcFace.

use crate::alignment;
use crate::detector::FaceDetector;
use crate::extractor::{ExtractError, FaceAnalyzer};
use crate::recognizer::FaceRecognizer;
use crate::types::FaceDescriptor;
use image::RgbImage;
use std::path::{Path, PathBuf};

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Both recognition models, loaded once and reused for every request.
pub struct FaceModels {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceModels {
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }

    pub fn model_paths(model_dir: &Path) -> [PathBuf; 2] {
        [
            model_dir.join(DETECTOR_MODEL_FILE),
            model_dir.join(RECOGNIZER_MODEL_FILE),
        ]
    }
}

impl FaceAnalyzer for FaceModels {
    fn analyze(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Option<FaceDescriptor>, ExtractError> {
        let faces = self.detector.detect(image, min_confidence)?;
        // Single best face only; landmarks are required for alignment.
        let Some((confidence, landmarks)) = faces
            .into_iter()
            .find_map(|f| Some((f.confidence, f.landmarks?)))
        else {
            return Ok(None);
        };

        tracing::debug!(confidence, "face detected");

        let Some(aligned) = alignment::align_face(image, &landmarks) else {
            tracing::debug!("degenerate landmarks, skipping face");
            return Ok(None);
        };
        self.recognizer.describe(&aligned).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reports_missing_detector_first() {
        let dir = Path::new("/nonexistent/rollcall-models");
        let err = FaceModels::load(dir).err().unwrap();
        match err {
            ExtractError::ModelNotFound(p) => assert!(p.ends_with(DETECTOR_MODEL_FILE)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_model_paths() {
        let [det, rec] = FaceModels::model_paths(Path::new("/models"));
        assert_eq!(det, Path::new("/models/det_10g.onnx"));
        assert_eq!(rec, Path::new("/models/w600k_r50.onnx"));
    }
}
