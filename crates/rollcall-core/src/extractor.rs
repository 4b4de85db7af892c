//! Descriptor extraction with an ordered fallback cascade.
//!
//! The cascade is a flat list of [`CandidateTransform`]s. For each working
//! resolution (largest first) it tries the plain letterboxed image, then
//! each contrast/brightness preset in increasing strength, then luma
//! grayscale. The driver stops at the first transform on which the
//! analyzer finds a face.

use crate::imaging::{self, Resolution};
use crate::types::FaceDescriptor;
use image::{DynamicImage, ImageError, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Images smaller than this on either side are rejected before detection.
pub const MIN_IMAGE_SIDE: u32 = 100;

/// Detection confidence used by the cascade; favours recall; false accepts
/// are filtered by the scorer threshold.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

pub const DEFAULT_RESOLUTIONS: [Resolution; 3] = [
    Resolution::new(640, 480),
    Resolution::new(480, 360),
    Resolution::new(320, 240),
];

pub const DEFAULT_ENHANCEMENTS: [EnhancementPreset; 3] = [
    EnhancementPreset { contrast: 1.2, brightness: 10.0 },
    EnhancementPreset { contrast: 1.4, brightness: 20.0 },
    EnhancementPreset { contrast: 1.6, brightness: 30.0 },
];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image is {width}x{height}, minimum is {min}x{min}; move closer or use a higher resolution camera")]
    ImageTooSmall { width: u32, height: u32, min: u32 },
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("no face detected after {attempts} attempts; retake the photo facing the camera in better light")]
    NoFaceDetected { attempts: usize },
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<ort::Error> for ExtractError {
    fn from(e: ort::Error) -> Self {
        ExtractError::Inference(e.to_string())
    }
}

/// Something that can find the best face in an RGB image and describe it.
///
/// Returns `Ok(None)` when no face clears `min_confidence`.
pub trait FaceAnalyzer {
    fn analyze(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Option<FaceDescriptor>, ExtractError>;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn analyze(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Option<FaceDescriptor>, ExtractError> {
        (**self).analyze(image, min_confidence)
    }
}

/// Linear `alpha * p + beta` pixel transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnhancementPreset {
    pub contrast: f32,
    pub brightness: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Plain,
    Enhanced(EnhancementPreset),
    Grayscale,
}

/// One step of the cascade: a pure image → image transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateTransform {
    pub resolution: Resolution,
    pub stage: Stage,
}

impl CandidateTransform {
    pub fn apply(&self, src: &RgbImage) -> RgbImage {
        let (boxed, _) = imaging::letterbox(src, self.resolution);
        match self.stage {
            Stage::Plain => boxed,
            Stage::Enhanced(p) => imaging::adjust_contrast_brightness(&boxed, p.contrast, p.brightness),
            Stage::Grayscale => imaging::luma_grayscale(&boxed),
        }
    }
}

impl std::fmt::Display for CandidateTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stage {
            Stage::Plain => write!(f, "{} plain", self.resolution),
            Stage::Enhanced(p) => write!(
                f,
                "{} contrast={} brightness={}",
                self.resolution, p.contrast, p.brightness
            ),
            Stage::Grayscale => write!(f, "{} grayscale", self.resolution),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Working resolutions, tried in the given order.
    pub resolutions: Vec<Resolution>,
    /// Enhancement presets, tried in the given order at each resolution.
    pub enhancements: Vec<EnhancementPreset>,
    pub min_confidence: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            resolutions: DEFAULT_RESOLUTIONS.to_vec(),
            enhancements: DEFAULT_ENHANCEMENTS.to_vec(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl ExtractorConfig {
    /// Expand into the ordered list of transforms the driver walks.
    pub fn cascade(&self) -> Vec<CandidateTransform> {
        let mut steps = Vec::with_capacity(self.resolutions.len() * (self.enhancements.len() + 2));
        for &resolution in &self.resolutions {
            steps.push(CandidateTransform { resolution, stage: Stage::Plain });
            steps.extend(self.enhancements.iter().map(|&p| CandidateTransform {
                resolution,
                stage: Stage::Enhanced(p),
            }));
            steps.push(CandidateTransform { resolution, stage: Stage::Grayscale });
        }
        steps
    }
}

/// A successful extraction and the step that produced it.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub descriptor: FaceDescriptor,
    pub stage: CandidateTransform,
    /// Number of transforms tried, including the successful one.
    pub attempts: usize,
}

/// Runs the cascade over a [`FaceAnalyzer`].
pub struct DescriptorExtractor<A> {
    analyzer: A,
    cascade: Vec<CandidateTransform>,
    min_confidence: f32,
}

impl<A: FaceAnalyzer> DescriptorExtractor<A> {
    pub fn new(analyzer: A, config: &ExtractorConfig) -> Self {
        Self {
            analyzer,
            cascade: config.cascade(),
            min_confidence: config.min_confidence,
        }
    }

    pub fn cascade(&self) -> &[CandidateTransform] {
        &self.cascade
    }

    /// Decode `bytes` and extract a descriptor.
    pub fn extract(&mut self, bytes: &[u8]) -> Result<Extraction, ExtractError> {
        let image = decode(bytes)?;
        self.extract_image(&image)
    }

    /// Extract from an already-decoded image.
    pub fn extract_image(&mut self, image: &DynamicImage) -> Result<Extraction, ExtractError> {
        check_size(image.width(), image.height())?;
        let rgb = image.to_rgb8();

        tracing::debug!(
            width = rgb.width(),
            height = rgb.height(),
            mean_luma = imaging::mean_luma(&rgb),
            steps = self.cascade.len(),
            "extraction cascade starting"
        );

        for (i, step) in self.cascade.iter().enumerate() {
            let candidate = step.apply(&rgb);
            match self.analyzer.analyze(&candidate, self.min_confidence)? {
                Some(descriptor) => {
                    tracing::info!(stage = %step, attempts = i + 1, "face descriptor extracted");
                    return Ok(Extraction {
                        descriptor,
                        stage: *step,
                        attempts: i + 1,
                    });
                }
                None => tracing::debug!(stage = %step, "no face at this stage"),
            }
        }

        Err(ExtractError::NoFaceDetected {
            attempts: self.cascade.len(),
        })
    }
}

/// Decode image bytes, mapping every decoder failure to `UnsupportedFormat`.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ExtractError> {
    image::load_from_memory(bytes).map_err(|e| match e {
        ImageError::Unsupported(u) => ExtractError::UnsupportedFormat(u.to_string()),
        other => ExtractError::UnsupportedFormat(other.to_string()),
    })
}

fn check_size(width: u32, height: u32) -> Result<(), ExtractError> {
    if width < MIN_IMAGE_SIDE || height < MIN_IMAGE_SIDE {
        return Err(ExtractError::ImageTooSmall {
            width,
            height,
            min: MIN_IMAGE_SIDE,
        });
    }
    Ok(())
}
