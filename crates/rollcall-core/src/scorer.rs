//! Two-metric descriptor similarity with weighted fusion.
//!
//! `fused = w_e * max(0, 1 - euclidean) + w_c * cosine`, clamped to [0, 1].
//! Cosine carries most of the weight because it ignores magnitude shifts
//! caused by lighting; the Euclidean term still penalises descriptors that
//! point the same way but sit far apart.

use crate::types::{FaceDescriptor, VerificationResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_EUCLIDEAN_WEIGHT: f32 = 0.3;
pub const DEFAULT_COSINE_WEIGHT: f32 = 0.7;
/// Fused score must be strictly greater than this to count as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("descriptor shape mismatch: probe has {probe} dimensions, reference has {reference}")]
    DescriptorShapeMismatch { probe: usize, reference: usize },
}

/// Tunable fusion weights and match threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub euclidean_weight: f32,
    pub cosine_weight: f32,
    pub match_threshold: f32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            euclidean_weight: DEFAULT_EUCLIDEAN_WEIGHT,
            cosine_weight: DEFAULT_COSINE_WEIGHT,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// Compares a probe descriptor against an enrolled reference.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    policy: ScoringPolicy,
}

impl Scorer {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn score(
        &self,
        probe: &FaceDescriptor,
        reference: &FaceDescriptor,
    ) -> Result<VerificationResult, ScoreError> {
        if probe.len() != reference.len() {
            return Err(ScoreError::DescriptorShapeMismatch {
                probe: probe.len(),
                reference: reference.len(),
            });
        }

        let euclidean_sim = (1.0 - euclidean_distance(probe.values(), reference.values())).max(0.0);
        let cosine_sim = cosine_similarity(probe.values(), reference.values());

        let fused = (self.policy.euclidean_weight * euclidean_sim
            + self.policy.cosine_weight * cosine_sim)
            .clamp(0.0, 1.0);

        tracing::debug!(euclidean_sim, cosine_sim, fused, "descriptor scored");

        Ok(VerificationResult {
            is_match: fused > self.policy.match_threshold,
            score: fused,
        })
    }
}

/// Cosine similarity in [-1, 1]; 0 when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x as f64 - y as f64).powi(2))
        .sum::<f64>()
        .sqrt() as f32
}
