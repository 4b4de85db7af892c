//! rollcall-core — biometric attendance verification engine.
//!
//! Face descriptor extraction (SCRFD + ArcFace over ONNX Runtime, behind an
//! ordered enhancement cascade), fused similarity scoring, circular
//! geofencing and the attendance decision table. Everything here is pure
//! and synchronous; I/O and orchestration live in `rollcalld`.

pub mod alignment;
pub mod decision;
pub mod detector;
pub mod extractor;
pub mod geofence;
pub mod imaging;
pub mod models;
pub mod recognizer;
pub mod scorer;
pub mod types;

pub use decision::{Decision, DecisionEngine, DecisionPolicy, DecisionRule};
pub use extractor::{
    CandidateTransform, DescriptorExtractor, ExtractError, Extraction, ExtractorConfig, FaceAnalyzer,
    Stage,
};
pub use geofence::{haversine_distance, is_within_geofence};
pub use models::FaceModels;
pub use scorer::{ScoreError, Scorer, ScoringPolicy};
pub use types::{
    AttendanceEvent, AttendanceKind, AttendanceStatus, BiometricProfile, DescriptorError,
    FaceDescriptor, GeoError, GeoPoint, GeofencePolicy, VerificationResult,
};
