use crate::collaborators::StoreError;
use crate::engine::EngineError;
use rollcall_core::{ExtractError, GeoError, ScoreError};
use std::time::Duration;
use thiserror::Error;

/// Every failure the orchestrator can surface.
///
/// Extraction and scoring errors pass through unchanged; `kind()` and
/// `user_message()` are the only translation layer.
#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error(transparent)]
    Extraction(#[from] ExtractError),
    #[error(transparent)]
    Scoring(#[from] ScoreError),
    #[error("no active biometric profile for {0}")]
    ProfileNotFound(String),
    #[error("location unavailable")]
    LocationUnavailable,
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        operation: &'static str,
        budget: Duration,
    },
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("engine: {0}")]
    Engine(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<EngineError> for AttendanceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Extract(inner) => AttendanceError::Extraction(inner),
            other => AttendanceError::Engine(other.to_string()),
        }
    }
}

impl From<GeoError> for AttendanceError {
    fn from(e: GeoError) -> Self {
        AttendanceError::InvalidRequest(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ImageTooSmall,
    UnsupportedFormat,
    NoFaceDetected,
    DescriptorShapeMismatch,
    ProfileNotFound,
    LocationUnavailable,
    Timeout,
    Storage,
    Engine,
    InvalidRequest,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ImageTooSmall => "ImageTooSmall",
            FailureKind::UnsupportedFormat => "UnsupportedFormat",
            FailureKind::NoFaceDetected => "NoFaceDetected",
            FailureKind::DescriptorShapeMismatch => "DescriptorShapeMismatch",
            FailureKind::ProfileNotFound => "ProfileNotFound",
            FailureKind::LocationUnavailable => "LocationUnavailable",
            FailureKind::Timeout => "Timeout",
            FailureKind::Storage => "Storage",
            FailureKind::Engine => "Engine",
            FailureKind::InvalidRequest => "InvalidRequest",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AttendanceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AttendanceError::Extraction(e) => match e {
                ExtractError::ImageTooSmall { .. } => FailureKind::ImageTooSmall,
                ExtractError::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
                ExtractError::NoFaceDetected { .. } => FailureKind::NoFaceDetected,
                ExtractError::ModelNotFound(_) | ExtractError::Inference(_) => FailureKind::Engine,
            },
            AttendanceError::Scoring(ScoreError::DescriptorShapeMismatch { .. }) => {
                FailureKind::DescriptorShapeMismatch
            }
            AttendanceError::ProfileNotFound(_) => FailureKind::ProfileNotFound,
            AttendanceError::LocationUnavailable => FailureKind::LocationUnavailable,
            AttendanceError::Timeout { .. } => FailureKind::Timeout,
            AttendanceError::Storage(_) => FailureKind::Storage,
            AttendanceError::Engine(_) => FailureKind::Engine,
            AttendanceError::InvalidRequest(_) => FailureKind::InvalidRequest,
        }
    }

    /// Whether repeating the same request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::NoFaceDetected
                | FailureKind::LocationUnavailable
                | FailureKind::Timeout
                | FailureKind::Storage
        )
    }

    /// End-user guidance for this failure.
    pub fn user_message(&self) -> String {
        match self.kind() {
            FailureKind::ImageTooSmall => {
                "The photo is too small. Move closer to the camera and try again.".into()
            }
            FailureKind::UnsupportedFormat => {
                "The photo could not be read. Take a new photo and try again.".into()
            }
            FailureKind::NoFaceDetected => {
                "No face was found. Face the camera in good lighting and retake the photo.".into()
            }
            FailureKind::DescriptorShapeMismatch => {
                "Your enrolled face data is not compatible. Ask an administrator to re-enroll you."
                    .into()
            }
            FailureKind::ProfileNotFound => {
                "You are not enrolled for face attendance yet. Enroll first.".into()
            }
            FailureKind::LocationUnavailable => {
                "Your location could not be determined. Enable location services and try again."
                    .into()
            }
            FailureKind::Timeout => "The request took too long. Please try again.".into(),
            FailureKind::Storage | FailureKind::Engine => {
                format!("Attendance service error: {self}")
            }
            FailureKind::InvalidRequest => self.to_string(),
        }
    }
}
