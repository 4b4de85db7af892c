use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::decision::Decision;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor contains a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("descriptor has zero magnitude")]
    ZeroNorm,
    #[error("stored descriptor is not a list of numbers: {0}")]
    Encoding(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("latitude {0} is outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    Longitude(f64),
    #[error("geofence radius {0} must be a finite, non-negative number of meters")]
    Radius(f64),
}

/// Fixed-length face descriptor produced by the recognizer.
///
/// Never compared for exact equality; use [`crate::Scorer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredDescriptor", into = "StoredDescriptor")]
pub struct FaceDescriptor {
    values: Vec<f32>,
    /// Model that produced this descriptor (e.g., "w600k_r50").
    model_version: Option<String>,
}

/// Storage form of a descriptor: an ordered list of numbers plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDescriptor {
    values: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
}

impl TryFrom<StoredDescriptor> for FaceDescriptor {
    type Error = DescriptorError;

    fn try_from(stored: StoredDescriptor) -> Result<Self, Self::Error> {
        FaceDescriptor::new(stored.values, stored.model_version)
    }
}

impl From<FaceDescriptor> for StoredDescriptor {
    fn from(d: FaceDescriptor) -> Self {
        StoredDescriptor {
            values: d.values,
            model_version: d.model_version,
        }
    }
}

impl FaceDescriptor {
    /// Build a descriptor, rejecting vectors that cannot self-match
    /// (empty, non-finite, or all zeros).
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }
        if values.iter().all(|&v| v == 0.0) {
            return Err(DescriptorError::ZeroNorm);
        }
        Ok(Self {
            values,
            model_version,
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Encode for the profile store. Lossless: `f32` values survive the
    /// JSON round trip bit-for-bit.
    pub fn to_storage(&self) -> Result<String, DescriptorError> {
        serde_json::to_string(self).map_err(|e| DescriptorError::Encoding(e.to_string()))
    }

    /// Decode a descriptor previously written by [`to_storage`](Self::to_storage).
    ///
    /// Also accepts a bare JSON array of numbers.
    pub fn from_storage(raw: &str) -> Result<Self, DescriptorError> {
        let encoding = |e: serde_json::Error| DescriptorError::Encoding(e.to_string());
        if raw.trim_start().starts_with('[') {
            let values: Vec<f32> = serde_json::from_str(raw).map_err(encoding)?;
            return FaceDescriptor::new(values, None);
        }
        let stored: StoredDescriptor = serde_json::from_str(raw).map_err(encoding)?;
        FaceDescriptor::try_from(stored)
    }
}

/// WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::Latitude(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::Longitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Per-owner circular work zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofencePolicy {
    pub is_required: bool,
    pub center: GeoPoint,
    pub radius_meters: f64,
    pub label: String,
}

impl GeofencePolicy {
    pub fn new(
        is_required: bool,
        center: GeoPoint,
        radius_meters: f64,
        label: impl Into<String>,
    ) -> Result<Self, GeoError> {
        if !radius_meters.is_finite() || radius_meters < 0.0 {
            return Err(GeoError::Radius(radius_meters));
        }
        Ok(Self {
            is_required,
            center,
            radius_meters,
            label: label.into(),
        })
    }
}

/// Enrolled face of one owner.
///
/// A cleared profile keeps its record but has no descriptor and
/// `is_active == false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiometricProfile {
    pub owner_id: String,
    pub descriptor: Option<FaceDescriptor>,
    pub reference_image_ref: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub is_active: bool,
}

impl BiometricProfile {
    /// First enrollment for an owner.
    pub fn enroll(
        owner_id: impl Into<String>,
        descriptor: FaceDescriptor,
        reference_image_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            descriptor: Some(descriptor),
            reference_image_ref,
            registered_at: now,
            last_updated: now,
            is_active: true,
        }
    }

    /// Replace the descriptor, keeping owner and registration time.
    pub fn reenroll(
        self,
        descriptor: FaceDescriptor,
        reference_image_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            descriptor: Some(descriptor),
            reference_image_ref,
            last_updated: now,
            is_active: true,
            ..self
        }
    }

    /// Logical delete.
    pub fn cleared(self, now: DateTime<Utc>) -> Self {
        Self {
            descriptor: None,
            last_updated: now,
            is_active: false,
            ..self
        }
    }

    /// The descriptor to verify against, if this profile is usable.
    pub fn active_descriptor(&self) -> Option<&FaceDescriptor> {
        if self.is_active {
            self.descriptor.as_ref()
        } else {
            None
        }
    }
}

/// Scorer output for one probe/reference pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_match: bool,
    /// Fused similarity in [0, 1].
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceKind {
    CheckIn,
    CheckOut,
}

impl AttendanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceKind::CheckIn => "check_in",
            AttendanceKind::CheckOut => "check_out",
        }
    }
}

impl std::str::FromStr for AttendanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "check_in" | "checkin" | "in" => Ok(AttendanceKind::CheckIn),
            "check_out" | "checkout" | "out" => Ok(AttendanceKind::CheckOut),
            other => Err(format!("unknown attendance kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Valid,
    Invalid,
    ManualVerification,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Valid => "valid",
            AttendanceStatus::Invalid => "invalid",
            AttendanceStatus::ManualVerification => "manual_verification",
        }
    }
}

impl std::str::FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(AttendanceStatus::Valid),
            "invalid" => Ok(AttendanceStatus::Invalid),
            "manual_verification" => Ok(AttendanceStatus::ManualVerification),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// One verification attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub owner_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AttendanceKind,
    pub captured_location: GeoPoint,
    pub is_within_geofence: bool,
    pub match_score: f32,
    pub status: AttendanceStatus,
    pub note: String,
    /// Storage key of the captured photo, if one is uploaded.
    pub image_ref: Option<String>,
}

impl AttendanceEvent {
    /// Build the event for a decided attempt. Status and note come only
    /// from the decision. `image_ext` names the captured photo's format.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        owner_id: impl Into<String>,
        kind: AttendanceKind,
        captured_location: GeoPoint,
        is_within_geofence: bool,
        verification: VerificationResult,
        decision: Decision,
        timestamp: DateTime<Utc>,
        image_ext: &str,
    ) -> Self {
        let owner_id = owner_id.into();
        let id = Uuid::new_v4();
        Self {
            image_ref: Some(format!("attendance/{owner_id}/{id}.{image_ext}")),
            id,
            owner_id,
            timestamp,
            kind,
            captured_location,
            is_within_geofence,
            match_score: verification.score,
            status: decision.status,
            note: decision.note,
        }
    }
}
