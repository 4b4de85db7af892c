//! Interfaces to the systems the attendance engine depends on but does not
//! own: profile, policy and event storage, photo upload and location.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceEvent, BiometricProfile, GeoPoint, GeofencePolicy};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(String),
    #[error("corrupt record for {owner}: {reason}")]
    Corrupt { owner: String, reason: String },
    #[error("upload rejected: {0}")]
    Upload(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// The owner's profile record, active or cleared.
    async fn get_profile(&self, owner_id: &str) -> StoreResult<Option<BiometricProfile>>;

    /// Insert or replace the owner's profile.
    async fn put_profile(&self, profile: &BiometricProfile) -> StoreResult<()>;

    /// Logical delete. Returns false if the owner had no profile.
    async fn clear_profile(&self, owner_id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self, owner_id: &str) -> StoreResult<Option<GeofencePolicy>>;

    async fn put_policy(&self, owner_id: &str, policy: &GeofencePolicy) -> StoreResult<()>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. Events are never updated afterwards.
    async fn append_event(&self, event: &AttendanceEvent) -> StoreResult<()>;

    /// Events with `from <= timestamp <= to`, newest first.
    async fn query_events(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<AttendanceEvent>>;
}

/// Best-effort photo hosting.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    /// Store `image` under `path_hint` and return its URL.
    async fn upload(&self, image: Vec<u8>, path_hint: &str) -> StoreResult<String>;
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Current fix, or `None` if no fix can be obtained.
    async fn current_location(&self) -> Option<GeoPoint>;
}

/// A fix supplied by the caller along with the request.
#[derive(Debug, Clone, Copy)]
pub struct CallerLocation(pub Option<GeoPoint>);

impl CallerLocation {
    /// Build from raw coordinates; NaN in either means "no fix".
    pub fn from_coordinates(latitude: f64, longitude: f64) -> Result<Self, rollcall_core::GeoError> {
        if latitude.is_nan() || longitude.is_nan() {
            return Ok(Self(None));
        }
        GeoPoint::new(latitude, longitude).map(|p| Self(Some(p)))
    }
}

#[async_trait]
impl LocationProvider for CallerLocation {
    async fn current_location(&self) -> Option<GeoPoint> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_caller_location_nan_is_unavailable() {
        let loc = CallerLocation::from_coordinates(f64::NAN, 10.0).unwrap();
        assert!(loc.current_location().await.is_none());
    }

    #[tokio::test]
    async fn test_caller_location_valid_fix() {
        let loc = CallerLocation::from_coordinates(14.55, 121.02).unwrap();
        let p = loc.current_location().await.unwrap();
        assert_eq!(p.latitude, 14.55);
    }

    #[test]
    fn test_caller_location_out_of_range() {
        assert!(CallerLocation::from_coordinates(123.0, 0.0).is_err());
    }
}
