use crate::collaborators::CallerLocation;
use crate::error::AttendanceError;
use crate::orchestrator::Orchestrator;
use crate::sqlite::SqliteStore;
use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceKind, GeoPoint, GeofencePolicy};
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "io.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/io/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.rollcall.Attendance1
/// Object path: /io/rollcall/Attendance1
pub struct AttendanceService {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<SqliteStore>,
    pub model_dir: PathBuf,
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll (or re-enroll) a user from a reference photo. Returns the
    /// profile summary as JSON.
    async fn enroll(&self, user: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(user, bytes = image.len(), "enroll requested");
        let profile = self.orchestrator.enroll(user, image).await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "owner_id": profile.owner_id,
            "registered_at": profile.registered_at,
            "last_updated": profile.last_updated,
            "reference_image_ref": profile.reference_image_ref,
            "model_version": profile.descriptor.as_ref().and_then(|d| d.model_version()),
        })
        .to_string())
    }

    /// Verify a captured photo. `kind` is "check_in", "check_out" or "auto";
    /// NaN coordinates mean no location fix. Returns the event as JSON.
    async fn verify(
        &self,
        user: &str,
        kind: &str,
        image: Vec<u8>,
        latitude: f64,
        longitude: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, kind, bytes = image.len(), "verify requested");
        let location = CallerLocation::from_coordinates(latitude, longitude)
            .map_err(|e| to_fdo(e.into()))?;
        let kind = match parse_kind(kind).map_err(to_fdo)? {
            Some(k) => k,
            None => self.orchestrator.suggest_kind(user).await.map_err(to_fdo)?,
        };
        let verification = self
            .orchestrator
            .verify_with_provider(user, kind, image, &location)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&verification).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// "check_in" or "check_out", whichever the user should do next today.
    async fn suggest_kind(&self, user: &str) -> zbus::fdo::Result<String> {
        let kind = self.orchestrator.suggest_kind(user).await.map_err(to_fdo)?;
        Ok(kind.as_str().to_string())
    }

    /// Events between two Unix timestamps (seconds), newest first, as JSON.
    async fn history(&self, user: &str, from: i64, to: i64) -> zbus::fdo::Result<String> {
        let (from, to) = (unix(from).map_err(to_fdo)?, unix(to).map_err(to_fdo)?);
        let events = self.orchestrator.history(user, from, to).await.map_err(to_fdo)?;
        serde_json::to_string(&events).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn set_policy(
        &self,
        user: &str,
        required: bool,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
        label: &str,
    ) -> zbus::fdo::Result<()> {
        let center = GeoPoint::new(latitude, longitude).map_err(|e| to_fdo(e.into()))?;
        let policy = GeofencePolicy::new(required, center, radius_meters, label)
            .map_err(|e| to_fdo(e.into()))?;
        self.orchestrator.set_policy(user, &policy).await.map_err(to_fdo)
    }

    /// The user's geofence policy as JSON, or "null".
    async fn get_policy(&self, user: &str) -> zbus::fdo::Result<String> {
        let policy = self.orchestrator.policy(user).await.map_err(to_fdo)?;
        serde_json::to_string(&policy).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Clear the user's biometric profile. Returns false if none existed.
    async fn remove_profile(&self, user: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user, "remove_profile requested");
        self.orchestrator.remove(user).await.map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let active_profiles = self.store.active_profile_count().await.ok();
        let events = self.store.event_count().await.ok();
        let scoring = self.orchestrator.scorer().policy();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": self.orchestrator.engine_loaded(),
            "model_dir": self.model_dir.display().to_string(),
            "match_threshold": scoring.match_threshold,
            "near_match_threshold": self.orchestrator.decision().policy().near_match_threshold,
            "active_profiles": active_profiles,
            "events": events,
        })
        .to_string())
    }
}

/// D-Bus error carrying `<FailureKind>: <user message>`.
fn to_fdo(e: AttendanceError) -> zbus::fdo::Error {
    tracing::warn!(kind = %e.kind(), retryable = e.is_retryable(), error = %e, "request failed");
    zbus::fdo::Error::Failed(format!("{}: {}", e.kind(), e.user_message()))
}

/// `None` means "pick for me".
fn parse_kind(raw: &str) -> Result<Option<AttendanceKind>, AttendanceError> {
    match raw.trim() {
        "" | "auto" => Ok(None),
        other => other
            .parse()
            .map(Some)
            .map_err(AttendanceError::InvalidRequest),
    }
}

fn unix(secs: i64) -> Result<DateTime<Utc>, AttendanceError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AttendanceError::InvalidRequest(format!("timestamp {secs} out of range")))
}
