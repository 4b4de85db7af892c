//! Enrollment and verification flows over the engine and collaborators.

use crate::collaborators::{EventStore, ImageUploader, LocationProvider, PolicyStore, ProfileStore};
use crate::config::Timeouts;
use crate::engine::LazyEngine;
use crate::error::AttendanceError;
use chrono::{DateTime, Utc};
use rollcall_core::{
    is_within_geofence, AttendanceEvent, AttendanceKind, AttendanceStatus, BiometricProfile,
    DecisionEngine, Extraction, GeoPoint, GeofencePolicy, Scorer,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A decided verification attempt plus anything that went wrong after the
/// decision was made.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub event: AttendanceEvent,
    pub warnings: Vec<String>,
}

pub struct Orchestrator {
    engine: Arc<LazyEngine>,
    profiles: Arc<dyn ProfileStore>,
    policies: Arc<dyn PolicyStore>,
    events: Arc<dyn EventStore>,
    uploader: Arc<dyn ImageUploader>,
    scorer: Scorer,
    decision: DecisionEngine,
    timeouts: Timeouts,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<LazyEngine>,
        profiles: Arc<dyn ProfileStore>,
        policies: Arc<dyn PolicyStore>,
        events: Arc<dyn EventStore>,
        uploader: Arc<dyn ImageUploader>,
    ) -> Self {
        Self {
            engine,
            profiles,
            policies,
            events,
            uploader,
            scorer: Scorer::default(),
            decision: DecisionEngine::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_decision(mut self, decision: DecisionEngine) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn engine_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn decision(&self) -> &DecisionEngine {
        &self.decision
    }

    /// Enroll or re-enroll `owner_id` from a reference photo.
    ///
    /// Nothing is written unless extraction succeeds. Re-enrollment keeps
    /// the original registration time.
    pub async fn enroll(
        &self,
        owner_id: &str,
        image: Vec<u8>,
    ) -> Result<BiometricProfile, AttendanceError> {
        check_owner(owner_id)?;
        let extraction = self.extract(image.clone()).await?;
        let reference = reference_image_ref(owner_id, &image);

        let existing = bounded(
            "profile lookup",
            self.timeouts.lookup,
            self.profiles.get_profile(owner_id),
        )
        .await?;

        let now = Utc::now();
        let profile = match existing {
            Some(previous) => {
                previous.reenroll(extraction.descriptor, Some(reference.clone()), now)
            }
            None => BiometricProfile::enroll(
                owner_id,
                extraction.descriptor,
                Some(reference.clone()),
                now,
            ),
        };

        bounded(
            "profile write",
            self.timeouts.write,
            self.profiles.put_profile(&profile),
        )
        .await?;

        tracing::info!(
            owner = owner_id,
            stage = %extraction.stage,
            attempts = extraction.attempts,
            reenrolled = profile.registered_at != now,
            "profile enrolled"
        );
        self.spawn_upload(image, reference);
        Ok(profile)
    }

    /// Verify a captured photo against the owner's enrolled profile.
    pub async fn verify(
        &self,
        owner_id: &str,
        kind: AttendanceKind,
        image: Vec<u8>,
        location: GeoPoint,
    ) -> Result<Verification, AttendanceError> {
        check_owner(owner_id)?;
        let extraction = self.extract(image.clone()).await?;

        let profile = bounded(
            "profile lookup",
            self.timeouts.lookup,
            self.profiles.get_profile(owner_id),
        )
        .await?;
        let reference = profile
            .as_ref()
            .and_then(BiometricProfile::active_descriptor)
            .ok_or_else(|| AttendanceError::ProfileNotFound(owner_id.to_string()))?;

        let policy = bounded(
            "policy lookup",
            self.timeouts.lookup,
            self.policies.get_policy(owner_id),
        )
        .await?;

        let verification = self.scorer.score(&extraction.descriptor, reference)?;
        let within = is_within_geofence(location, policy.as_ref());
        let decision = self.decision.decide(verification, within);

        let event = AttendanceEvent::record(
            owner_id,
            kind,
            location,
            within,
            verification,
            decision,
            Utc::now(),
            image_extension(&image),
        );
        tracing::info!(
            owner = owner_id,
            event = %event.id,
            kind = kind.as_str(),
            score = event.match_score,
            within,
            status = event.status.as_str(),
            "attendance decided"
        );

        let mut warnings = Vec::new();
        if let Err(e) = bounded(
            "event write",
            self.timeouts.write,
            self.events.append_event(&event),
        )
        .await
        {
            tracing::warn!(event = %event.id, error = %e, "event not persisted");
            warnings.push(format!("event not saved: {e}"));
        }

        if let Some(hint) = &event.image_ref {
            self.spawn_upload(image, hint.clone());
        }

        Ok(Verification { event, warnings })
    }

    /// Like [`verify`](Self::verify), taking the fix from `provider`.
    pub async fn verify_with_provider(
        &self,
        owner_id: &str,
        kind: AttendanceKind,
        image: Vec<u8>,
        provider: &dyn LocationProvider,
    ) -> Result<Verification, AttendanceError> {
        let location = provider
            .current_location()
            .await
            .ok_or(AttendanceError::LocationUnavailable)?;
        self.verify(owner_id, kind, image, location).await
    }

    /// CheckOut if today's latest valid event is a CheckIn, else CheckIn.
    /// "Today" is the current UTC day.
    pub async fn suggest_kind(&self, owner_id: &str) -> Result<AttendanceKind, AttendanceError> {
        check_owner(owner_id)?;
        let now = Utc::now();
        let start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        let today = bounded(
            "event lookup",
            self.timeouts.lookup,
            self.events.query_events(owner_id, start, now),
        )
        .await?;
        Ok(next_kind(&today))
    }

    /// Events in `[from, to]`, newest first.
    pub async fn history(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AttendanceEvent>, AttendanceError> {
        check_owner(owner_id)?;
        if from > to {
            return Err(AttendanceError::InvalidRequest(format!(
                "history range starts after it ends ({from} > {to})"
            )));
        }
        bounded(
            "event lookup",
            self.timeouts.lookup,
            self.events.query_events(owner_id, from, to),
        )
        .await
    }

    /// Logical delete of the owner's profile.
    pub async fn remove(&self, owner_id: &str) -> Result<bool, AttendanceError> {
        check_owner(owner_id)?;
        let removed = bounded(
            "profile write",
            self.timeouts.write,
            self.profiles.clear_profile(owner_id),
        )
        .await?;
        tracing::info!(owner = owner_id, removed, "profile cleared");
        Ok(removed)
    }

    pub async fn set_policy(
        &self,
        owner_id: &str,
        policy: &GeofencePolicy,
    ) -> Result<(), AttendanceError> {
        check_owner(owner_id)?;
        bounded(
            "policy write",
            self.timeouts.write,
            self.policies.put_policy(owner_id, policy),
        )
        .await?;
        tracing::info!(
            owner = owner_id,
            required = policy.is_required,
            radius_m = policy.radius_meters,
            label = %policy.label,
            "geofence policy updated"
        );
        Ok(())
    }

    pub async fn policy(&self, owner_id: &str) -> Result<Option<GeofencePolicy>, AttendanceError> {
        check_owner(owner_id)?;
        bounded(
            "policy lookup",
            self.timeouts.lookup,
            self.policies.get_policy(owner_id),
        )
        .await
    }

    /// The first call waits for the model load outside the extraction budget.
    async fn extract(&self, image: Vec<u8>) -> Result<Extraction, AttendanceError> {
        let engine = self.engine.handle().await?;
        bounded("extraction", self.timeouts.extraction, engine.extract(image)).await
    }

    /// Best-effort upload. Failures are logged and never reach the caller.
    fn spawn_upload(&self, image: Vec<u8>, path_hint: String) {
        let uploader = Arc::clone(&self.uploader);
        let budget = self.timeouts.write;
        tokio::spawn(async move {
            match bounded("image upload", budget, uploader.upload(image, &path_hint)).await {
                Ok(url) => tracing::debug!(%url, "image uploaded"),
                Err(e) => tracing::warn!(hint = %path_hint, error = %e, "image upload failed"),
            }
        });
    }
}

/// Run `fut` under `budget`, mapping expiry to [`AttendanceError::Timeout`].
async fn bounded<T, E, F>(
    operation: &'static str,
    budget: Duration,
    fut: F,
) -> Result<T, AttendanceError>
where
    F: Future<Output = Result<T, E>>,
    AttendanceError: From<E>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result.map_err(AttendanceError::from),
        Err(_) => {
            tracing::warn!(operation, ?budget, "collaborator call timed out");
            Err(AttendanceError::Timeout { operation, budget })
        }
    }
}

fn next_kind(newest_first: &[AttendanceEvent]) -> AttendanceKind {
    match newest_first
        .iter()
        .find(|e| e.status == AttendanceStatus::Valid)
        .map(|e| e.kind)
    {
        Some(AttendanceKind::CheckIn) => AttendanceKind::CheckOut,
        _ => AttendanceKind::CheckIn,
    }
}

/// Owner ids become storage path segments.
fn check_owner(owner_id: &str) -> Result<(), AttendanceError> {
    let ok = !owner_id.is_empty()
        && owner_id != "."
        && owner_id != ".."
        && !owner_id.contains(['/', '\\'])
        && !owner_id.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(AttendanceError::InvalidRequest(format!("invalid owner id {owner_id:?}")))
    }
}

/// File extension for a photo, from its magic bytes. Unknown formats get "jpg".
fn image_extension(image: &[u8]) -> &'static str {
    image::guess_format(image)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("jpg")
}

/// Content-addressed storage key for an enrollment photo.
fn reference_image_ref(owner_id: &str, image: &[u8]) -> String {
    let digest = Sha256::digest(image);
    format!("profiles/{owner_id}/{digest:x}.{}", image_extension(image))
}
