//! SQLite-backed profile, policy and event stores.

use crate::collaborators::{EventStore, PolicyStore, ProfileStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::{
    AttendanceEvent, AttendanceKind, AttendanceStatus, BiometricProfile, FaceDescriptor, GeoPoint,
    GeofencePolicy,
};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    owner_id            TEXT PRIMARY KEY,
    descriptor          TEXT,
    reference_image_ref TEXT,
    registered_at       TEXT NOT NULL,
    last_updated        TEXT NOT NULL,
    is_active           INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS policies (
    owner_id      TEXT PRIMARY KEY,
    is_required   INTEGER NOT NULL,
    latitude      REAL NOT NULL,
    longitude     REAL NOT NULL,
    radius_meters REAL NOT NULL,
    label         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    id                 TEXT PRIMARY KEY,
    owner_id           TEXT NOT NULL,
    timestamp          TEXT NOT NULL,
    kind               TEXT NOT NULL,
    latitude           REAL NOT NULL,
    longitude          REAL NOT NULL,
    is_within_geofence INTEGER NOT NULL,
    match_score        REAL NOT NULL,
    status             TEXT NOT NULL,
    note               TEXT NOT NULL,
    image_ref          TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_owner_time ON events (owner_id, timestamp);
";

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Fixed-width RFC 3339 so that string order matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(owner: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(owner, format!("timestamp {raw:?}: {e}")))
}

fn corrupt(owner: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        owner: owner.to_string(),
        reason: reason.into(),
    }
}

type ProfileRow = (String, Option<String>, Option<String>, String, String, bool);
type PolicyRow = (bool, f64, f64, f64, String);
type EventRow = (
    String,
    String,
    String,
    String,
    f64,
    f64,
    bool,
    f64,
    String,
    String,
    Option<String>,
);

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> StoreResult<Self> {
        conn.call(|c| Ok(c.execute_batch(SCHEMA)?)).await?;
        Ok(Self { conn })
    }

    /// Number of stored events, for status reporting.
    pub async fn event_count(&self) -> StoreResult<u64> {
        let n = self
            .conn
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM events", [], |r| r.get::<_, i64>(0))?))
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Number of active profiles, for status reporting.
    pub async fn active_profile_count(&self) -> StoreResult<u64> {
        let n = self
            .conn
            .call(|c| {
                Ok(c.query_row("SELECT COUNT(*) FROM profiles WHERE is_active = 1", [], |r| {
                    r.get::<_, i64>(0)
                })?)
            })
            .await?;
        Ok(n.max(0) as u64)
    }
}

fn profile_from_row(row: ProfileRow) -> StoreResult<BiometricProfile> {
    let (owner_id, descriptor, reference_image_ref, registered_at, last_updated, is_active) = row;
    let descriptor = descriptor
        .map(|raw| FaceDescriptor::from_storage(&raw))
        .transpose()
        .map_err(|e| corrupt(&owner_id, format!("descriptor: {e}")))?;
    Ok(BiometricProfile {
        registered_at: parse_ts(&owner_id, &registered_at)?,
        last_updated: parse_ts(&owner_id, &last_updated)?,
        descriptor,
        reference_image_ref,
        is_active,
        owner_id,
    })
}

fn event_from_row(row: EventRow) -> StoreResult<AttendanceEvent> {
    let (id, owner_id, timestamp, kind, lat, lon, within, score, status, note, image_ref) = row;
    let id = Uuid::parse_str(&id).map_err(|e| corrupt(&owner_id, format!("event id: {e}")))?;
    let kind: AttendanceKind = kind.parse().map_err(|e: String| corrupt(&owner_id, e))?;
    let status: AttendanceStatus = status.parse().map_err(|e: String| corrupt(&owner_id, e))?;
    let captured_location =
        GeoPoint::new(lat, lon).map_err(|e| corrupt(&owner_id, format!("location: {e}")))?;
    Ok(AttendanceEvent {
        id,
        timestamp: parse_ts(&owner_id, &timestamp)?,
        kind,
        captured_location,
        is_within_geofence: within,
        match_score: score as f32,
        status,
        note,
        image_ref,
        owner_id,
    })
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get_profile(&self, owner_id: &str) -> StoreResult<Option<BiometricProfile>> {
        let owner = owner_id.to_string();
        let row: Option<ProfileRow> = self
            .conn
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT owner_id, descriptor, reference_image_ref, registered_at, last_updated, is_active
                     FROM profiles WHERE owner_id = ?1",
                    [&owner],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
                )
                .optional()?)
            })
            .await?;
        row.map(profile_from_row).transpose()
    }

    async fn put_profile(&self, profile: &BiometricProfile) -> StoreResult<()> {
        let descriptor = profile
            .descriptor
            .as_ref()
            .map(FaceDescriptor::to_storage)
            .transpose()
            .map_err(|e| corrupt(&profile.owner_id, format!("descriptor: {e}")))?;
        let owner = profile.owner_id.clone();
        let reference = profile.reference_image_ref.clone();
        let registered = ts(&profile.registered_at);
        let updated = ts(&profile.last_updated);
        let active = profile.is_active;

        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO profiles (owner_id, descriptor, reference_image_ref, registered_at, last_updated, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(owner_id) DO UPDATE SET
                        descriptor = excluded.descriptor,
                        reference_image_ref = excluded.reference_image_ref,
                        registered_at = excluded.registered_at,
                        last_updated = excluded.last_updated,
                        is_active = excluded.is_active",
                    params![owner, descriptor, reference, registered, updated, active],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn clear_profile(&self, owner_id: &str) -> StoreResult<bool> {
        let owner = owner_id.to_string();
        let now = ts(&Utc::now());
        let changed = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE profiles SET descriptor = NULL, is_active = 0, last_updated = ?2
                     WHERE owner_id = ?1",
                    params![owner, now],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn get_policy(&self, owner_id: &str) -> StoreResult<Option<GeofencePolicy>> {
        let owner = owner_id.to_string();
        let row: Option<PolicyRow> = self
            .conn
            .call(move |c| {
                Ok(c.query_row(
                    "SELECT is_required, latitude, longitude, radius_meters, label
                     FROM policies WHERE owner_id = ?1",
                    [&owner],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .optional()?)
            })
            .await?;

        let Some((required, lat, lon, radius, label)) = row else {
            return Ok(None);
        };
        let center = GeoPoint::new(lat, lon).map_err(|e| corrupt(owner_id, format!("policy: {e}")))?;
        GeofencePolicy::new(required, center, radius, label)
            .map(Some)
            .map_err(|e| corrupt(owner_id, format!("policy: {e}")))
    }

    async fn put_policy(&self, owner_id: &str, policy: &GeofencePolicy) -> StoreResult<()> {
        let owner = owner_id.to_string();
        let p = policy.clone();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO policies (owner_id, is_required, latitude, longitude, radius_meters, label)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(owner_id) DO UPDATE SET
                        is_required = excluded.is_required,
                        latitude = excluded.latitude,
                        longitude = excluded.longitude,
                        radius_meters = excluded.radius_meters,
                        label = excluded.label",
                    params![
                        owner,
                        p.is_required,
                        p.center.latitude,
                        p.center.longitude,
                        p.radius_meters,
                        p.label
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append_event(&self, event: &AttendanceEvent) -> StoreResult<()> {
        let e = event.clone();
        let timestamp = ts(&e.timestamp);
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO events (id, owner_id, timestamp, kind, latitude, longitude,
                                         is_within_geofence, match_score, status, note, image_ref)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        e.id.to_string(),
                        e.owner_id,
                        timestamp,
                        e.kind.as_str(),
                        e.captured_location.latitude,
                        e.captured_location.longitude,
                        e.is_within_geofence,
                        e.match_score as f64,
                        e.status.as_str(),
                        e.note,
                        e.image_ref
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_events(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<AttendanceEvent>> {
        let owner = owner_id.to_string();
        let (from, to) = (ts(&from), ts(&to));
        let rows: Vec<EventRow> = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, owner_id, timestamp, kind, latitude, longitude,
                            is_within_geofence, match_score, status, note, image_ref
                     FROM events
                     WHERE owner_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                     ORDER BY timestamp DESC",
                )?;
                let rows = stmt
                    .query_map(params![owner, from, to], |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                            r.get(7)?,
                            r.get(8)?,
                            r.get(9)?,
                            r.get(10)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }
}
