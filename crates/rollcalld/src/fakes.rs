//! In-memory collaborators and a colour-based analyzer for daemon tests.

use crate::collaborators::{
    EventStore, ImageUploader, PolicyStore, ProfileStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{ImageFormat, Rgb, RgbImage};
use rollcall_core::{
    AttendanceEvent, BiometricProfile, ExtractError, FaceAnalyzer, FaceDescriptor, GeofencePolicy,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// PNG bytes of a solid `w`×`h` image.
pub fn png(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(w, h, Rgb(rgb));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Treats saturated pixels as "the face" and describes them by their mean
/// colour. Black, grey and grayscale-converted input never contain a face.
#[derive(Clone, Copy)]
pub struct ColorAnalyzer;

impl FaceAnalyzer for ColorAnalyzer {
    fn analyze(
        &mut self,
        image: &RgbImage,
        _min_confidence: f32,
    ) -> Result<Option<FaceDescriptor>, ExtractError> {
        let mut sum = [0f64; 3];
        let mut n = 0u64;
        for px in image.pixels() {
            let hi = px.0.iter().max().copied().unwrap_or(0);
            let lo = px.0.iter().min().copied().unwrap_or(0);
            if hi - lo > 40 {
                for c in 0..3 {
                    sum[c] += px[c] as f64;
                }
                n += 1;
            }
        }
        if n == 0 {
            return Ok(None);
        }
        let mean: Vec<f32> = sum.iter().map(|s| (s / n as f64) as f32).collect();
        let norm = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = mean.iter().map(|v| v / norm).collect();
        Ok(Some(FaceDescriptor::new(values, Some("color".into())).unwrap()))
    }
}

/// Sleeps on every call, for extraction timeouts.
#[derive(Clone, Copy)]
pub struct SlowAnalyzer(pub Duration);

impl FaceAnalyzer for SlowAnalyzer {
    fn analyze(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Option<FaceDescriptor>, ExtractError> {
        std::thread::sleep(self.0);
        ColorAnalyzer.analyze(image, min_confidence)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    profiles: Mutex<HashMap<String, BiometricProfile>>,
    policies: Mutex<HashMap<String, GeofencePolicy>>,
    events: Mutex<Vec<AttendanceEvent>>,
    pub fail_appends: AtomicBool,
    lookup_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn with_lookup_delay(delay: Duration) -> Self {
        Self {
            lookup_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn push_event(&self, event: AttendanceEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn delay(&self) {
        if let Some(d) = self.lookup_delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, owner_id: &str) -> StoreResult<Option<BiometricProfile>> {
        self.delay().await;
        Ok(self.profiles.lock().unwrap().get(owner_id).cloned())
    }

    async fn put_profile(&self, profile: &BiometricProfile) -> StoreResult<()> {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.owner_id.clone(), profile.clone());
        Ok(())
    }

    async fn clear_profile(&self, owner_id: &str) -> StoreResult<bool> {
        let mut profiles = self.profiles.lock().unwrap();
        match profiles.remove(owner_id) {
            Some(p) => {
                profiles.insert(owner_id.to_string(), p.cleared(Utc::now()));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get_policy(&self, owner_id: &str) -> StoreResult<Option<GeofencePolicy>> {
        self.delay().await;
        Ok(self.policies.lock().unwrap().get(owner_id).cloned())
    }

    async fn put_policy(&self, owner_id: &str, policy: &GeofencePolicy) -> StoreResult<()> {
        self.policies
            .lock()
            .unwrap()
            .insert(owner_id.to_string(), policy.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: &AttendanceEvent) -> StoreResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Database("disk I/O error".into()));
        }
        self.push_event(event.clone());
        Ok(())
    }

    async fn query_events(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<AttendanceEvent>> {
        self.delay().await;
        let mut out: Vec<_> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.owner_id == owner_id && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryUploader {
    uploads: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl MemoryUploader {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageUploader for MemoryUploader {
    async fn upload(&self, _image: Vec<u8>, path_hint: &str) -> StoreResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Upload("bucket unavailable".into()));
        }
        self.uploads.lock().unwrap().push(path_hint.to_string());
        Ok(format!("mem://{path_hint}"))
    }
}
