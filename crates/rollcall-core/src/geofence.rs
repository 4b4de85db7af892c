//! Circular geofence check on a spherical Earth.

use crate::types::{GeoPoint, GeofencePolicy};

/// Mean Earth radius (IUGG), meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance in meters (haversine).
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // h can drift just past 1.0 for antipodal points
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_METERS * c
}

/// True when `point` satisfies `policy`.
///
/// An absent policy, or one with `is_required == false`, always passes.
pub fn is_within_geofence(point: GeoPoint, policy: Option<&GeofencePolicy>) -> bool {
    let Some(policy) = policy.filter(|p| p.is_required) else {
        return true;
    };

    let distance = haversine_distance(point, policy.center);
    let inside = distance <= policy.radius_meters;
    tracing::debug!(
        distance_m = distance,
        radius_m = policy.radius_meters,
        label = %policy.label,
        inside,
        "geofence evaluated"
    );
    inside
}
