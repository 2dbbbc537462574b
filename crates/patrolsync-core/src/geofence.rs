//! Great-circle distance and radius containment math
//!
//! Pure synchronous helpers; no dependencies on the rest of the pipeline.
//! Distances use the haversine formula on a sphere, which is accurate to
//! well under 0.5% at the scales a patrol site covers.

use crate::types::{CheckpointDefinition, GeoPoint};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters
///
/// Symmetric, zero for identical points, monotonic in angular separation.
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Whether `point` lies within `radius_meters` of `center`
///
/// The boundary is inclusive: a point exactly on the radius is inside.
pub fn within_radius(point: GeoPoint, center: GeoPoint, radius_meters: f64) -> bool {
    distance_meters(point, center) <= radius_meters
}

/// The checkpoint closest to `point`, or `None` for an empty candidate set
///
/// Linear scan over the candidates. Candidate sets are organizational-scale
/// (tens to low hundreds of checkpoints), so O(n) is fine here. Used to
/// attach a nearest checkpoint to incidents and backup requests that carry
/// no explicit checkpoint.
pub fn nearest<'a>(
    point: GeoPoint,
    candidates: &'a [CheckpointDefinition],
) -> Option<&'a CheckpointDefinition> {
    candidates.iter().min_by(|a, b| {
        let da = distance_meters(point, a.center);
        let db = distance_meters(point, b.center);
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    })
}
