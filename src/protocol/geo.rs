//! Great-circle distance on a spherical earth
//!
//! Good enough to rank peers by proximity. Not accurate near the poles
//! or across the antimeridian.

use super::Location;

/// Mean earth radius in km (3963 statute miles)
pub const EARTH_RADIUS_KM: f64 = 1.609_344 * 3963.0;

/// Distance between two locations in km using the spherical law of cosines
pub fn great_circle_km(a: &Location, b: &Location) -> f64 {
    let (lat_a, lat_b) = (a.lat.to_radians(), b.lat.to_radians());
    let delta_lng = (a.lng - b.lng).to_radians();

    // Rounding can push the cosine just outside [-1, 1] for identical points.
    let cos_angle = (lat_a.sin() * lat_b.sin() + lat_a.cos() * lat_b.cos() * delta_lng.cos())
        .clamp(-1.0, 1.0);

    EARTH_RADIUS_KM * cos_angle.acos()
}
