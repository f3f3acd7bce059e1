//! Great-circle distance on a spherical earth

use crate::domain::types::{Location, Position};

/// Mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two lat/lon pairs (degrees)
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

#[inline]
pub fn distance_m(position: &Position, location: &Location) -> f64 {
    haversine_m(position.latitude, position.longitude, location.latitude, location.longitude)
}
