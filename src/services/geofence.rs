//! Geofence containment
//!
//! Pure great-circle math over circular perimeters. No state, no I/O.

use crate::domain::error::AccessError;
use crate::domain::types::{Coordinate, Geofence};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters (Haversine)
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Whether `point` lies within `geofence` (boundary inclusive)
///
/// Ignores the active flag; callers choose which geofences to consult.
pub fn is_inside(point: Coordinate, geofence: &Geofence) -> Result<bool, AccessError> {
    point.validate()?;
    geofence.validate()?;
    Ok(haversine_distance(point, geofence.center) <= geofence.radius_m)
}

/// First active geofence, in definition order, that contains `point`
pub fn find_containing_geofence(
    point: Coordinate,
    geofences: &[Geofence],
) -> Result<Option<&Geofence>, AccessError> {
    point.validate()?;
    for geofence in geofences.iter().filter(|g| g.active) {
        if is_inside(point, geofence)? {
            return Ok(Some(geofence));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::GeofenceId;

    fn coord(latitude: f64, longitude: f64) -> Coordinate {
        Coordinate { latitude, longitude }
    }

    fn fence(id: i32, center: Coordinate, radius_m: f64) -> Geofence {
        Geofence { id: GeofenceId(id), name: format!("g{id}"), center, radius_m, active: true }
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = coord(5.7303596, -72.8943613);
        assert_eq!(haversine_distance(a, a), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = coord(10.0, -70.0);
        let b = coord(10.0123, -69.9871);
        let ab = haversine_distance(a, b);
        let ba = haversine_distance(b, a);
        assert!((ab - ba).abs() < 1e-9, "{ab} vs {ba}");
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let d = haversine_distance(coord(0.0, 0.0), coord(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 0.1, "got {d}");
    }

    #[test]
    fn test_hundred_meter_boundary() {
        let center = coord(10.0, -70.0);
        let g = fence(1, center, 100.0);

        // ~98.96 m north
        assert!(is_inside(coord(10.00089, -70.0), &g).unwrap());
        // ~101.08 m north
        assert!(!is_inside(coord(10.000909, -70.0), &g).unwrap());
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let center = coord(10.0, -70.0);
        let point = coord(10.0009, -70.0);
        let exact = haversine_distance(point, center);
        let g = fence(1, center, exact);
        assert!(is_inside(point, &g).unwrap());

        let shrunk = fence(1, center, exact - 1e-6);
        assert!(!is_inside(point, &shrunk).unwrap());
    }

    #[test]
    fn test_invalid_inputs() {
        let g = fence(1, coord(10.0, -70.0), 100.0);
        assert!(matches!(
            is_inside(coord(95.0, -70.0), &g),
            Err(AccessError::InvalidCoordinates { .. })
        ));
        let bad = fence(2, coord(10.0, -70.0), 0.0);
        assert!(matches!(is_inside(coord(10.0, -70.0), &bad), Err(AccessError::InvalidGeofence(_))));
    }

    #[test]
    fn test_find_skips_inactive_and_keeps_order() {
        let center = coord(10.0, -70.0);
        let mut first = fence(1, center, 500.0);
        first.active = false;
        let second = fence(2, center, 300.0);
        let third = fence(3, center, 1000.0);
        let fences = vec![first, second, third];

        let found = find_containing_geofence(coord(10.001, -70.0), &fences).unwrap();
        assert_eq!(found.map(|g| g.id), Some(GeofenceId(2)));

        let outside = find_containing_geofence(coord(11.0, -70.0), &fences).unwrap();
        assert!(outside.is_none());
    }

    #[test]
    fn test_find_with_no_geofences() {
        assert!(find_containing_geofence(coord(0.0, 0.0), &[]).unwrap().is_none());
        assert!(find_containing_geofence(coord(0.0, 200.0), &[]).is_err());
    }
}
