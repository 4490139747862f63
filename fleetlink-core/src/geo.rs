//! Pure geography helpers: great-circle distance and polygon containment.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two points, in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// A geofence boundary: either a circle or an arbitrary polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geofence {
    Circle {
        center_lat: f64,
        center_lon: f64,
        radius_km: f64,
    },
    Polygon(Vec<(f64, f64)>), // (lat, lon) vertices, in order
}

impl Geofence {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self {
            Geofence::Circle {
                center_lat,
                center_lon,
                radius_km,
            } => haversine_km(lat, lon, *center_lat, *center_lon) <= *radius_km,
            Geofence::Polygon(vertices) => point_in_polygon(lat, lon, vertices),
        }
    }
}

/// Ray-casting point-in-polygon test over (lat, lon) pairs treated as a
/// planar (x, y) polygon — adequate at geofence scale (a few km), where
/// treating degrees as a flat plane introduces negligible error.
pub fn point_in_polygon(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let n = vertices.len();
    let mut j = n - 1;
    for i in 0..n {
        let (yi, xi) = vertices[i];
        let (yj, xj) = vertices[j];
        let intersects = ((yi > lat) != (yj > lat))
            && (lon < (xj - xi) * (lat - yi) / (yj - yi) + xi);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_same_point_is_zero() {
        assert!(haversine_km(40.0, -74.0, 40.0, -74.0) < 1e-9);
    }

    #[test]
    fn haversine_known_distance_ny_to_london() {
        // New York to London is roughly 5570 km.
        let d = haversine_km(40.7128, -74.0060, 51.5074, -0.1278);
        assert!((5500.0..5650.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn point_in_polygon_square() {
        let square = vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)];
        assert!(point_in_polygon(0.5, 0.5, &square));
        assert!(!point_in_polygon(2.0, 2.0, &square));
    }

    #[test]
    fn circle_geofence_contains_center() {
        let fence = Geofence::Circle {
            center_lat: 40.0,
            center_lon: -74.0,
            radius_km: 5.0,
        };
        assert!(fence.contains(40.0, -74.0));
        assert!(!fence.contains(41.0, -74.0));
    }
}
