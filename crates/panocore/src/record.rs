use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Mean Earth radius used for haversine distances, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6373.0;

/// A scrape location. Identity is positional (its row in the input).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    #[inline]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in kilometres (haversine).
    pub fn distance_km(&self, other: &Point) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    /// Key used to collapse near-identical input points (1e-6 degree grid).
    #[inline]
    pub fn dedup_key(&self) -> (i64, i64) {
        (
            (self.latitude * 1e6).round() as i64,
            (self.longitude * 1e6).round() as i64,
        )
    }

    /// A `(resolution + 1)²` lattice over `center ± radius_km / 70` degrees,
    /// keeping only lattice points within `radius_km` of the center.
    pub fn grid_around(center: Point, radius_km: f64, resolution: u32) -> Vec<Point> {
        if resolution == 0 {
            return vec![center];
        }

        let span = radius_km / 70.0;
        let lat0 = center.latitude - span;
        let lon0 = center.longitude - span;
        let step = 2.0 * span / resolution as f64;

        let mut out = Vec::new();
        for i in 0..=resolution {
            for j in 0..=resolution {
                let p = Point::new(lat0 + i as f64 * step, lon0 + j as f64 * step);
                if p.distance_km(&center) <= radius_km {
                    out.push(p);
                }
            }
        }
        out
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RecordError {
    #[error("panorama id is empty")]
    EmptyId,
    #[error("panorama id {0:?} contains characters that are not path-safe")]
    UnsafeId(String),
    #[error("panorama {id}: coordinate ({lat}, {lon}) out of range")]
    BadCoordinate { id: String, lat: f64, lon: f64 },
}

/// One panorama as reported by the metadata service.
///
/// Serialized with the short keys the catalog files have always used
/// (`panoid`, `lat`, `lon`, `year`, `month`, `neighbors`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanoramaRecord {
    #[serde(rename = "panoid")]
    pub id: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
    #[serde(rename = "year", default, skip_serializing_if = "Option::is_none")]
    pub capture_year: Option<i32>,
    /// Raw month as reported; may fall outside 1..=12 until the date filter runs.
    #[serde(rename = "month", default, skip_serializing_if = "Option::is_none")]
    pub capture_month: Option<u32>,
    #[serde(rename = "neighbors", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub neighbor_ids: BTreeSet<String>,
}

impl PanoramaRecord {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            capture_year: None,
            capture_month: None,
            neighbor_ids: BTreeSet::new(),
        }
    }

    pub fn with_date(mut self, year: Option<i32>, month: Option<u32>) -> Self {
        self.capture_year = year;
        self.capture_month = month;
        self
    }

    #[inline]
    pub fn location(&self) -> Point {
        Point::new(self.latitude, self.longitude)
    }

    /// Month in 1..=12, or `None` when absent or out of range.
    #[inline]
    pub fn valid_month(&self) -> Option<u32> {
        self.capture_month.filter(|m| (1..=12).contains(m))
    }

    /// Checks the invariants every stage relies on: a non-empty, path-safe id
    /// and finite, in-range coordinates.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        let path_safe = self
            .id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !path_safe {
            return Err(RecordError::UnsafeId(self.id.clone()));
        }

        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if !lat_ok || !lon_ok {
            return Err(RecordError::BadCoordinate {
                id: self.id.clone(),
                lat: self.latitude,
                lon: self.longitude,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance() {
        // One degree of latitude is ~111.2 km on this sphere.
        let a = Point::new(40.0, -73.0);
        let b = Point::new(41.0, -73.0);
        let d = a.distance_km(&b);
        assert!((d - 111.23).abs() < 0.1, "got {d}");
        assert_eq!(a.distance_km(&a), 0.0);
    }

    #[test]
    fn grid_stays_inside_radius() {
        let center = Point::new(21.97, -159.37);
        let pts = Point::grid_around(center, 1.0, 10);
        assert!(!pts.is_empty());
        assert!(pts.iter().all(|p| p.distance_km(&center) <= 1.0));
        // The corners of the bounding box are outside the circle.
        assert!(pts.len() < 121);
    }

    #[test]
    fn validate_rejects_unsafe_ids_and_bad_coordinates() {
        assert!(PanoramaRecord::new("abc-123_X", 1.0, 2.0).validate().is_ok());
        assert_eq!(
            PanoramaRecord::new("", 1.0, 2.0).validate(),
            Err(RecordError::EmptyId)
        );
        assert!(matches!(
            PanoramaRecord::new("../etc", 1.0, 2.0).validate(),
            Err(RecordError::UnsafeId(_))
        ));
        assert!(matches!(
            PanoramaRecord::new("a", 91.0, 2.0).validate(),
            Err(RecordError::BadCoordinate { .. })
        ));
        assert!(matches!(
            PanoramaRecord::new("a", 1.0, f64::NAN).validate(),
            Err(RecordError::BadCoordinate { .. })
        ));
    }

    #[test]
    fn serializes_with_catalog_keys_and_omits_absent_fields() {
        let rec = PanoramaRecord::new("abc123", 40.0, -73.0).with_date(Some(2021), None);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"panoid": "abc123", "lat": 40.0, "lon": -73.0, "year": 2021})
        );
    }
}
