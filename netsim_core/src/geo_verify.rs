//! The "SPACE" Engine - planar geo-verification
//!
//! Answers "is this device in that area?" the way the network-exposure APIs
//! expect it:
//! - Coordinates are projected to UTM, zone derived from each point
//! - Devices are circles (position + simulated uncertainty radius)
//! - Areas are circles or polygons
//! - Containment gives TRUE, partial overlap gives PARTIAL(matchRate),
//!   anything else gives FALSE
//!
//! Every function here is pure. The same coordinate always produces the same
//! radius, so the API layer and the geofencing matcher agree on a device's
//! footprint without sharing state.

use crate::subscription::{Area, GeoPoint};
use geo::{Area as _, BooleanOps, Contains, Coord, LineString, Polygon};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::f64::consts::PI;
use thiserror::Error;

/// Vertices used to approximate a buffered point.
pub const CIRCLE_SEGMENTS: usize = 64;

/// Mean of the simulated location uncertainty, in meters.
pub const RADIUS_MEAN: f64 = 10.0;

/// Standard deviation of the simulated location uncertainty, in meters.
pub const RADIUS_SIGMA: f64 = 5.0;

/// Smallest radius ever reported.
pub const RADIUS_FLOOR: f64 = 1.0;

// WGS84 / UTM constants
const K0: f64 = 0.9996;
const E: f64 = 0.00669438;
const E2: f64 = E * E;
const E3: f64 = E2 * E;
const E_P2: f64 = E / (1.0 - E);
const M1: f64 = 1.0 - E / 4.0 - 3.0 * E2 / 64.0 - 5.0 * E3 / 256.0;
const M2: f64 = 3.0 * E / 8.0 + 3.0 * E2 / 32.0 + 45.0 * E3 / 1024.0;
const M3: f64 = 15.0 * E2 / 256.0 + 45.0 * E3 / 1024.0;
const M4: f64 = 35.0 * E3 / 3072.0;
const EQUATORIAL_RADIUS: f64 = 6_378_137.0;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;
const ZONE_LETTERS: &[u8] = b"CDEFGHJKLMNPQRSTUVWXX";

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Degenerate shape: {0}")]
    DegenerateShape(String),
}

impl GeoError {
    fn coordinate(latitude: f64, longitude: f64) -> Self {
        Self::InvalidCoordinate(format!("({}, {}) is outside the UTM domain", latitude, longitude))
    }
}

/// A point projected to UTM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtmCoordinate {
    pub easting: f64,
    pub northing: f64,
    pub zone_number: u8,
    pub zone_letter: char,
}

impl UtmCoordinate {
    /// Planar (x, y) in meters.
    pub fn xy(&self) -> (f64, f64) {
        (self.easting, self.northing)
    }
}

/// Outcome of comparing a device footprint with a target area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verification_result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResult {
    True,
    Partial {
        /// Percentage of the device footprint inside the area, 1..=99
        match_rate: u8,
    },
    False,
}

impl VerificationResult {
    /// TRUE and PARTIAL both count as "inside" for geofencing.
    pub fn is_inside(&self) -> bool {
        !matches!(self, VerificationResult::False)
    }
}

/// Returns the UTM zone number and latitude band of a coordinate.
///
/// Honours the Norway and Svalbard exceptions.
pub fn utm_zone(latitude: f64, longitude: f64) -> Result<(u8, char), GeoError> {
    validate(latitude, longitude)?;

    let number = if (56.0..64.0).contains(&latitude) && (3.0..12.0).contains(&longitude) {
        32
    } else if (72.0..=84.0).contains(&latitude) && longitude >= 0.0 {
        match longitude {
            l if l < 9.0 => 31,
            l if l < 21.0 => 33,
            l if l < 33.0 => 35,
            l if l < 42.0 => 37,
            _ => standard_zone(longitude),
        }
    } else {
        standard_zone(longitude)
    };

    let band = ((latitude + 80.0) / 8.0).floor() as usize;
    let letter = ZONE_LETTERS[band.min(ZONE_LETTERS.len() - 1)] as char;
    Ok((number, letter))
}

fn standard_zone(longitude: f64) -> u8 {
    (((longitude + 180.0) / 6.0).floor() as i64).rem_euclid(60) as u8 + 1
}

fn validate(latitude: f64, longitude: f64) -> Result<(), GeoError> {
    let lat_ok = latitude.is_finite() && (-80.0..=84.0).contains(&latitude);
    let lon_ok = longitude.is_finite() && (-180.0..=180.0).contains(&longitude);
    if lat_ok && lon_ok {
        Ok(())
    } else {
        Err(GeoError::coordinate(latitude, longitude))
    }
}

/// Projects a WGS84 coordinate to planar meters in its own UTM zone.
///
/// # Arguments
/// * `latitude` - degrees, within [-80, 84]
/// * `longitude` - degrees, within [-180, 180]
pub fn project(latitude: f64, longitude: f64) -> Result<UtmCoordinate, GeoError> {
    let (zone_number, zone_letter) = utm_zone(latitude, longitude)?;

    let lat_rad = latitude.to_radians();
    let lat_sin = lat_rad.sin();
    let lat_cos = lat_rad.cos();
    let lat_tan = lat_rad.tan();
    let lat_tan2 = lat_tan * lat_tan;
    let lat_tan4 = lat_tan2 * lat_tan2;

    let central_lon = ((zone_number as f64 - 1.0) * 6.0 - 180.0 + 3.0).to_radians();
    let delta_lon = (longitude.to_radians() - central_lon + PI).rem_euclid(2.0 * PI) - PI;

    let n = EQUATORIAL_RADIUS / (1.0 - E * lat_sin * lat_sin).sqrt();
    let c = E_P2 * lat_cos * lat_cos;

    let a = lat_cos * delta_lon;
    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let m = EQUATORIAL_RADIUS
        * (M1 * lat_rad - M2 * (2.0 * lat_rad).sin() + M3 * (4.0 * lat_rad).sin()
            - M4 * (6.0 * lat_rad).sin());

    let easting = K0
        * n
        * (a + a3 / 6.0 * (1.0 - lat_tan2 + c)
            + a5 / 120.0 * (5.0 - 18.0 * lat_tan2 + lat_tan4 + 72.0 * c - 58.0 * E_P2))
        + FALSE_EASTING;

    let mut northing = K0
        * (m + n
            * lat_tan
            * (a2 / 2.0
                + a4 / 24.0 * (5.0 - lat_tan2 + 9.0 * c + 4.0 * c * c)
                + a6 / 720.0 * (61.0 - 58.0 * lat_tan2 + lat_tan4 + 600.0 * c - 330.0 * E_P2)));
    if latitude < 0.0 {
        northing += FALSE_NORTHING_SOUTH;
    }

    Ok(UtmCoordinate {
        easting,
        northing,
        zone_number,
        zone_letter,
    })
}

/// Builds a planar circle: the projected center buffered by `radius_m`.
pub fn circle(center: GeoPoint, radius_m: f64) -> Result<Polygon<f64>, GeoError> {
    if !(radius_m.is_finite() && radius_m > 0.0) {
        return Err(GeoError::DegenerateShape(format!("circle radius {}", radius_m)));
    }
    let (cx, cy) = project(center.latitude, center.longitude)?.xy();

    let ring: Vec<Coord<f64>> = (0..CIRCLE_SEGMENTS)
        .map(|i| {
            let theta = 2.0 * PI * i as f64 / CIRCLE_SEGMENTS as f64;
            Coord {
                x: cx + radius_m * theta.cos(),
                y: cy + radius_m * theta.sin(),
            }
        })
        .collect();
    Ok(Polygon::new(LineString::from(ring), vec![]))
}

/// Builds a planar polygon from projected vertices.
pub fn polygon(points: &[GeoPoint]) -> Result<Polygon<f64>, GeoError> {
    if points.len() < 3 {
        return Err(GeoError::DegenerateShape(format!(
            "polygon needs at least 3 vertices, got {}",
            points.len()
        )));
    }
    let ring = points
        .iter()
        .map(|p| project(p.latitude, p.longitude).map(|u| Coord { x: u.easting, y: u.northing }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(LineString::from(ring), vec![]))
}

/// Builds the planar shape of a subscription or verification area.
pub fn area_shape(area: &Area) -> Result<Polygon<f64>, GeoError> {
    match area {
        Area::Circle { center, radius } => circle(*center, *radius),
        Area::Polygon { boundary } => polygon(boundary),
    }
}

/// Builds the footprint of a device seen at a coordinate.
pub fn device_shape(position: GeoPoint) -> Result<Polygon<f64>, GeoError> {
    circle(position, simulated_radius(position.latitude, position.longitude))
}

/// Classifies a device footprint against an area.
///
/// Full containment wins. Otherwise the overlap share of the device area is
/// reported, clamped to 1..=99 so PARTIAL never reads as 0% or 100%.
pub fn verify(device: &Polygon<f64>, area: &Polygon<f64>) -> VerificationResult {
    if area.contains(device) {
        return VerificationResult::True;
    }

    let overlap = device.intersection(area).unsigned_area();
    let device_area = device.unsigned_area();
    if overlap > 0.0 && device_area > 0.0 {
        let rate = (overlap / device_area * 100.0).round().clamp(1.0, 99.0);
        return VerificationResult::Partial {
            match_rate: rate as u8,
        };
    }

    VerificationResult::False
}

/// Deterministic uncertainty radius for a coordinate, in meters.
///
/// One Gaussian(10, 5) draw from a generator seeded by a SHA-256 of the
/// coordinate, floored at 1 and rounded to centimeters.
pub fn simulated_radius(latitude: f64, longitude: f64) -> f64 {
    let digest = Sha256::digest(format!("{}{}", latitude, longitude).as_bytes());
    let seed: [u8; 32] = digest.into();
    let mut rng = ChaCha8Rng::from_seed(seed);

    let z: f64 = rng.sample(StandardNormal);
    let value = (RADIUS_MEAN + RADIUS_SIGMA * z).max(RADIUS_FLOOR);
    (value * 100.0).round() / 100.0
}
