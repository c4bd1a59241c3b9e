//! Location helpers the API layer calls synchronously.

use crate::geo_verify::{self, GeoError, VerificationResult};
use crate::model::{MecPlatform, SamplePayload, TelemetrySample, Timestamp};
use crate::subscription::{Area, GeoPoint};
use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// Last known location of a device, as the location-retrieval API reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub last_location_time: Timestamp,
    pub area: Area,
}

impl LocationReport {
    /// Builds a report from a DEVICE_LOCATION sample.
    ///
    /// Returns `None` for any other sample type.
    pub fn from_sample(sample: &TelemetrySample) -> Option<Self> {
        match sample.payload {
            SamplePayload::DeviceLocation { latitude, longitude } => Some(Self {
                last_location_time: sample.timestamp,
                area: Area::Circle {
                    center: GeoPoint::new(latitude, longitude),
                    radius: geo_verify::simulated_radius(latitude, longitude),
                },
            }),
            _ => None,
        }
    }

    /// Seconds elapsed between the sample and `now`.
    pub fn age_seconds(&self, now: Timestamp) -> i64 {
        (now - self.last_location_time).num_seconds()
    }

    /// Whether the report satisfies a `maxAge` requirement.
    pub fn satisfies_max_age(&self, now: Timestamp, max_age_seconds: u64) -> bool {
        self.age_seconds(now) <= max_age_seconds as i64
    }
}

/// Verifies that the device seen at `position` lies in `area`.
pub fn verify_location(position: GeoPoint, area: &Area) -> Result<VerificationResult, GeoError> {
    let device = geo_verify::device_shape(position)?;
    let target = geo_verify::area_shape(area)?;
    Ok(geo_verify::verify(&device, &target))
}

/// Returns the MEC platform geodesically closest to `position`.
pub fn closest_mec_platform<'a>(
    platforms: &'a [MecPlatform],
    position: GeoPoint,
) -> Option<&'a MecPlatform> {
    let device = Point::new(position.longitude, position.latitude);
    platforms
        .iter()
        .map(|p| {
            let site = Point::new(p.longitude, p.latitude);
            (p, device.haversine_distance(&site))
        })
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(p, _)| p)
}
