//! Position samples and the records built from them.

use crate::device::DeviceStatusSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An unprocessed position reading as delivered by the sample source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f32,
    /// Fix time, epoch milliseconds
    pub timestamp: i64,
    /// Ground speed in m/s
    #[serde(default)]
    pub speed: Option<f32>,
    /// Altitude in meters above WGS84
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Bearing in degrees
    #[serde(default)]
    pub bearing: Option<f32>,
    /// Positioning provider that produced the fix (gps, fused, network, ...)
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "unknown".to_string()
}

impl RawSample {
    /// Sample with only the mandatory fields set
    pub fn new(latitude: f64, longitude: f64, accuracy: f32, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp,
            speed: None,
            altitude: None,
            bearing: None,
            provider: default_provider(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_bearing(mut self, bearing: f32) -> Self {
        self.bearing = Some(bearing);
        self
    }

    /// (latitude, longitude) pair in degrees
    pub fn position(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

/// A sample that passed every filter check.
///
/// Only the filtering engine constructs these; the enrichment pipeline consumes
/// each one exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedSample(RawSample);

impl AcceptedSample {
    pub(crate) fn new(sample: RawSample) -> Self {
        Self(sample)
    }

    pub fn sample(&self) -> &RawSample {
        &self.0
    }

    pub fn into_inner(self) -> RawSample {
        self.0
    }
}

impl std::ops::Deref for AcceptedSample {
    type Target = RawSample;

    fn deref(&self) -> &RawSample {
        &self.0
    }
}

/// Identifier assigned by the remote sink to a stored record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Fully enriched location document handed to the remote sink.
///
/// Field names follow the document schema the remote function expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub lat: f64,
    pub lng: f64,
    /// Fix time, epoch milliseconds
    pub time: i64,
    pub provider: String,
    pub accuracy: f32,
    pub speed: Option<f32>,
    pub altitude: Option<f64>,
    pub bearing: Option<f32>,
    /// Device identifier (`<manufacturer>-<device>` by default)
    pub user: String,
    /// Reverse geocoded address, empty when unavailable
    pub address: String,
    /// Record creation time, epoch milliseconds
    pub date: i64,
    #[serde(rename = "deviceStatus")]
    pub device_status: DeviceStatusSnapshot,
}

/// Wire payload for the remote write: the record plus its target collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub collection: String,
    pub document: LocationRecord,
}
