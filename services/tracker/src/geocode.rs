//! Best-effort reverse geocoding.

use crate::config::PlaceConfig;
use crate::filter::distance_meters;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeocodeError {
    #[error("Geocoding service unavailable: {0}")]
    Unavailable(String),

    #[error("Geocoding lookup failed: {0}")]
    Lookup(String),
}

/// A resolved address, one entry per display line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub lines: Vec<String>,
}

impl Address {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn single(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
        }
    }

    /// All lines joined with `", "`
    pub fn formatted(&self) -> String {
        self.lines.join(", ")
    }
}

/// Converts coordinates into a human readable address.
///
/// Implementations may block; the enrichment worker calls them off the async
/// executor.
#[cfg_attr(test, automock)]
pub trait Geocoder: Send + Sync {
    /// Whether a backend is reachable at all
    fn is_present(&self) -> bool {
        true
    }

    /// First match for the coordinates, `None` when nothing is known there
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<Option<Address>, GeocodeError>;
}

/// Resolve the address string for a position, absorbing every failure.
pub fn address_for(geocoder: Option<&dyn Geocoder>, latitude: f64, longitude: f64) -> String {
    let Some(geocoder) = geocoder else {
        return String::new();
    };
    if !geocoder.is_present() {
        return String::new();
    }

    match geocoder.reverse_geocode(latitude, longitude) {
        Ok(Some(address)) => address.formatted(),
        Ok(None) => String::new(),
        Err(e) => {
            tracing::warn!(error = %e, "Geocoding failed");
            String::new()
        }
    }
}

/// Offline geocoder resolving against a fixed list of named places.
///
/// The nearest place whose radius contains the position wins.
#[derive(Debug, Clone)]
pub struct GazetteerGeocoder {
    places: Vec<PlaceConfig>,
}

impl GazetteerGeocoder {
    pub fn new(places: Vec<PlaceConfig>) -> Self {
        Self { places }
    }
}

impl Geocoder for GazetteerGeocoder {
    fn is_present(&self) -> bool {
        !self.places.is_empty()
    }

    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<Option<Address>, GeocodeError> {
        let nearest = self
            .places
            .iter()
            .map(|place| {
                let distance = distance_meters((latitude, longitude), (place.latitude, place.longitude));
                (place, distance)
            })
            .filter(|(place, distance)| *distance <= place.radius_meters)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        Ok(nearest.map(|(place, _)| Address::new(place.address_lines.clone())))
    }
}
