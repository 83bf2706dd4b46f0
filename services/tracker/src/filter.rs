use crate::model::{AcceptedSample, RawSample};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius (IUGG) in meters used for every distance computation
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Positioning priority requested from the sample source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityHint {
    HighAccuracy,
    #[default]
    Balanced,
    LowPower,
    Passive,
}

/// Thresholds for the filtering engine and the cadence requested from the
/// sample source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Reject samples whose accuracy radius exceeds this
    pub max_accuracy_meters: f32,
    /// Reject samples closer than this to the last accepted one
    pub min_displacement_meters: f64,
    /// Desired delivery interval
    pub update_interval_ms: u64,
    /// Fastest delivery interval the source may use
    pub min_sample_interval_ms: u64,
    /// Reject samples older than this when evaluated
    pub max_sample_age_ms: i64,
    pub priority_hint: PriorityHint,
    /// Ask the source to hold the first delivery until a precise fix exists
    pub wait_for_precise_fix: bool,
}

impl FilterConfig {
    /// Battery friendly tracking: 100 m steps, 5 minute cadence
    pub fn balanced() -> Self {
        Self {
            max_accuracy_meters: 100.0,
            min_displacement_meters: 100.0,
            update_interval_ms: 5 * 60 * 1000,
            min_sample_interval_ms: 60 * 1000,
            max_sample_age_ms: 5 * 60 * 1000,
            priority_hint: PriorityHint::Balanced,
            wait_for_precise_fix: false,
        }
    }

    /// Fine grained tracking: 50 m steps, 10 second cadence
    pub fn precise() -> Self {
        Self {
            max_accuracy_meters: 50.0,
            min_displacement_meters: 50.0,
            update_interval_ms: 10 * 1000,
            min_sample_interval_ms: 5 * 1000,
            max_sample_age_ms: 60 * 1000,
            priority_hint: PriorityHint::HighAccuracy,
            wait_for_precise_fix: true,
        }
    }

    /// Development profile: every accurate, fresh sample passes
    pub fn test() -> Self {
        Self {
            max_accuracy_meters: 10.0,
            min_displacement_meters: 0.0,
            update_interval_ms: 1000,
            min_sample_interval_ms: 0,
            max_sample_age_ms: 60 * 60 * 1000,
            priority_hint: PriorityHint::HighAccuracy,
            wait_for_precise_fix: false,
        }
    }

    /// Look up a named preset
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "balanced" => Some(Self::balanced()),
            "precise" => Some(Self::precise()),
            "test" => Some(Self::test()),
            _ => None,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Why a sample was dropped
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    LowAccuracy { accuracy: f32, max: f32 },
    InsufficientMovement { distance_meters: f64, min: f64 },
    Stale { age_ms: i64, max: i64 },
}

impl Rejection {
    /// Short label used for metrics and events
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::LowAccuracy { .. } => "low_accuracy",
            Rejection::InsufficientMovement { .. } => "insufficient_movement",
            Rejection::Stale { .. } => "stale",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::LowAccuracy { accuracy, max } => {
                write!(f, "Accuracy too low: {:.1}m > max {:.1}m", accuracy, max)
            }
            Rejection::InsufficientMovement { distance_meters, min } => {
                write!(f, "Moved {:.1}m < min {:.1}m", distance_meters, min)
            }
            Rejection::Stale { age_ms, max } => {
                write!(f, "Sample too old: {}ms > max {}ms", age_ms, max)
            }
        }
    }
}

/// Outcome of evaluating one raw sample
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Accepted(AcceptedSample),
    Rejected(Rejection),
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accepted(_))
    }
}

/// Stateful gatekeeper deciding which raw samples are worth keeping.
///
/// Checks run in a fixed order (accuracy, displacement, staleness) and the
/// first failing check names the rejection. The only state is the last
/// accepted sample, updated on acceptance.
#[derive(Debug)]
pub struct FilterEngine {
    config: FilterConfig,
    last_accepted: Option<AcceptedSample>,
}

impl FilterEngine {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            last_accepted: None,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn last_accepted(&self) -> Option<&AcceptedSample> {
        self.last_accepted.as_ref()
    }

    /// Evaluate against the wall clock
    pub fn evaluate(&mut self, sample: RawSample) -> FilterDecision {
        self.evaluate_at(sample, Utc::now().timestamp_millis())
    }

    /// Evaluate with an explicit `now` in epoch milliseconds
    pub fn evaluate_at(&mut self, sample: RawSample, now_ms: i64) -> FilterDecision {
        if let Some(rejection) = self.check(&sample, now_ms) {
            return FilterDecision::Rejected(rejection);
        }

        let accepted = AcceptedSample::new(sample);
        self.last_accepted = Some(accepted.clone());
        FilterDecision::Accepted(accepted)
    }

    /// Forget the last accepted sample
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }

    fn check(&self, sample: &RawSample, now_ms: i64) -> Option<Rejection> {
        // An unknown (NaN) radius counts as too inaccurate
        if sample.accuracy.is_nan() || sample.accuracy > self.config.max_accuracy_meters {
            return Some(Rejection::LowAccuracy {
                accuracy: sample.accuracy,
                max: self.config.max_accuracy_meters,
            });
        }

        if let Some(last) = &self.last_accepted {
            let distance_meters = distance_meters(last.position(), sample.position());
            if distance_meters < self.config.min_displacement_meters {
                return Some(Rejection::InsufficientMovement {
                    distance_meters,
                    min: self.config.min_displacement_meters,
                });
            }
        }

        let age_ms = now_ms.saturating_sub(sample.timestamp);
        if age_ms > self.config.max_sample_age_ms {
            return Some(Rejection::Stale {
                age_ms,
                max: self.config.max_sample_age_ms,
            });
        }

        None
    }
}

/// Great-circle distance in meters between two (latitude, longitude) pairs,
/// using the haversine formula on a sphere of [`EARTH_RADIUS_METERS`].
pub fn distance_meters(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = from;
    let (lat2, lon2) = to;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn sample_at(lat: f64, lng: f64, accuracy: f32) -> RawSample {
        RawSample::new(lat, lng, accuracy, NOW)
    }

    fn engine() -> FilterEngine {
        FilterEngine::new(FilterConfig {
            max_accuracy_meters: 10.0,
            min_displacement_meters: 100.0,
            update_interval_ms: 1000,
            min_sample_interval_ms: 0,
            max_sample_age_ms: 60_000,
            priority_hint: PriorityHint::HighAccuracy,
            wait_for_precise_fix: false,
        })
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let dist = distance_meters((0.0, 0.0), (1.0, 0.0));
        assert!((dist - 111_195.0).abs() < 5.0, "got {}", dist);
    }

    #[test]
    fn test_distance_paris_london() {
        let dist = distance_meters((48.8566, 2.3522), (51.5074, -0.1278));
        assert!((dist - 343_500.0).abs() < 1_000.0, "got {}", dist);
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_same_point() {
        let a = (45.764, 4.8357);
        let b = (45.75, 4.85);
        assert_eq!(distance_meters(a, a), 0.0);
        assert!((distance_meters(a, b) - distance_meters(b, a)).abs() < 1e-9);
    }

    #[test]
    fn test_accuracy_boundary_inclusive() {
        let mut selector = engine();
        assert!(selector.evaluate_at(sample_at(0.0, 0.0, 10.0), NOW).is_accepted());

        let mut selector = engine();
        match selector.evaluate_at(sample_at(0.0, 0.0, 10.001), NOW) {
            FilterDecision::Rejected(Rejection::LowAccuracy { .. }) => {}
            other => panic!("Expected LowAccuracy, got {:?}", other),
        }
    }

    #[test]
    fn test_first_sample_ignores_displacement() {
        let mut selector = FilterEngine::new(FilterConfig {
            min_displacement_meters: 1_000_000.0,
            ..FilterConfig::test()
        });

        assert!(selector.evaluate_at(sample_at(1.0, 1.0, 1.0), NOW).is_accepted());
        assert!(selector.last_accepted().is_some());
    }

    #[test]
    fn test_displacement_boundary_inclusive() {
        let first = (48.8566, 2.3522);
        let second = (48.8576, 2.3522);
        let exact = distance_meters(first, second);

        let mut selector = FilterEngine::new(FilterConfig {
            min_displacement_meters: exact,
            ..FilterConfig::test()
        });

        assert!(selector.evaluate_at(sample_at(first.0, first.1, 1.0), NOW).is_accepted());
        assert!(selector.evaluate_at(sample_at(second.0, second.1, 1.0), NOW).is_accepted());
    }

    #[test]
    fn test_displacement_rejects_close_sample() {
        let mut selector = engine();
        assert!(selector.evaluate_at(sample_at(48.8566, 2.3522, 5.0), NOW).is_accepted());

        match selector.evaluate_at(sample_at(48.8567, 2.3522, 5.0), NOW) {
            FilterDecision::Rejected(Rejection::InsufficientMovement { distance_meters, min }) => {
                assert!(distance_meters < min);
            }
            other => panic!("Expected InsufficientMovement, got {:?}", other),
        }

        // Rejection leaves the reference point untouched
        assert_eq!(
            selector.last_accepted().unwrap().position(),
            (48.8566, 2.3522)
        );
    }

    #[test]
    fn test_staleness_boundary_inclusive() {
        let mut selector = engine();
        let fresh = RawSample::new(0.0, 0.0, 1.0, NOW - 60_000);
        assert!(selector.evaluate_at(fresh, NOW).is_accepted());

        let mut selector = engine();
        let stale = RawSample::new(0.0, 0.0, 1.0, NOW - 60_001);
        match selector.evaluate_at(stale, NOW) {
            FilterDecision::Rejected(Rejection::Stale { age_ms, .. }) => assert_eq!(age_ms, 60_001),
            other => panic!("Expected Stale, got {:?}", other),
        }
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut selector = engine();
        match selector.evaluate_at(RawSample::new(0.0, 0.0, 1.0, i64::MIN), NOW) {
            FilterDecision::Rejected(Rejection::Stale { age_ms, .. }) => assert_eq!(age_ms, i64::MAX),
            other => panic!("Expected Stale, got {:?}", other),
        }

        // Far future: negative age, never stale
        let mut selector = engine();
        assert!(selector
            .evaluate_at(RawSample::new(0.0, 0.0, 1.0, i64::MAX), i64::MIN)
            .is_accepted());
    }

    #[test]
    fn test_nan_accuracy_is_low_accuracy() {
        let mut selector = engine();
        match selector.evaluate_at(sample_at(0.0, 0.0, f32::NAN), NOW) {
            FilterDecision::Rejected(rejection) => assert_eq!(rejection.kind(), "low_accuracy"),
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert!(selector.last_accepted().is_none());
    }

    #[test]
    fn test_check_order_accuracy_first() {
        let mut selector = engine();
        let bad_everything = RawSample::new(0.0, 0.0, 500.0, NOW - 10_000_000);

        match selector.evaluate_at(bad_everything, NOW) {
            FilterDecision::Rejected(rejection) => assert_eq!(rejection.kind(), "low_accuracy"),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_check_order_displacement_before_staleness() {
        let mut selector = engine();
        assert!(selector.evaluate_at(sample_at(10.0, 10.0, 1.0), NOW).is_accepted());

        let close_and_stale = RawSample::new(10.0, 10.0, 1.0, NOW - 10_000_000);
        match selector.evaluate_at(close_and_stale, NOW) {
            FilterDecision::Rejected(rejection) => {
                assert_eq!(rejection.kind(), "insufficient_movement")
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let samples = vec![
            sample_at(48.8566, 2.3522, 5.0),
            sample_at(48.8567, 2.3522, 5.0),
            sample_at(48.8600, 2.3522, 50.0),
            sample_at(48.8600, 2.3522, 5.0),
            RawSample::new(48.8700, 2.3522, 5.0, NOW - 120_000),
            sample_at(48.8700, 2.3522, 5.0),
        ];

        let run = |samples: &[RawSample]| -> Vec<bool> {
            let mut selector = engine();
            samples
                .iter()
                .cloned()
                .map(|s| selector.evaluate_at(s, NOW).is_accepted())
                .collect()
        };

        let first = run(&samples);
        assert_eq!(first, run(&samples));
        assert_eq!(first, vec![true, false, false, true, false, true]);
    }

    #[test]
    fn test_reset_forgets_last_accepted() {
        let mut selector = engine();
        assert!(selector.evaluate_at(sample_at(0.0, 0.0, 1.0), NOW).is_accepted());
        selector.reset();
        assert!(selector.evaluate_at(sample_at(0.0, 0.0, 1.0), NOW).is_accepted());
    }

    #[test]
    fn test_presets() {
        assert_eq!(FilterConfig::preset("balanced"), Some(FilterConfig::balanced()));
        assert_eq!(FilterConfig::preset("PRECISE"), Some(FilterConfig::precise()));
        assert_eq!(FilterConfig::preset("test"), Some(FilterConfig::test()));
        assert!(FilterConfig::preset("turbo").is_none());

        assert_eq!(FilterConfig::balanced().min_displacement_meters, 100.0);
        assert_eq!(FilterConfig::precise().min_displacement_meters, 50.0);
    }

    #[test]
    fn test_rejection_display() {
        let rejection = Rejection::LowAccuracy {
            accuracy: 25.0,
            max: 10.0,
        };
        assert!(rejection.to_string().contains("Accuracy too low"));
    }
}
