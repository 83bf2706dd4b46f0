//! Outcome reporting shared by the filter, the pipeline and the lifecycle.
//!
//! Every outcome is logged, counted (both in-process and through the `metrics`
//! facade) and published on a broadcast channel so presentation collaborators
//! (notifications, UI) can follow along without the core formatting anything.

use crate::filter::Rejection;
use crate::lifecycle::ServiceState;
use crate::model::{AcceptedSample, RecordId};
use crate::pipeline::PipelineError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published to presentation collaborators
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    StateChanged { from: ServiceState, to: ServiceState },
    PermissionDenied,
    SampleAccepted(AcceptedSample),
    SampleRejected(Rejection),
    RecordStored { record_id: RecordId },
    RecordFailed { stage: &'static str, message: String },
}

/// Point-in-time copy of the tracking counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub samples_received: u64,
    pub samples_accepted: u64,
    pub rejected_low_accuracy: u64,
    pub rejected_insufficient_movement: u64,
    pub rejected_stale: u64,
    pub records_stored: u64,
    pub records_failed: u64,
    pub sessions_started: u64,
}

impl TrackingStats {
    pub fn samples_rejected(&self) -> u64 {
        self.rejected_low_accuracy + self.rejected_insufficient_movement + self.rejected_stale
    }
}

#[derive(Default)]
struct Counters {
    samples_received: AtomicU64,
    samples_accepted: AtomicU64,
    rejected_low_accuracy: AtomicU64,
    rejected_insufficient_movement: AtomicU64,
    rejected_stale: AtomicU64,
    records_stored: AtomicU64,
    records_failed: AtomicU64,
    sessions_started: AtomicU64,
}

pub struct Telemetry {
    events: broadcast::Sender<TrackerEvent>,
    counters: Counters,
}

impl Telemetry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            counters: Counters::default(),
        }
    }

    /// Subscribe to future events. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> TrackingStats {
        let c = &self.counters;
        TrackingStats {
            samples_received: c.samples_received.load(Ordering::Relaxed),
            samples_accepted: c.samples_accepted.load(Ordering::Relaxed),
            rejected_low_accuracy: c.rejected_low_accuracy.load(Ordering::Relaxed),
            rejected_insufficient_movement: c.rejected_insufficient_movement.load(Ordering::Relaxed),
            rejected_stale: c.rejected_stale.load(Ordering::Relaxed),
            records_stored: c.records_stored.load(Ordering::Relaxed),
            records_failed: c.records_failed.load(Ordering::Relaxed),
            sessions_started: c.sessions_started.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, event: TrackerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn sample_received(&self) {
        self.counters.samples_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tracker.samples.received").increment(1);
    }

    pub fn sample_accepted(&self, sample: &AcceptedSample) {
        self.counters.samples_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tracker.samples.accepted").increment(1);
        debug!(
            lat = sample.latitude,
            lng = sample.longitude,
            accuracy = sample.accuracy,
            "Sample accepted"
        );
        self.publish(TrackerEvent::SampleAccepted(sample.clone()));
    }

    pub fn sample_rejected(&self, rejection: &Rejection) {
        let counter = match rejection {
            Rejection::LowAccuracy { .. } => &self.counters.rejected_low_accuracy,
            Rejection::InsufficientMovement { .. } => &self.counters.rejected_insufficient_movement,
            Rejection::Stale { .. } => &self.counters.rejected_stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tracker.samples.rejected", "reason" => rejection.kind()).increment(1);
        debug!(reason = %rejection, "Sample rejected");
        self.publish(TrackerEvent::SampleRejected(rejection.clone()));
    }

    pub fn session_started(&self, uid: &str) {
        self.counters.sessions_started.fetch_add(1, Ordering::Relaxed);
        info!(uid = %uid, "Anonymous session established");
    }

    pub fn record_stored(&self, record_id: &RecordId) {
        self.counters.records_stored.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tracker.records.stored").increment(1);
        info!(record_id = %record_id, "Location record stored");
        self.publish(TrackerEvent::RecordStored {
            record_id: record_id.clone(),
        });
    }

    pub fn record_failed(&self, err: &PipelineError) {
        self.counters.records_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tracker.records.failed", "stage" => err.stage()).increment(1);
        error!(stage = err.stage(), error = %err, "Location record dropped");
        self.publish(TrackerEvent::RecordFailed {
            stage: err.stage(),
            message: err.to_string(),
        });
    }

    pub fn state_changed(&self, from: ServiceState, to: ServiceState) {
        info!(from = ?from, to = ?to, "Service state changed");
        self.publish(TrackerEvent::StateChanged { from, to });
    }

    pub fn permission_denied(&self) {
        warn!("Location permission denied");
        metrics::counter!("tracker.permission.denied").increment(1);
        self.publish(TrackerEvent::PermissionDenied);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawSample;

    #[test]
    fn test_counts_rejections_by_reason() {
        let telemetry = Telemetry::new();
        telemetry.sample_rejected(&Rejection::Stale { age_ms: 10, max: 5 });
        telemetry.sample_rejected(&Rejection::Stale { age_ms: 10, max: 5 });
        telemetry.sample_rejected(&Rejection::LowAccuracy {
            accuracy: 50.0,
            max: 10.0,
        });

        let stats = telemetry.stats();
        assert_eq!(stats.rejected_stale, 2);
        assert_eq!(stats.rejected_low_accuracy, 1);
        assert_eq!(stats.samples_rejected(), 3);
    }

    #[test]
    fn test_publishes_to_subscribers() {
        let telemetry = Telemetry::new();
        let mut events = telemetry.subscribe();

        let sample = AcceptedSample::new(RawSample::new(1.0, 2.0, 3.0, 4));
        telemetry.sample_accepted(&sample);
        telemetry.record_stored(&RecordId::from("rec123"));

        match events.try_recv().unwrap() {
            TrackerEvent::SampleAccepted(s) => assert_eq!(s.position(), (1.0, 2.0)),
            other => panic!("unexpected event {:?}", other),
        }
        match events.try_recv().unwrap() {
            TrackerEvent::RecordStored { record_id } => assert_eq!(record_id.as_str(), "rec123"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
