//! Sample source abstraction.
//!
//! A source pushes raw samples into a [`SampleConsumer`] from its own delivery
//! context until it is unsubscribed. The replay source below reads samples from
//! a newline-delimited JSON file; platform sources implement the same trait.

use crate::filter::{FilterConfig, PriorityHint};
use crate::model::RawSample;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Sample source unavailable: {0}")]
    Unavailable(String),
}

/// Delivery parameters handed to the source on subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub priority: PriorityHint,
    pub update_interval: Duration,
    pub min_update_interval: Duration,
    pub min_update_distance_meters: f64,
    pub wait_for_precise_fix: bool,
}

impl From<&FilterConfig> for SubscriptionRequest {
    fn from(config: &FilterConfig) -> Self {
        Self {
            priority: config.priority_hint,
            update_interval: Duration::from_millis(config.update_interval_ms),
            min_update_interval: Duration::from_millis(config.min_sample_interval_ms),
            min_update_distance_meters: config.min_displacement_meters,
            wait_for_precise_fix: config.wait_for_precise_fix,
        }
    }
}

/// Opaque token identifying one active subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Receives samples on the source's delivery context.
///
/// Implementations must return quickly; the source does not deliver the next
/// sample until `on_sample` returns.
pub trait SampleConsumer: Send + Sync {
    fn on_sample(&self, sample: RawSample);
}

/// Producer of raw position samples
pub trait SampleSource: Send + Sync {
    fn subscribe(
        &self,
        request: &SubscriptionRequest,
        consumer: Arc<dyn SampleConsumer>,
    ) -> Result<SubscriptionHandle, SourceError>;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

struct ReplayWorker {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Replays samples from a newline-delimited JSON file.
///
/// Each subscription gets its own delivery thread which emits one sample per
/// `pace` (or per the requested minimum interval when that is longer). Lines
/// that fail to parse are skipped.
pub struct ReplaySampleSource {
    path: PathBuf,
    pace: Duration,
    next_id: AtomicU64,
    workers: Mutex<HashMap<SubscriptionHandle, ReplayWorker>>,
}

impl ReplaySampleSource {
    pub fn new(path: impl Into<PathBuf>, pace: Duration) -> Self {
        Self {
            path: path.into(),
            pace,
            next_id: AtomicU64::new(1),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live delivery threads
    #[cfg(test)]
    fn active_subscriptions(&self) -> usize {
        self.workers.lock().len()
    }
}

impl SampleSource for ReplaySampleSource {
    fn subscribe(
        &self,
        request: &SubscriptionRequest,
        consumer: Arc<dyn SampleConsumer>,
    ) -> Result<SubscriptionHandle, SourceError> {
        let file = std::fs::File::open(&self.path).map_err(|e| {
            SourceError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let handle = SubscriptionHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let running = Arc::new(AtomicBool::new(true));
        let pace = self.pace.max(request.min_update_interval);
        let path = self.path.clone();

        let thread = {
            let running = running.clone();
            std::thread::Builder::new()
                .name(format!("replay-source-{}", handle.id()))
                .spawn(move || {
                    let mut delivered = 0u64;
                    for (line_no, line) in BufReader::new(file).lines().enumerate() {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        let line = match line {
                            Ok(line) => line,
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "Replay read failed");
                                break;
                            }
                        };
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<RawSample>(&line) {
                            Ok(sample) => {
                                if !deliver(&running, consumer.as_ref(), sample) {
                                    break;
                                }
                                delivered += 1;
                            }
                            Err(e) => {
                                warn!(line = line_no + 1, error = %e, "Skipping malformed sample");
                                continue;
                            }
                        }
                        std::thread::sleep(pace);
                    }
                    info!(delivered = delivered, "Replay finished");
                })
                .map_err(|e| SourceError::Unavailable(e.to_string()))?
        };

        self.workers
            .lock()
            .insert(handle, ReplayWorker { running, thread });

        info!(
            subscription = handle.id(),
            path = %self.path.display(),
            priority = ?request.priority,
            "Replay subscription started"
        );

        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let Some(worker) = self.workers.lock().remove(&handle) else {
            debug!(subscription = handle.id(), "Unknown subscription");
            return;
        };

        worker.running.store(false, Ordering::SeqCst);
        // The delivery thread notices the flag after its current sleep; do not
        // wait for it here
        drop(worker.thread);
        info!(subscription = handle.id(), "Replay subscription stopped");
    }
}

/// Hand a sample over unless the subscription was cancelled while it was
/// being read
fn deliver(running: &AtomicBool, consumer: &dyn SampleConsumer, sample: RawSample) -> bool {
    if !running.load(Ordering::SeqCst) {
        return false;
    }
    consumer.on_sample(sample);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collecting {
        samples: Mutex<Vec<RawSample>>,
    }

    impl SampleConsumer for Collecting {
        fn on_sample(&self, sample: RawSample) {
            self.samples.lock().push(sample);
        }
    }

    fn write_replay(lines: &[&str]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tracker-replay-{}.jsonl", Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn test_request_from_filter_config() {
        let request = SubscriptionRequest::from(&FilterConfig::balanced());
        assert_eq!(request.update_interval, Duration::from_secs(300));
        assert_eq!(request.min_update_interval, Duration::from_secs(60));
        assert_eq!(request.min_update_distance_meters, 100.0);
        assert_eq!(request.priority, PriorityHint::Balanced);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let source = ReplaySampleSource::new("/nonexistent/replay.jsonl", Duration::ZERO);
        let consumer = Arc::new(Collecting::default());
        let request = SubscriptionRequest::from(&FilterConfig::test());

        assert!(matches!(
            source.subscribe(&request, consumer),
            Err(SourceError::Unavailable(_))
        ));
        assert_eq!(source.active_subscriptions(), 0);
    }

    #[test]
    fn test_replay_delivers_valid_lines() {
        let path = write_replay(&[
            r#"{"latitude": 1.0, "longitude": 2.0, "accuracy": 3.0, "timestamp": 10}"#,
            "garbage",
            "",
            r#"{"latitude": 4.0, "longitude": 5.0, "accuracy": 6.0, "timestamp": 20, "provider": "gps"}"#,
        ]);
        let source = ReplaySampleSource::new(&path, Duration::ZERO);
        let consumer = Arc::new(Collecting::default());
        let request = SubscriptionRequest::from(&FilterConfig::test());

        let handle = source.subscribe(&request, consumer.clone()).unwrap();
        assert_eq!(source.active_subscriptions(), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while consumer.samples.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        source.unsubscribe(handle);
        assert_eq!(source.active_subscriptions(), 0);

        let samples = consumer.samples.lock();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].provider, "gps");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_cancelled_subscription_delivers_nothing() {
        let consumer = Collecting::default();
        let running = AtomicBool::new(true);

        assert!(deliver(&running, &consumer, RawSample::new(1.0, 2.0, 3.0, 10)));
        running.store(false, Ordering::SeqCst);
        assert!(!deliver(&running, &consumer, RawSample::new(4.0, 5.0, 6.0, 20)));

        let samples = consumer.samples.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].latitude, 1.0);
    }
}
