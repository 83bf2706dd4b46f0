//! Enrichment pipeline: accepted sample to stored remote record.
//!
//! ```text
//! submit() ──▶ serial worker ─────────────────────────────▶ spawned task
//!              1. session bootstrap                        3. remote write
//!              2. mapping + geocoding + device snapshot
//! ```
//!
//! Stages 1 and 2 run on one worker in arrival order, one sample at a time.
//! Remote writes are spawned so several may be in flight; their completion
//! order is not the submission order.

use crate::device::{DeviceStatusProvider, DeviceStatusSnapshot};
use crate::geocode::{address_for, Geocoder};
use crate::model::{AcceptedSample, LocationRecord, RawSample, RecordId, RecordPayload};
use crate::remote::{RemoteError, RemoteSink};
use crate::session::{AuthError, Session, SessionProvider};
use crate::telemetry::Telemetry;
use chrono::Utc;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

pub const DEFAULT_FUNCTION_NAME: &str = "onCallCreateOne";
pub const DEFAULT_COLLECTION: &str = "locations";

/// Failure of one sample's trip through the pipeline, tagged by stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Session bootstrap failed: {0}")]
    AuthFailure(#[source] AuthError),

    #[error("Record mapping failed: {0}")]
    MappingFailure(String),

    #[error("Remote write failed: {0}")]
    RemoteWriteFailure(#[source] RemoteError),

    #[error("Enrichment worker is not running")]
    WorkerStopped,
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::AuthFailure(_) => "auth",
            PipelineError::MappingFailure(_) => "mapping",
            PipelineError::RemoteWriteFailure(_) => "remote_write",
            PipelineError::WorkerStopped => "worker",
        }
    }
}

type Reply = oneshot::Sender<Result<RecordId, PipelineError>>;

pub(crate) struct Job {
    sample: AcceptedSample,
    reply: Reply,
}

/// Completion of one submitted sample.
///
/// Dropping it does not cancel the work; the outcome is still reported to
/// telemetry.
pub struct PendingRecord {
    rx: oneshot::Receiver<Result<RecordId, PipelineError>>,
}

impl Future for PendingRecord {
    type Output = Result<RecordId, PipelineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .rx
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(PipelineError::WorkerStopped)))
    }
}

/// Handle to the enrichment worker. Cheap to clone.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    jobs: mpsc::UnboundedSender<Job>,
}

impl EnrichmentPipeline {
    pub fn builder(
        session: Arc<dyn SessionProvider>,
        device: Arc<dyn DeviceStatusProvider>,
        sink: Arc<dyn RemoteSink>,
    ) -> EnrichmentPipelineBuilder {
        EnrichmentPipelineBuilder::new(session, device, sink)
    }

    /// Queue an accepted sample. Never blocks; callable from any thread.
    pub fn submit(&self, sample: AcceptedSample) -> PendingRecord {
        let (reply, rx) = oneshot::channel();
        if self.jobs.send(Job { sample, reply }).is_err() {
            // The job, and its reply sender, were dropped: rx resolves to
            // WorkerStopped
            debug!("Enrichment worker gone, sample dropped");
        }
        PendingRecord { rx }
    }

    /// Whether the worker still accepts samples
    pub fn is_running(&self) -> bool {
        !self.jobs.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn from_sender(jobs: mpsc::UnboundedSender<Job>) -> Self {
        Self { jobs }
    }
}

/// Builder wiring the pipeline's collaborators
pub struct EnrichmentPipelineBuilder {
    session: Arc<dyn SessionProvider>,
    device: Arc<dyn DeviceStatusProvider>,
    sink: Arc<dyn RemoteSink>,
    geocoder: Option<Arc<dyn Geocoder>>,
    telemetry: Option<Arc<Telemetry>>,
    function_name: String,
    collection: String,
    device_id: Option<String>,
    clock: fn() -> i64,
}

fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl EnrichmentPipelineBuilder {
    pub fn new(
        session: Arc<dyn SessionProvider>,
        device: Arc<dyn DeviceStatusProvider>,
        sink: Arc<dyn RemoteSink>,
    ) -> Self {
        Self {
            session,
            device,
            sink,
            geocoder: None,
            telemetry: None,
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            device_id: None,
            clock: wall_clock_ms,
        }
    }

    pub fn geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Override the `<manufacturer>-<device>` identifier
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Epoch-millisecond clock used for creation timestamps
    pub fn clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Start the worker on the current tokio runtime
    pub fn spawn(self) -> EnrichmentPipeline {
        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            session: self.session,
            device: self.device,
            sink: self.sink,
            geocoder: self.geocoder,
            telemetry: self.telemetry.unwrap_or_default(),
            function_name: self.function_name,
            collection: self.collection,
            device_id: self.device_id,
            clock: self.clock,
        });

        tokio::spawn(worker.run(rx));

        EnrichmentPipeline { jobs }
    }
}

struct Worker {
    session: Arc<dyn SessionProvider>,
    device: Arc<dyn DeviceStatusProvider>,
    sink: Arc<dyn RemoteSink>,
    geocoder: Option<Arc<dyn Geocoder>>,
    telemetry: Arc<Telemetry>,
    function_name: String,
    collection: String,
    device_id: Option<String>,
    clock: fn() -> i64,
}

impl Worker {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Job>) {
        debug!("Enrichment worker started");

        while let Some(Job { sample, reply }) = rx.recv().await {
            match self.prepare(sample).await {
                Ok(payload) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let result = worker.deliver(payload).await;
                        worker.report(&result);
                        let _ = reply.send(result);
                    });
                }
                Err(e) => {
                    self.report(&Err(e.clone()));
                    let _ = reply.send(Err(e));
                }
            }
        }

        debug!("Enrichment worker stopped");
    }

    /// Stages 1 and 2
    async fn prepare(&self, sample: AcceptedSample) -> Result<RecordPayload, PipelineError> {
        self.ensure_session().await?;

        let started = Instant::now();
        let document = self.map(sample.into_inner()).await?;
        metrics::histogram!("tracker.enrichment.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        Ok(RecordPayload {
            collection: self.collection.clone(),
            document,
        })
    }

    async fn ensure_session(&self) -> Result<Session, PipelineError> {
        if let Some(session) = self.session.current_session() {
            return Ok(session);
        }

        let session = self
            .session
            .sign_in_anonymously()
            .await
            .map_err(PipelineError::AuthFailure)?;
        self.telemetry.session_started(&session.uid);

        Ok(session)
    }

    /// Geocoding and device probing may block, so they run on the blocking
    /// pool. The worker awaits the result before taking the next job.
    async fn map(&self, sample: RawSample) -> Result<LocationRecord, PipelineError> {
        if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
            return Err(PipelineError::MappingFailure(format!(
                "non-finite coordinates ({}, {})",
                sample.latitude, sample.longitude
            )));
        }

        let geocoder = self.geocoder.clone();
        let device = self.device.clone();
        let device_id = self.device_id.clone();
        let clock = self.clock;

        tokio::task::spawn_blocking(move || {
            build_record(
                sample,
                geocoder.as_deref(),
                device.as_ref(),
                device_id.as_deref(),
                clock(),
            )
        })
        .await
        .map_err(|e| PipelineError::MappingFailure(format!("mapping task failed: {}", e)))
    }

    /// Stage 3
    #[instrument(skip(self, payload), fields(function = %self.function_name))]
    async fn deliver(&self, payload: RecordPayload) -> Result<RecordId, PipelineError> {
        match self.sink.invoke(&self.function_name, &payload).await {
            Ok(id) if id.as_str().is_empty() => {
                Err(PipelineError::RemoteWriteFailure(RemoteError::EmptyResponse))
            }
            Ok(id) => Ok(id),
            Err(e) => Err(PipelineError::RemoteWriteFailure(e)),
        }
    }

    fn report(&self, result: &Result<RecordId, PipelineError>) {
        match result {
            Ok(id) => self.telemetry.record_stored(id),
            Err(e) => self.telemetry.record_failed(e),
        }
    }
}

/// Build the record for one sample. Only the geocoder result and `now_ms`
/// vary between calls with the same inputs.
pub fn build_record(
    sample: RawSample,
    geocoder: Option<&dyn Geocoder>,
    device: &dyn DeviceStatusProvider,
    device_id: Option<&str>,
    now_ms: i64,
) -> LocationRecord {
    let address = address_for(geocoder, sample.latitude, sample.longitude);
    let user = match device_id {
        Some(id) => id.to_string(),
        None => device.device_info().identifier(),
    };

    LocationRecord {
        lat: sample.latitude,
        lng: sample.longitude,
        time: sample.timestamp,
        provider: sample.provider,
        accuracy: sample.accuracy,
        speed: sample.speed,
        altitude: sample.altitude,
        bearing: sample.bearing,
        user,
        address,
        date: now_ms,
        device_status: DeviceStatusSnapshot::capture(device, now_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::StaticDeviceStatus;
    use crate::geocode::{Address, GeocodeError, MockGeocoder};
    use crate::remote::MockRemoteSink;
    use crate::session::MockSessionProvider;
    use parking_lot::Mutex;

    const T: i64 = 1_700_000_000_000;

    fn fixed_clock() -> i64 {
        T + 500
    }

    fn session() -> Session {
        Session {
            uid: "anon-1".to_string(),
            anonymous: true,
            created_at: Utc::now(),
        }
    }

    fn signed_in() -> Arc<MockSessionProvider> {
        let mut provider = MockSessionProvider::new();
        provider.expect_current_session().returning(|| Some(session()));
        provider.expect_sign_in_anonymously().never();
        Arc::new(provider)
    }

    fn device() -> Arc<StaticDeviceStatus> {
        Arc::new(StaticDeviceStatus::new(DeviceConfig::default()))
    }

    fn paris_geocoder() -> Arc<MockGeocoder> {
        let mut geocoder = MockGeocoder::new();
        geocoder.expect_is_present().return_const(true);
        geocoder
            .expect_reverse_geocode()
            .returning(|_, _| Ok(Some(Address::single("Paris, France"))));
        Arc::new(geocoder)
    }

    fn paris() -> AcceptedSample {
        AcceptedSample::new(RawSample::new(48.8566, 2.3522, 5.0, T).with_provider("gps"))
    }

    fn capturing_sink(id: &'static str) -> (Arc<MockRemoteSink>, Arc<Mutex<Vec<(String, RecordPayload)>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink_captured = captured.clone();
        let mut sink = MockRemoteSink::new();
        sink.expect_invoke().returning(move |function, payload| {
            sink_captured
                .lock()
                .push((function.to_string(), payload.clone()));
            Ok(RecordId::from(id))
        });
        (Arc::new(sink), captured)
    }

    #[tokio::test]
    async fn test_end_to_end_resolves_remote_id() {
        let (sink, captured) = capturing_sink("rec123");
        let pipeline = EnrichmentPipeline::builder(signed_in(), device(), sink)
            .geocoder(paris_geocoder())
            .clock(fixed_clock)
            .spawn();

        let id = pipeline.submit(paris()).await.unwrap();
        assert_eq!(id.as_str(), "rec123");

        let calls = captured.lock();
        assert_eq!(calls.len(), 1);
        let (function, payload) = &calls[0];
        assert_eq!(function, DEFAULT_FUNCTION_NAME);
        assert_eq!(payload.collection, DEFAULT_COLLECTION);
        assert_eq!(payload.document.address, "Paris, France");
        assert_eq!(payload.document.lat, 48.8566);
        assert_eq!(payload.document.time, T);
        assert_eq!(payload.document.provider, "gps");
        assert_eq!(payload.document.date, T + 500);
    }

    #[tokio::test]
    async fn test_signs_in_when_no_session() {
        let mut provider = MockSessionProvider::new();
        provider.expect_current_session().returning(|| None);
        provider
            .expect_sign_in_anonymously()
            .times(1)
            .returning(|| Ok(session()));
        let (sink, _) = capturing_sink("rec1");
        let telemetry = Arc::new(Telemetry::new());

        let pipeline = EnrichmentPipeline::builder(Arc::new(provider), device(), sink)
            .telemetry(telemetry.clone())
            .spawn();

        assert!(pipeline.submit(paris()).await.is_ok());
        assert_eq!(telemetry.stats().sessions_started, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_skips_remote_write() {
        let mut provider = MockSessionProvider::new();
        provider.expect_current_session().returning(|| None);
        provider
            .expect_sign_in_anonymously()
            .returning(|| Err(AuthError::Unavailable("offline".to_string())));
        let mut sink = MockRemoteSink::new();
        sink.expect_invoke().never();
        let telemetry = Arc::new(Telemetry::new());

        let pipeline = EnrichmentPipeline::builder(Arc::new(provider), device(), Arc::new(sink))
            .telemetry(telemetry.clone())
            .spawn();

        let err = pipeline.submit(paris()).await.unwrap_err();
        assert!(matches!(err, PipelineError::AuthFailure(_)));
        assert_eq!(err.stage(), "auth");
        assert_eq!(telemetry.stats().records_failed, 1);
    }

    #[tokio::test]
    async fn test_geocoding_failure_still_writes_record() {
        let mut geocoder = MockGeocoder::new();
        geocoder.expect_is_present().return_const(true);
        geocoder
            .expect_reverse_geocode()
            .returning(|_, _| Err(GeocodeError::Unavailable("no backend".to_string())));
        let (sink, captured) = capturing_sink("rec9");

        let pipeline = EnrichmentPipeline::builder(signed_in(), device(), sink)
            .geocoder(Arc::new(geocoder))
            .spawn();

        let id = pipeline.submit(paris()).await.unwrap();
        assert_eq!(id.as_str(), "rec9");
        assert_eq!(captured.lock()[0].1.document.address, "");
    }

    #[tokio::test]
    async fn test_remote_failure_is_tagged_and_isolated() {
        let mut sink = MockRemoteSink::new();
        let mut calls = 0;
        sink.expect_invoke().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(RemoteError::Transport("connection reset".to_string()))
            } else {
                Ok(RecordId::from("rec2"))
            }
        });
        let telemetry = Arc::new(Telemetry::new());

        let pipeline = EnrichmentPipeline::builder(signed_in(), device(), Arc::new(sink))
            .telemetry(telemetry.clone())
            .spawn();

        let first = pipeline.submit(paris()).await;
        let second = pipeline.submit(paris()).await;

        assert!(matches!(
            first,
            Err(PipelineError::RemoteWriteFailure(RemoteError::Transport(_)))
        ));
        assert_eq!(second.unwrap().as_str(), "rec2");

        let stats = telemetry.stats();
        assert_eq!(stats.records_failed, 1);
        assert_eq!(stats.records_stored, 1);
    }

    #[tokio::test]
    async fn test_empty_record_id_is_a_failure() {
        let (sink, _) = capturing_sink("");
        let pipeline = EnrichmentPipeline::builder(signed_in(), device(), sink).spawn();

        let err = pipeline.submit(paris()).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::RemoteWriteFailure(RemoteError::EmptyResponse)
        );
    }

    #[tokio::test]
    async fn test_non_finite_coordinates_fail_mapping() {
        let mut sink = MockRemoteSink::new();
        sink.expect_invoke().never();
        let pipeline = EnrichmentPipeline::builder(signed_in(), device(), Arc::new(sink)).spawn();

        let bad = AcceptedSample::new(RawSample::new(f64::NAN, 2.0, 1.0, T));
        let err = pipeline.submit(bad).await.unwrap_err();
        assert_eq!(err.stage(), "mapping");
    }

    struct RecordingGeocoder {
        seen: Mutex<Vec<f64>>,
    }

    impl Geocoder for RecordingGeocoder {
        fn reverse_geocode(&self, latitude: f64, _longitude: f64) -> Result<Option<Address>, GeocodeError> {
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.seen.lock().push(latitude);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_mapping_preserves_arrival_order() {
        let geocoder = Arc::new(RecordingGeocoder {
            seen: Mutex::new(Vec::new()),
        });
        let mut sink = MockRemoteSink::new();
        sink.expect_invoke()
            .returning(|_, payload| Ok(RecordId::new(format!("rec-{}", payload.document.lat))));

        let pipeline = EnrichmentPipeline::builder(signed_in(), device(), Arc::new(sink))
            .geocoder(geocoder.clone())
            .spawn();

        let pending: Vec<_> = (0..10)
            .map(|i| pipeline.submit(AcceptedSample::new(RawSample::new(i as f64, 0.0, 1.0, T))))
            .collect();
        let results = futures::future::join_all(pending).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let expected: Vec<f64> = (0..10).map(|i| i as f64).collect();
        assert_eq!(*geocoder.seen.lock(), expected);
    }

    #[test]
    fn test_build_record_is_deterministic() {
        let geocoder = paris_geocoder();
        let device = device();
        let sample = RawSample::new(48.8566, 2.3522, 5.0, T)
            .with_speed(1.2)
            .with_altitude(35.0)
            .with_bearing(270.0);

        let first = build_record(sample.clone(), Some(geocoder.as_ref() as &dyn Geocoder), device.as_ref(), None, T);
        let second = build_record(sample, Some(geocoder.as_ref() as &dyn Geocoder), device.as_ref(), None, T);

        assert_eq!(first, second);
        assert_eq!(first.speed, Some(1.2));
        assert_eq!(first.altitude, Some(35.0));
        assert_eq!(first.bearing, Some(270.0));
        assert_eq!(first.user, DeviceConfig::default().manufacturer + "-" + &DeviceConfig::default().device);
    }

    #[test]
    fn test_build_record_device_id_override() {
        let record = build_record(
            RawSample::new(0.0, 0.0, 1.0, T),
            None,
            device().as_ref(),
            Some("fleet-42"),
            T,
        );
        assert_eq!(record.user, "fleet-42");
        assert_eq!(record.address, "");
        assert_eq!(record.provider, "unknown");
    }

    #[tokio::test]
    async fn test_submit_after_worker_stops() {
        let (jobs, rx) = mpsc::unbounded_channel();
        drop(rx);
        let pipeline = EnrichmentPipeline { jobs };

        assert!(!pipeline.is_running());
        let err = pipeline.submit(paris()).await.unwrap_err();
        assert_eq!(err, PipelineError::WorkerStopped);
    }
}
