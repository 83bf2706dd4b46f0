//! Service lifecycle state machine.
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`
//!
//! The machine gates the sample source subscription and mirrors whether the
//! service should be running into the state store, so an unexpected process
//! death is recovered on the next boot signal.

use crate::device::PermissionChecker;
use crate::filter::{FilterConfig, FilterDecision, FilterEngine};
use crate::model::RawSample;
use crate::pipeline::{EnrichmentPipeline, PipelineError};
use crate::source::{SampleConsumer, SampleSource, SourceError, SubscriptionHandle, SubscriptionRequest};
use crate::store::{StateKey, StateStore, StoreError};
use crate::telemetry::{Telemetry, TrackerEvent, TrackingStats};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Sample source error: {0}")]
    Source(#[from] SourceError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Platform signal announcing that the device finished booting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSignal {
    BootCompleted,
    LockedBootCompleted,
    QuickbootPoweron,
}

impl BootSignal {
    /// Parse an intent action, either bare (`BOOT_COMPLETED`) or qualified
    /// (`android.intent.action.BOOT_COMPLETED`). Unknown actions yield `None`.
    pub fn from_action(action: &str) -> Option<Self> {
        let name = action.rsplit('.').next().unwrap_or(action);
        match name {
            "BOOT_COMPLETED" => Some(BootSignal::BootCompleted),
            "LOCKED_BOOT_COMPLETED" => Some(BootSignal::LockedBootCompleted),
            "QUICKBOOT_POWERON" => Some(BootSignal::QuickbootPoweron),
            _ => None,
        }
    }
}

/// Consumer handed to the sample source: filter, then enqueue for enrichment
struct FilteringConsumer {
    engine: Arc<Mutex<FilterEngine>>,
    pipeline: EnrichmentPipeline,
    telemetry: Arc<Telemetry>,
}

impl SampleConsumer for FilteringConsumer {
    fn on_sample(&self, sample: RawSample) {
        self.telemetry.sample_received();

        let decision = self.engine.lock().evaluate(sample);
        match decision {
            FilterDecision::Accepted(accepted) => {
                self.telemetry.sample_accepted(&accepted);
                if !self.pipeline.is_running() {
                    self.telemetry.record_failed(&PipelineError::WorkerStopped);
                    return;
                }
                // Outcome is reported through telemetry
                drop(self.pipeline.submit(accepted));
            }
            FilterDecision::Rejected(rejection) => self.telemetry.sample_rejected(&rejection),
        }
    }
}

struct Inner {
    state: ServiceState,
    subscription: Option<SubscriptionHandle>,
}

/// Tracking service: owns the lifecycle and wires source, filter and pipeline.
///
/// `start` and `stop` are mutually exclusive; each runs its whole transition
/// under one lock.
pub struct TrackerService {
    filter_config: FilterConfig,
    engine: Arc<Mutex<FilterEngine>>,
    source: Arc<dyn SampleSource>,
    pipeline: EnrichmentPipeline,
    store: Arc<dyn StateStore>,
    permissions: Arc<dyn PermissionChecker>,
    telemetry: Arc<Telemetry>,
    inner: Mutex<Inner>,
}

impl TrackerService {
    pub fn new(
        filter_config: FilterConfig,
        source: Arc<dyn SampleSource>,
        pipeline: EnrichmentPipeline,
        store: Arc<dyn StateStore>,
        permissions: Arc<dyn PermissionChecker>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(FilterEngine::new(filter_config.clone()))),
            filter_config,
            source,
            pipeline,
            store,
            permissions,
            telemetry,
            inner: Mutex::new(Inner {
                state: ServiceState::Stopped,
                subscription: None,
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> TrackingStats {
        self.telemetry.stats()
    }

    pub fn events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.telemetry.subscribe()
    }

    pub fn filter_config(&self) -> &FilterConfig {
        &self.filter_config
    }

    /// Persisted "should be running" flag
    pub fn was_running(&self) -> bool {
        self.store.get(StateKey::ServiceRunning, false)
    }

    pub fn auto_start_enabled(&self) -> bool {
        self.store.get(StateKey::AutoStartEnabled, false)
    }

    pub fn set_auto_start(&self, enabled: bool) -> Result<(), LifecycleError> {
        self.store.set(StateKey::AutoStartEnabled, enabled)?;
        info!(enabled = enabled, "Auto-start preference updated");
        Ok(())
    }

    /// Begin tracking. Does nothing when already starting or running.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ServiceState::Running | ServiceState::Starting) {
            debug!(state = %inner.state, "Start ignored");
            return Ok(());
        }

        self.transition(&mut inner, ServiceState::Starting);

        if !self.permissions.has_location_permission() {
            self.abort_start(&mut inner);
            self.telemetry.permission_denied();
            return Err(LifecycleError::PermissionDenied);
        }

        // Each run starts without a previous fix
        self.engine.lock().reset();
        let consumer = Arc::new(FilteringConsumer {
            engine: self.engine.clone(),
            pipeline: self.pipeline.clone(),
            telemetry: self.telemetry.clone(),
        });
        let request = SubscriptionRequest::from(&self.filter_config);

        let handle = match self.source.subscribe(&request, consumer) {
            Ok(handle) => handle,
            Err(SourceError::PermissionDenied) => {
                self.abort_start(&mut inner);
                self.telemetry.permission_denied();
                return Err(LifecycleError::PermissionDenied);
            }
            Err(e) => {
                warn!(error = %e, "Sample source refused subscription");
                self.abort_start(&mut inner);
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.set(StateKey::ServiceRunning, true) {
            self.source.unsubscribe(handle);
            self.abort_start(&mut inner);
            return Err(e.into());
        }

        inner.subscription = Some(handle);
        self.transition(&mut inner, ServiceState::Running);
        metrics::counter!("tracker.lifecycle.starts").increment(1);

        Ok(())
    }

    /// End tracking. In-flight enrichment and remote writes are not cancelled.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ServiceState::Stopped | ServiceState::Stopping) {
            debug!(state = %inner.state, "Stop ignored");
            return Ok(());
        }

        self.transition(&mut inner, ServiceState::Stopping);

        if let Some(handle) = inner.subscription.take() {
            self.source.unsubscribe(handle);
        }
        let persisted = self.store.set(StateKey::ServiceRunning, false);

        self.transition(&mut inner, ServiceState::Stopped);
        metrics::counter!("tracker.lifecycle.stops").increment(1);

        persisted.map_err(Into::into)
    }

    /// Restart tracking after a boot if it was running when the process died
    pub fn recover(&self, signal: BootSignal) -> Result<ServiceState, LifecycleError> {
        if !self.was_running() {
            info!(signal = ?signal, "Service was not running before boot");
            return Ok(self.state());
        }

        info!(signal = ?signal, "Restoring tracking after boot");
        self.start()?;
        Ok(self.state())
    }

    /// Failed start: clear the running flag, then fall back to Stopped
    fn abort_start(&self, inner: &mut Inner) {
        if let Err(e) = self.store.set(StateKey::ServiceRunning, false) {
            warn!(error = %e, "Failed to clear running flag");
        }
        self.transition(inner, ServiceState::Stopped);
    }

    fn transition(&self, inner: &mut Inner, to: ServiceState) {
        let from = inner.state;
        inner.state = to;
        self.telemetry.state_changed(from, to);
    }
}
