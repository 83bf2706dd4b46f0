//! Location Tracker Service
//!
//! Background location tracking core. Raw position samples from a sample
//! source are filtered for accuracy, movement and freshness; accepted samples
//! are enriched with an address and a device status snapshot and written to a
//! single remote function. A small persisted state machine restores tracking
//! after an unexpected process death.
//!
//! ## Features
//!
//! - **Deterministic Filtering**: accuracy, displacement (haversine) and
//!   staleness checks in a fixed order with named presets
//! - **Ordered Enrichment**: one serial worker for session bootstrap, mapping
//!   and geocoding; remote writes overlap
//! - **Durable Lifecycle**: `service_running` survives restarts and drives
//!   boot recovery
//! - **Observable Outcomes**: structured logs, metrics counters and an event
//!   stream for presentation collaborators
//!
//! ## Architecture
//!
//! ```text
//! Sample Source              Enrichment Worker               Remote Sink
//! ┌──────────────┐          ┌──────────────────┐          ┌──────────────┐
//! │ Replay /     │          │ 1. session       │          │ onCallCreate │
//! │ platform     │          │ 2. map + geocode │─────────▶│ One          │
//! └──────────────┘          │    + device      │ spawned  └──────────────┘
//!        │                  └──────────────────┘
//!        ▼                           ▲
//! ┌──────────────┐   accepted        │
//! │ Filter       │───────────────────┘
//! │ Engine       │
//! └──────────────┘
//!        ▲ subscribe / unsubscribe
//! ┌──────────────┐          ┌──────────────┐
//! │ Lifecycle    │─────────▶│ State Store  │
//! │ State Machine│          │ (flags)      │
//! └──────────────┘          └──────────────┘
//! ```

pub mod config;
pub mod device;
pub mod filter;
pub mod geocode;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod session;
pub mod source;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use device::{DeviceStatusProvider, DeviceStatusSnapshot, PermissionChecker, StaticDeviceStatus};
pub use filter::{FilterConfig, FilterDecision, FilterEngine, PriorityHint, Rejection};
pub use geocode::{Address, GazetteerGeocoder, Geocoder};
pub use lifecycle::{BootSignal, LifecycleError, ServiceState, TrackerService};
pub use model::{AcceptedSample, LocationRecord, RawSample, RecordId, RecordPayload};
pub use pipeline::{EnrichmentPipeline, PendingRecord, PipelineError};
pub use remote::{JsonlSink, RemoteError, RemoteSink, RetryingSink};
pub use session::{LocalSessionProvider, Session, SessionProvider};
pub use source::{ReplaySampleSource, SampleConsumer, SampleSource, SubscriptionHandle, SubscriptionRequest};
pub use store::{FileStateStore, MemoryStateStore, StateKey, StateStore};
pub use telemetry::{Telemetry, TrackerEvent, TrackingStats};
