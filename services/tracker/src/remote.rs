//! Remote write endpoint for enriched records.
//!
//! The transport is opaque to the pipeline: a sink receives a named function
//! and a payload and answers with the identifier of the stored record.

use crate::config::RetryConfig;
use crate::model::{RecordId, RecordPayload};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Errors from a remote write
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Network or I/O failure; the same call may succeed later
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The remote function refused the payload
    #[error("Remote function {function} rejected the call: {message}")]
    Application { function: String, message: String },

    #[error("Remote function returned no record id")]
    EmptyResponse,
}

impl RemoteError {
    /// Whether retrying the identical call can help
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}

/// A single named remote write call
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn invoke(&self, function: &str, payload: &RecordPayload) -> Result<RecordId, RemoteError>;
}

/// Retries transient failures of the wrapped sink with exponential backoff.
///
/// Application errors are returned at once.
pub struct RetryingSink<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: RemoteSink> RetryingSink<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff(),
            max_interval: self.config.max_backoff(),
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

#[async_trait]
impl<S: RemoteSink> RemoteSink for RetryingSink<S> {
    #[instrument(skip(self, payload))]
    async fn invoke(&self, function: &str, payload: &RecordPayload) -> Result<RecordId, RemoteError> {
        let mut backoff = self.backoff();
        let mut attempts = 0u32;

        loop {
            match self.inner.invoke(function, payload).await {
                Ok(id) => {
                    if attempts > 0 {
                        debug!(attempts = attempts, record_id = %id, "Remote write succeeded after retry");
                    }
                    return Ok(id);
                }
                Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                    attempts += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.max_backoff());
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Remote write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    record_id: &'a RecordId,
    function: &'a str,
    payload: &'a RecordPayload,
}

/// Sink appending every call as one JSON line to a local journal file
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<tokio::fs::File, RemoteError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RemoteError::Transport(e.to_string()))?;
            }
        }

        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }
}

#[async_trait]
impl RemoteSink for JsonlSink {
    async fn invoke(&self, function: &str, payload: &RecordPayload) -> Result<RecordId, RemoteError> {
        let record_id = RecordId::new(Uuid::new_v4().to_string());
        let entry = JournalEntry {
            record_id: &record_id,
            function,
            payload,
        };

        let mut line = serde_json::to_vec(&entry).map_err(|e| RemoteError::Application {
            function: function.to_string(),
            message: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(RemoteError::Transport("journal file unavailable".to_string()));
        };

        if let Err(e) = file.write_all(&line).await {
            // Reopen on the next call
            *guard = None;
            return Err(RemoteError::Transport(e.to_string()));
        }
        file.flush()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(record_id)
    }
}
