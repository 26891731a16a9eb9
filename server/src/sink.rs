//! Position persistence.
//!
//! [`PositionStore`] is the seam to the time-series store; the production
//! implementation is [`InfluxClient`](crate::influx::InfluxClient).
//! [`PositionSink`] sits in front of it and turns every accepted sample into
//! exactly one background write: no retry, no batching, and failures are
//! logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::PositionSample;

/// Errors returned by a [`PositionStore`].
#[derive(Debug, Error)]
pub enum SinkError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The store answered with something that could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The store client could not be configured.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// A position row read back from the store.
///
/// Coordinates are optional because older or partial rows may lack them.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPosition {
    pub time: DateTime<Utc>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

/// Append-only time-series store for position samples.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persists one sample as one record.
    async fn write(&self, sample: &PositionSample) -> Result<(), SinkError>;

    /// Returns up to `limit` samples from the trailing `window`, oldest first.
    async fn recent(
        &self,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<StoredPosition>, SinkError>;
}

/// Fire-and-forget writer in front of a [`PositionStore`].
#[derive(Clone)]
pub struct PositionSink {
    store: Arc<dyn PositionStore>,
}

impl PositionSink {
    pub fn new(store: Arc<dyn PositionStore>) -> Self {
        Self { store }
    }

    /// Dispatches a background write for `sample`.
    ///
    /// The caller never observes the outcome; the handle is returned only so
    /// shutdown paths and tests can wait for it.
    pub fn record(&self, sample: PositionSample) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.write(&sample).await {
                Ok(()) => debug!(
                    unit = %sample.unit_id,
                    lat = sample.lat,
                    long = sample.long,
                    alt = sample.alt,
                    "Wrote position sample"
                ),
                Err(err) => warn!(
                    unit = %sample.unit_id,
                    lat = sample.lat,
                    long = sample.long,
                    alt = sample.alt,
                    error = %err,
                    "Unable to write position sample"
                ),
            }
        })
    }

    /// The store this sink writes to, for read paths that share it.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }
}

impl std::fmt::Debug for PositionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionSink").finish_non_exhaustive()
    }
}
