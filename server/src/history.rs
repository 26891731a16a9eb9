//! Recent-position query service.
//!
//! Backs `GET /api/v1/lat-long-logs`: the last 24 hours of samples, oldest
//! first, at most [`MAX_ROWS`] rows, each as a `[timestamp, lat, long]`
//! triple. Missing coordinates become `""` so every row keeps its shape.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeTuple, Serializer};

use crate::sink::{PositionStore, SinkError, StoredPosition};

/// Trailing window covered by the query.
pub const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum number of rows returned.
pub const MAX_ROWS: usize = 100;

/// One row of the lat/long log.
#[derive(Debug, Clone, PartialEq)]
pub struct LatLongRow {
    pub time: DateTime<Utc>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

impl From<StoredPosition> for LatLongRow {
    fn from(position: StoredPosition) -> Self {
        Self {
            time: position.time,
            lat: position.lat,
            long: position.long,
        }
    }
}

impl Serialize for LatLongRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.time)?;
        tuple.serialize_element(&Coordinate(self.lat))?;
        tuple.serialize_element(&Coordinate(self.long))?;
        tuple.end()
    }
}

/// A coordinate that serializes as `""` when absent.
struct Coordinate(Option<f64>);

impl Serialize for Coordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(value) => serializer.serialize_f64(value),
            None => serializer.serialize_str(""),
        }
    }
}

/// Reads the recent position log from `store`.
///
/// Read-only. The store already orders and limits; the cap is re-applied
/// here so a misbehaving store cannot grow the response.
pub async fn recent_positions(store: &dyn PositionStore) -> Result<Vec<LatLongRow>, SinkError> {
    let rows = store.recent(WINDOW, MAX_ROWS).await?;
    Ok(rows.into_iter().take(MAX_ROWS).map(LatLongRow::from).collect())
}
