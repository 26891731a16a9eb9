//! InfluxDB client for position samples.
//!
//! Writes use the v2-compatible line protocol endpoint; reads use the
//! SQL query endpoint with JSON output. Both authenticate with the
//! configured API token.
//!
//! # Persisted layout
//!
//! One measurement, `latlong`, tagged by `unit`, with float fields `lat`,
//! `long` and `alt` and a server-assigned nanosecond timestamp:
//!
//! ```text
//! latlong,unit=drone-7 lat=91.5,long=-10.2,alt=3 1718000000000000000
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::sink::{PositionStore, SinkError, StoredPosition};
use crate::types::PositionSample;

/// Measurement that position samples are written to.
pub const MEASUREMENT: &str = "latlong";

/// Timeout for store requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct SqlQuery<'a> {
    db: &'a str,
    q: String,
    format: &'static str,
}

/// Client for the InfluxDB HTTP API.
///
/// Cheap to clone; the underlying `reqwest::Client` pools connections.
#[derive(Clone)]
pub struct InfluxClient {
    http_client: Client,
    base_url: String,
    token: String,
    database: String,
}

impl InfluxClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<Self, SinkError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            token: token.into(),
            database: database.into(),
        })
    }

    /// Returns the base URL of the store.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the database samples are written to.
    pub fn database(&self) -> &str {
        &self.database
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }
}

impl std::fmt::Debug for InfluxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxClient")
            .field("base_url", &self.base_url)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PositionStore for InfluxClient {
    async fn write(&self, sample: &PositionSample) -> Result<(), SinkError> {
        let url = format!("{}/api/v2/write", self.base_url);
        let line = line_protocol(sample);

        debug!(url = %url, unit = %sample.unit_id, "Writing position sample");

        let response = self
            .http_client
            .post(&url)
            .query(&[("bucket", self.database.as_str()), ("precision", "ns")])
            .header("Authorization", self.auth_header())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Store rejected position write");
            return Err(SinkError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn recent(
        &self,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<StoredPosition>, SinkError> {
        let url = format!("{}/api/v3/query_sql", self.base_url);
        let query = SqlQuery {
            db: &self.database,
            q: recent_positions_sql(window, limit),
            format: "json",
        };

        debug!(url = %url, sql = %query.q, "Querying recent positions");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&query)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();

            // A measurement that has never been written does not exist yet.
            if status == reqwest::StatusCode::NOT_FOUND && is_missing_measurement(&body) {
                debug!("Position measurement not found, returning no rows");
                return Ok(Vec::new());
            }

            error!(status = %status, body = %body, "Recent position query failed");
            return Err(SinkError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SinkError::InvalidResponse(format!("failed to read body: {e}")))?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Value> = serde_json::from_str(&body)
            .map_err(|e| SinkError::InvalidResponse(format!("failed to parse rows: {e}")))?;

        let positions: Vec<StoredPosition> = rows.iter().filter_map(parse_row).collect();
        debug!(
            rows = rows.len(),
            kept = positions.len(),
            "Fetched recent positions"
        );

        Ok(positions)
    }
}

fn request_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Unavailable(format!("request timed out after {REQUEST_TIMEOUT:?}"))
    } else if e.is_connect() {
        SinkError::Unavailable(format!("connection failed: {e}"))
    } else {
        SinkError::Unavailable(format!("request failed: {e}"))
    }
}

/// Whether a 404 body reports the position table as missing, as opposed to
/// an unknown route or database.
fn is_missing_measurement(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("not found") && (body.contains("table") || body.contains(MEASUREMENT))
}

/// SQL for the trailing-window read, oldest first.
fn recent_positions_sql(window: Duration, limit: usize) -> String {
    format!(
        "SELECT * FROM '{MEASUREMENT}' WHERE time >= now() - interval '{} seconds' \
         ORDER BY time ASC LIMIT {limit}",
        window.as_secs()
    )
}

/// Encodes one sample as a line protocol record.
fn line_protocol(sample: &PositionSample) -> String {
    format!(
        "{MEASUREMENT},unit={} lat={},long={},alt={} {}",
        escape_tag(&sample.unit_id),
        sample.lat,
        sample.long,
        sample.alt,
        sample.observed_at.timestamp_nanos_opt().unwrap_or_default()
    )
}

/// Escapes a tag value for line protocol.
fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' | '=' | ' ' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' | '\r' => escaped.push(' '),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn parse_row(row: &Value) -> Option<StoredPosition> {
    let time = match row.get("time") {
        Some(raw) => parse_time(raw),
        None => None,
    };

    let Some(time) = time else {
        warn!(row = %row, "Skipping position row without a readable timestamp");
        return None;
    };

    Some(StoredPosition {
        time,
        lat: row.get("lat").and_then(Value::as_f64),
        long: row.get("long").and_then(Value::as_f64),
    })
}

/// Reads a row timestamp, which may be RFC 3339, a naive UTC datetime, or
/// epoch nanoseconds.
fn parse_time(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n.as_i64().map(DateTime::from_timestamp_nanos),
        _ => None,
    }
}
