//! Wire and event types for the telemetry relay.
//!
//! Every WebSocket message in either direction is a [`Frame`]: an event name
//! plus positional arguments. Inbound frames are mapped to an [`EventKind`]
//! and validated into one of the typed payloads below before anything is
//! broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unit tag used when a position sample carries no id.
pub const NO_UNIT: &str = "none";

/// Outbound event carrying a validated pose.
pub const DEVICE_DATA: &str = "device-data";

/// Outbound event carrying the result of a forwarding attempt.
pub const COMPETITION_DATA_RESULT: &str = "competition-data-result";

/// A single message on the bidirectional channel.
///
/// ```json
/// {"event": "unit-update", "args": [{"ID": "u1", "...": "..."}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Frame {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Builds a frame with exactly one argument.
    pub fn single(event: impl Into<String>, arg: Value) -> Self {
        Self::new(event, vec![arg])
    }
}

/// Inbound event names the relay understands.
///
/// Unknown names map to `None` in [`EventKind::parse`] and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LogLatLong,
    LogLatLongJson,
    Start,
    Stop,
    Upload,
    UnitUpdate,
    Biometrics,
    BiometricsJson,
    TransmitCompData,
    SendCompetitionData,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        Self::LogLatLong,
        Self::LogLatLongJson,
        Self::Start,
        Self::Stop,
        Self::Upload,
        Self::UnitUpdate,
        Self::Biometrics,
        Self::BiometricsJson,
        Self::TransmitCompData,
        Self::SendCompetitionData,
    ];

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogLatLong => "log-lat-long",
            Self::LogLatLongJson => "log-lat-long-json",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Upload => "upload",
            Self::UnitUpdate => "unit-update",
            Self::Biometrics => "biometrics",
            Self::BiometricsJson => "biometrics-json",
            Self::TransmitCompData => "transmit-comp-data",
            Self::SendCompetitionData => "send-competition-data",
        }
    }
}

/// A validated position sample ready for the time-series store.
///
/// Coordinates are always finite; samples that are not never get built.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub unit_id: String,
    pub lat: f64,
    pub long: f64,
    pub alt: f64,
    /// Server capture time, not anything the client reported.
    pub observed_at: DateTime<Utc>,
}

/// A pose update that passed validation.
///
/// Holds the decoded object exactly as received so the broadcast carries the
/// same fields in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEvent(pub Value);

/// Biometric reading relayed to every client.
///
/// Fields are opaque; only the envelope shape is normalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BiometricEvent {
    pub id: Value,
    pub unit_name: Value,
    pub heart_rate: Value,
    #[serde(rename = "bloodO2")]
    pub blood_o2: Value,
    pub body_temp: Value,
}

/// Session correlation id for `start`/`stop`/`upload`.
///
/// Integer when the value parses as one, otherwise passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UnitId {
    Int(i64),
    Other(Value),
}

impl UnitId {
    #[must_use]
    pub fn normalize(raw: &Value) -> Self {
        match raw {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Other(raw.clone()),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => Self::Int(i),
                Err(_) => Self::Other(raw.clone()),
            },
            _ => Self::Other(raw.clone()),
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Int(i) => Value::from(i),
            Self::Other(v) => v,
        }
    }
}
