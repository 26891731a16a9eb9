//! Payload validation for inbound events.
//!
//! Every check here is pure: it takes the raw JSON arguments of a frame and
//! returns either the typed payload or the first [`Rejection`] encountered.
//! Checks run in a fixed order and stop at the first failure.
//!
//! Payloads that arrive as a JSON-encoded string are decoded first, so the
//! single-string aliases (`log-lat-long-json`, `biometrics-json`, string
//! `unit-update`) share one code path with the structured forms.

use chrono::Utc;
use serde_json::Value;

use crate::error::Rejection;
use crate::types::{BiometricEvent, PoseEvent, PositionSample, UnitId, NO_UNIT};

const POSITION_AXES: [(&str, &str); 3] = [
    ("x", "Position.x"),
    ("y", "Position.y"),
    ("z", "Position.z"),
];

const ORIENTATION_AXES: [(&str, &str); 4] = [
    ("x", "Orientation.x"),
    ("y", "Orientation.y"),
    ("z", "Orientation.z"),
    ("w", "Orientation.w"),
];

/// Decodes a payload that may have been sent as a JSON string.
///
/// Non-string values are returned unchanged.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use telemetry_relay_server::validate::decode_payload;
///
/// let decoded = decode_payload(&json!(r#"{"lat": 1}"#)).unwrap();
/// assert_eq!(decoded, json!({"lat": 1}));
/// assert!(decode_payload(&json!("{not json")).is_err());
/// ```
pub fn decode_payload(raw: &Value) -> Result<Value, Rejection> {
    match raw {
        Value::String(text) => {
            serde_json::from_str(text).map_err(|e| Rejection::Decode(e.to_string()))
        }
        other => Ok(other.clone()),
    }
}

/// Loose truthiness: null, `false`, zero and the empty string are falsy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Validates a `unit-update` payload.
///
/// Order: payload, `ID`, `Position`, `Position.{x,y,z}`, `Orientation`,
/// `Orientation.{x,y,z,w}`, `Confidence`. Nested coordinates only need to be
/// present; `ID` and `Confidence` must be truthy.
pub fn validate_pose(raw: Option<&Value>) -> Result<PoseEvent, Rejection> {
    let payload = decode_payload(raw.ok_or(Rejection::MissingField("payload"))?)?;
    if !is_truthy(&payload) {
        return Err(Rejection::MissingField("payload"));
    }

    require_truthy(&payload, "ID")?;

    let position = require_truthy(&payload, "Position")?;
    for (axis, label) in POSITION_AXES {
        if position.get(axis).is_none() {
            return Err(Rejection::MissingField(label));
        }
    }

    let orientation = require_truthy(&payload, "Orientation")?;
    for (axis, label) in ORIENTATION_AXES {
        if orientation.get(axis).is_none() {
            return Err(Rejection::MissingField(label));
        }
    }

    require_truthy(&payload, "Confidence")?;

    Ok(PoseEvent(payload))
}

fn require_truthy<'a>(payload: &'a Value, key: &'static str) -> Result<&'a Value, Rejection> {
    payload
        .get(key)
        .filter(|v| is_truthy(v))
        .ok_or(Rejection::MissingField(key))
}

/// Validates the positional `log-lat-long(lat, long, alt, id?)` form.
pub fn validate_position_args(args: &[Value]) -> Result<PositionSample, Rejection> {
    build_sample(args.first(), args.get(1), args.get(2), args.get(3))
}

/// Validates the `log-lat-long-json({lat, long, alt, id})` form.
pub fn validate_position_json(raw: Option<&Value>) -> Result<PositionSample, Rejection> {
    let payload = decode_payload(raw.ok_or(Rejection::MissingField("payload"))?)?;
    if !payload.is_object() {
        return Err(Rejection::invalid_field("payload", "expected a JSON object"));
    }
    build_sample(
        payload.get("lat"),
        payload.get("long"),
        payload.get("alt"),
        payload.get("id"),
    )
}

fn build_sample(
    lat: Option<&Value>,
    long: Option<&Value>,
    alt: Option<&Value>,
    id: Option<&Value>,
) -> Result<PositionSample, Rejection> {
    Ok(PositionSample {
        lat: coerce_number("lat", lat)?,
        long: coerce_number("long", long)?,
        alt: coerce_number("alt", alt)?,
        unit_id: unit_tag(id),
        observed_at: Utc::now(),
    })
}

/// Coerces a coordinate to a finite `f64`.
///
/// Numbers are used as-is; strings go through [`parse_float_prefix`].
/// Anything that is not finite afterwards is rejected with the field name.
pub fn coerce_number(field: &'static str, raw: Option<&Value>) -> Result<f64, Rejection> {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_float_prefix(s),
        _ => None,
    };

    match parsed {
        Some(value) if value.is_finite() => Ok(value),
        _ => Err(Rejection::invalid_number(
            field,
            raw.map_or_else(|| "undefined".to_string(), Value::to_string),
        )),
    }
}

/// Parses the longest leading decimal number in `input`.
///
/// Leading whitespace is skipped and trailing garbage ignored, so
/// `"12.5abc"` yields `12.5`. Returns `None` when no digits lead the string.
///
/// ```rust
/// use telemetry_relay_server::validate::parse_float_prefix;
///
/// assert_eq!(parse_float_prefix(" -3.25e2m"), Some(-325.0));
/// assert_eq!(parse_float_prefix(".5"), Some(0.5));
/// assert_eq!(parse_float_prefix("abc"), None);
/// ```
#[must_use]
pub fn parse_float_prefix(input: &str) -> Option<f64> {
    let s = input.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }

    let int_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut digits = end - int_start;

    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }

    if digits == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse().ok()
}

/// Tag stored alongside a position sample.
///
/// Falsy or absent ids become [`NO_UNIT`].
#[must_use]
pub fn unit_tag(id: Option<&Value>) -> String {
    match id {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(value) if is_truthy(value) => value.to_string(),
        _ => NO_UNIT.to_string(),
    }
}

/// Normalizes the id argument of `start`/`stop`/`upload` in place.
///
/// `id_index` is the position of the id within the arguments. Everything
/// else is relayed verbatim.
#[must_use]
pub fn normalize_session_args(mut args: Vec<Value>, id_index: usize) -> Vec<Value> {
    if let Some(id) = args.get_mut(id_index) {
        *id = UnitId::normalize(id).into_value();
    }
    args
}

/// Normalizes any accepted `biometrics` form.
///
/// A single string or object argument is treated as the JSON form;
/// otherwise arguments are read positionally as
/// `(id, unitName, heartRate, bloodO2, bodyTemp)`.
pub fn normalize_biometrics(args: &[Value]) -> Result<BiometricEvent, Rejection> {
    match args {
        [] => Err(Rejection::MissingField("payload")),
        [single @ (Value::String(_) | Value::Object(_))] => biometrics_from_json(Some(single)),
        positional => {
            let field = |i: usize| positional.get(i).cloned().unwrap_or(Value::Null);
            Ok(BiometricEvent {
                id: field(0),
                unit_name: field(1),
                heart_rate: field(2),
                blood_o2: field(3),
                body_temp: field(4),
            })
        }
    }
}

/// Decodes the `biometrics-json` form.
pub fn biometrics_from_json(raw: Option<&Value>) -> Result<BiometricEvent, Rejection> {
    let payload = decode_payload(raw.ok_or(Rejection::MissingField("payload"))?)?;
    if !payload.is_object() {
        return Err(Rejection::invalid_field("payload", "expected a JSON object"));
    }
    serde_json::from_value(payload).map_err(|e| Rejection::Decode(e.to_string()))
}

/// Reads the optional argument of `transmit-comp-data`.
///
/// `None` means "report the current value"; a boolean is a write.
pub fn parse_toggle(raw: Option<&Value>) -> Result<Option<bool>, Rejection> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(enabled)) => Ok(Some(*enabled)),
        Some(other) => Err(Rejection::invalid_field(
            "enabled",
            format!("expected a boolean, got {other}"),
        )),
    }
}

/// Extracts the opaque competition payload, decoding the string form.
pub fn competition_payload(raw: Option<&Value>) -> Result<Value, Rejection> {
    match raw {
        None | Some(Value::Null) => Err(Rejection::MissingField("payload")),
        Some(value) => decode_payload(value),
    }
}
