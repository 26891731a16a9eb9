//! Error types for the telemetry relay.
//!
//! # Error Types
//!
//! - [`Rejection`] - Why an inbound event was dropped by validation. Handled
//!   where it is detected; never sent back to a client.
//! - [`ServerError`] - Startup failures that prevent the server from running.
//!
//! Store write failures ([`SinkError`](crate::sink::SinkError)) and forwarding
//! failures ([`ForwardError`](crate::forwarding::ForwardError)) live next to
//! the components that produce them.

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::forwarding::ForwardError;
use crate::sink::SinkError;

/// Reason an inbound event was rejected.
///
/// Validation is short-circuiting, so a rejection always names the first
/// check that failed.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A string payload (or a whole frame) was not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Decode(String),

    /// A required field is absent, null or falsy.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A coordinate did not coerce to a finite number.
    #[error("field '{field}' is not a finite number: {value}")]
    InvalidNumber {
        /// The offending field.
        field: &'static str,
        /// The raw value as received.
        value: String,
    },

    /// A field is present but has the wrong shape.
    #[error("invalid value for '{field}': {reason}")]
    InvalidField {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl Rejection {
    /// Stable short code used in diagnostic logs.
    ///
    /// # Example
    ///
    /// ```rust
    /// use telemetry_relay_server::error::Rejection;
    ///
    /// assert_eq!(Rejection::MissingField("ID").code(), "missing-field");
    /// ```
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode-error",
            Self::MissingField(_) => "missing-field",
            Self::InvalidNumber { .. } => "invalid-number",
            Self::InvalidField { .. } => "invalid-field",
        }
    }

    pub(crate) fn invalid_number(field: &'static str, value: impl fmt::Display) -> Self {
        Self::InvalidNumber {
            field,
            value: value.to_string(),
        }
    }

    pub(crate) fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level startup error for the relay server.
///
/// Runtime failures are never fatal; only configuration and client
/// construction can stop the process.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// The time-series store client could not be created.
    Store(SinkError),

    /// The forwarding client could not be created.
    Forwarding(ForwardError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Store(err) => write!(f, "time-series store error: {err}"),
            Self::Forwarding(err) => write!(f, "forwarding client error: {err}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Forwarding(err) => Some(err),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<SinkError> for ServerError {
    fn from(err: SinkError) -> Self {
        Self::Store(err)
    }
}

impl From<ForwardError> for ServerError {
    fn from(err: ForwardError) -> Self {
        Self::Forwarding(err)
    }
}

/// A specialized Result type for server startup.
pub type Result<T> = std::result::Result<T, ServerError>;
