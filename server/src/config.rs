//! Server configuration module.
//!
//! Parses configuration from environment variables for the telemetry relay.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `INFLUXDB_TOKEN` | Yes | - | API token for the time-series store |
//! | `COMPETITION_ENDPOINT` | Yes | - | URL competition payloads are forwarded to |
//! | `CLIENT_CERT_BASE64` | Yes | - | Base64-encoded PEM client certificate |
//! | `CLIENT_KEY_BASE64` | Yes | - | Base64-encoded PEM client private key |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `LOGGING_ENABLED` | No | false | Enable diagnostic logging |
//! | `INFLUXDB_HOST` | No | InfluxDB Cloud us-east-1 | Base URL of the store |
//! | `INFLUXDB_DATABASE` | No | `drone-position-visualizer-server` | Database (bucket) name |
//! | `TRANSMIT_COMP_DATA` | No | false | Initial state of the forwarding flag |

use std::env;
use std::fmt;

use thiserror::Error;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default time-series store host.
const DEFAULT_INFLUXDB_HOST: &str = "https://us-east-1-1.aws.cloud2.influxdata.com";

/// Default time-series database name.
const DEFAULT_INFLUXDB_DATABASE: &str = "drone-position-visualizer-server";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// When true, validation rejections and per-event diagnostics are logged.
    pub logging_enabled: bool,

    /// Base URL of the time-series store.
    pub influxdb_host: String,

    /// API token for the time-series store.
    pub influxdb_token: String,

    /// Database that position samples are written to and read from.
    pub influxdb_database: String,

    /// URL that competition payloads are POSTed to.
    pub competition_endpoint: String,

    /// Base64-encoded PEM client certificate for the forwarding channel.
    pub client_cert_base64: String,

    /// Base64-encoded PEM private key for the forwarding channel.
    pub client_key_base64: String,

    /// Initial value of the competition forwarding flag.
    pub transmit_comp_data: bool,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required secret or endpoint is missing or empty
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use telemetry_relay_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;

        Ok(Self {
            port,
            logging_enabled: Self::logging_enabled_from_env(),
            influxdb_host: env::var("INFLUXDB_HOST")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_INFLUXDB_HOST.to_string()),
            influxdb_token: required_env("INFLUXDB_TOKEN")?,
            influxdb_database: env::var("INFLUXDB_DATABASE")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_INFLUXDB_DATABASE.to_string()),
            competition_endpoint: required_env("COMPETITION_ENDPOINT")?,
            client_cert_base64: required_env("CLIENT_CERT_BASE64")?,
            client_key_base64: required_env("CLIENT_KEY_BASE64")?,
            transmit_comp_data: parse_bool_env("TRANSMIT_COMP_DATA"),
        })
    }

    /// Reads only the `LOGGING_ENABLED` flag.
    ///
    /// Logging is initialized before the rest of the configuration is parsed,
    /// so the binary needs this value on its own.
    pub fn logging_enabled_from_env() -> bool {
        parse_bool_env("LOGGING_ENABLED")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("logging_enabled", &self.logging_enabled)
            .field("influxdb_host", &self.influxdb_host)
            .field("influxdb_token", &"<redacted>")
            .field("influxdb_database", &self.influxdb_database)
            .field("competition_endpoint", &self.competition_endpoint)
            .field("client_cert_base64", &"<redacted>")
            .field("client_key_base64", &"<redacted>")
            .field("transmit_comp_data", &self.transmit_comp_data)
            .finish()
    }
}

/// Read a required, non-empty environment variable.
fn required_env(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) | Err(env::VarError::NotPresent) => {
            Err(ConfigError::MissingEnvVar(name.to_string()))
        }
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set or blank.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) if port_str.trim().is_empty() => Ok(DEFAULT_PORT),
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
