//! Competition forwarding gate.
//!
//! Competition payloads are opaque JSON objects POSTed verbatim to an
//! external ingestion endpoint over mutually authenticated TLS. Whether
//! channel-triggered payloads are sent is decided by the process-wide
//! [`ForwardingFlag`], which starts from configuration and is flipped by the
//! `transmit-comp-data` event.
//!
//! # State machine
//!
//! ```text
//!            transmit-comp-data(true)
//!   Disabled ------------------------> Enabled
//!            <------------------------
//!            transmit-comp-data(false)
//! ```
//!
//! There is no terminal state. The HTTP endpoint forwards through
//! [`ForwardingGate::forward_ungated`] and never consults the flag.
//!
//! The outbound call has no timeout, retry or circuit breaker: a failure is
//! reported once through [`ForwardOutcome`] and nothing else happens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Identity};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{Frame, COMPETITION_DATA_RESULT};

/// Result body broadcast when no upstream body is available.
pub const NO_RESULT: &str = "none";

/// Errors from a forwarding attempt or from building the forwarder.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The client certificate or key could not be decoded.
    #[error("invalid client identity: {0}")]
    Identity(String),

    /// The HTTP client could not be configured.
    #[error("client configuration error: {0}")]
    Configuration(String),

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Request(String),

    /// The endpoint answered with a non-success status.
    #[error("upstream returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
}

/// Shared on/off switch for channel-triggered forwarding.
///
/// Clones share the same flag. Reads and writes are atomic.
#[derive(Debug, Clone)]
pub struct ForwardingFlag(Arc<AtomicBool>);

impl ForwardingFlag {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sets the flag and returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::SeqCst)
    }
}

/// PEM client certificate and key, decoded once at startup.
#[derive(Clone)]
pub struct ClientIdentity {
    pem: Vec<u8>,
}

impl ClientIdentity {
    /// Decodes base64-wrapped PEM material and checks that it forms a usable
    /// identity.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Identity`] if either value is not valid base64
    /// or the PEM does not contain a certificate and private key.
    pub fn from_base64(cert_base64: &str, key_base64: &str) -> Result<Self, ForwardError> {
        let mut pem = STANDARD
            .decode(cert_base64.trim())
            .map_err(|e| ForwardError::Identity(format!("certificate is not base64: {e}")))?;
        let key = STANDARD
            .decode(key_base64.trim())
            .map_err(|e| ForwardError::Identity(format!("private key is not base64: {e}")))?;

        pem.push(b'\n');
        pem.extend_from_slice(&key);

        let identity = Self { pem };
        identity.to_reqwest()?;
        Ok(identity)
    }

    fn to_reqwest(&self) -> Result<Identity, ForwardError> {
        Identity::from_pem(&self.pem).map_err(|e| ForwardError::Identity(e.to_string()))
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientIdentity(<redacted>)")
    }
}

/// Status and body of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

impl UpstreamResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Destination for competition payloads.
#[async_trait]
pub trait CompetitionSink: Send + Sync {
    /// Sends one payload. Any HTTP response, success or not, is `Ok`.
    async fn send(&self, payload: &Value) -> Result<UpstreamResponse, ForwardError>;
}

/// HTTPS forwarder presenting a client certificate.
#[derive(Debug, Clone)]
pub struct CompetitionForwarder {
    http_client: Client,
    endpoint: String,
}

impl CompetitionForwarder {
    /// Creates a forwarder for `endpoint`.
    ///
    /// `identity` is required in production; it is optional so the
    /// forwarder can be pointed at a plain HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError`] if the identity or HTTP client is unusable.
    pub fn new(
        endpoint: impl Into<String>,
        identity: Option<&ClientIdentity>,
    ) -> Result<Self, ForwardError> {
        let mut builder = Client::builder().use_rustls_tls();
        if let Some(identity) = identity {
            builder = builder.identity(identity.to_reqwest()?);
        }

        let http_client = builder.build().map_err(|e| {
            ForwardError::Configuration(format!("failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl CompetitionSink for CompetitionForwarder {
    async fn send(&self, payload: &Value) -> Result<UpstreamResponse, ForwardError> {
        debug!(endpoint = %self.endpoint, "Forwarding competition payload");

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ForwardError::Request(format!("failed to read response body: {e}")))?;

        Ok(UpstreamResponse { status, body })
    }
}

/// What happened to one forwarding attempt.
#[derive(Debug)]
pub enum ForwardOutcome {
    /// The flag was off; nothing was sent.
    Disabled,

    /// The endpoint accepted the payload.
    Delivered(UpstreamResponse),

    /// The call failed or the endpoint answered with a non-success status.
    Failed(ForwardError),
}

impl ForwardOutcome {
    /// Short label broadcast alongside the result.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Delivered(_) => "sent",
            Self::Failed(_) => "failed",
        }
    }

    /// Upstream status code, if a response was received.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Delivered(response) => Some(response.status),
            Self::Failed(ForwardError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Upstream body, if a non-empty one was received.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        let body = match self {
            Self::Delivered(response) => response.body.as_str(),
            Self::Failed(ForwardError::Status { body, .. }) => body.as_str(),
            _ => return None,
        };
        (!body.is_empty()).then_some(body)
    }

    /// The `competition-data-result` notification for this outcome.
    #[must_use]
    pub fn result_frame(&self) -> Frame {
        Frame::new(
            COMPETITION_DATA_RESULT,
            vec![
                Value::from(self.body().unwrap_or(NO_RESULT)),
                Value::from(self.label()),
            ],
        )
    }
}

/// The flag plus the sink it guards.
#[derive(Clone)]
pub struct ForwardingGate {
    flag: ForwardingFlag,
    sink: Arc<dyn CompetitionSink>,
}

impl ForwardingGate {
    pub fn new(flag: ForwardingFlag, sink: Arc<dyn CompetitionSink>) -> Self {
        Self { flag, sink }
    }

    #[must_use]
    pub fn flag(&self) -> &ForwardingFlag {
        &self.flag
    }

    /// Forwards `payload` if the flag is enabled.
    pub async fn forward(&self, payload: &Value) -> ForwardOutcome {
        if !self.flag.is_enabled() {
            debug!("Competition forwarding disabled, payload not sent");
            return ForwardOutcome::Disabled;
        }
        self.forward_ungated(payload).await
    }

    /// Forwards `payload` regardless of the flag.
    pub async fn forward_ungated(&self, payload: &Value) -> ForwardOutcome {
        match self.sink.send(payload).await {
            Ok(response) if response.is_success() => {
                info!(status = response.status, "Competition payload forwarded");
                ForwardOutcome::Delivered(response)
            }
            Ok(UpstreamResponse { status, body }) => {
                warn!(status, "Competition endpoint rejected payload");
                ForwardOutcome::Failed(ForwardError::Status { status, body })
            }
            Err(err) => {
                warn!(error = %err, "Competition forwarding failed");
                ForwardOutcome::Failed(err)
            }
        }
    }
}

impl std::fmt::Debug for ForwardingGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingGate")
            .field("enabled", &self.flag.is_enabled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gate_for(mock_server: &MockServer, enabled: bool) -> ForwardingGate {
        let forwarder =
            CompetitionForwarder::new(format!("{}/ingest", mock_server.uri()), None).unwrap();
        ForwardingGate::new(ForwardingFlag::new(enabled), Arc::new(forwarder))
    }

    // ==================== flag ====================

    #[test]
    fn flag_clones_share_state() {
        let flag = ForwardingFlag::new(false);
        let clone = flag.clone();

        assert!(!clone.set(true));
        assert!(flag.is_enabled());
        assert!(flag.set(false));
        assert!(!clone.is_enabled());
    }

    // ==================== identity ====================

    #[test]
    fn identity_rejects_invalid_base64() {
        let err = ClientIdentity::from_base64("***", "a2V5").unwrap_err();
        assert!(matches!(err, ForwardError::Identity(ref m) if m.contains("certificate")));

        let err = ClientIdentity::from_base64("Y2VydA==", "***").unwrap_err();
        assert!(matches!(err, ForwardError::Identity(ref m) if m.contains("private key")));
    }

    #[test]
    fn identity_rejects_non_pem_material() {
        let cert = STANDARD.encode("not a certificate");
        let key = STANDARD.encode("not a key");
        assert!(matches!(
            ClientIdentity::from_base64(&cert, &key),
            Err(ForwardError::Identity(_))
        ));
    }

    // ==================== gate ====================

    #[tokio::test]
    async fn enabled_gate_sends_payload_verbatim() {
        let mock_server = MockServer::start().await;
        let payload = json!({"team": "blue", "score": [1, 2, 3]});

        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(body_json(payload.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = gate_for(&mock_server, true).forward(&payload).await;

        assert!(matches!(outcome, ForwardOutcome::Delivered(ref r) if r.status == 200));
        assert_eq!(outcome.body(), Some("accepted"));
        assert_eq!(
            outcome.result_frame(),
            Frame::new(COMPETITION_DATA_RESULT, vec![json!("accepted"), json!("sent")])
        );
    }

    #[tokio::test]
    async fn disabled_gate_makes_no_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let outcome = gate_for(&mock_server, false).forward(&json!({"a": 1})).await;

        assert!(matches!(outcome, ForwardOutcome::Disabled));
        assert_eq!(outcome.status(), None);
        assert_eq!(
            outcome.result_frame(),
            Frame::new(COMPETITION_DATA_RESULT, vec![json!("none"), json!("disabled")])
        );
    }

    #[tokio::test]
    async fn ungated_forward_ignores_flag() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = gate_for(&mock_server, false)
            .forward_ungated(&json!({"a": 1}))
            .await;

        assert_eq!(outcome.status(), Some(201));
        assert_eq!(outcome.label(), "sent");
    }

    #[tokio::test]
    async fn toggling_flag_changes_gate_behaviour() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let gate = gate_for(&mock_server, false);
        assert!(matches!(
            gate.forward(&json!({})).await,
            ForwardOutcome::Disabled
        ));

        gate.flag().set(true);
        assert!(matches!(
            gate.forward(&json!({})).await,
            ForwardOutcome::Delivered(_)
        ));
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure_with_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad schema"))
            .mount(&mock_server)
            .await;

        let outcome = gate_for(&mock_server, true).forward(&json!({})).await;

        assert!(matches!(
            outcome,
            ForwardOutcome::Failed(ForwardError::Status { status: 422, .. })
        ));
        assert_eq!(outcome.status(), Some(422));
        assert_eq!(outcome.body(), Some("bad schema"));
        assert_eq!(outcome.label(), "failed");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_failure() {
        let forwarder = CompetitionForwarder::new("http://127.0.0.1:1/ingest", None).unwrap();
        let gate = ForwardingGate::new(ForwardingFlag::new(true), Arc::new(forwarder));

        let outcome = gate.forward(&json!({})).await;

        assert!(matches!(outcome, ForwardOutcome::Failed(ForwardError::Request(_))));
        assert_eq!(outcome.status(), None);
        assert_eq!(
            outcome.result_frame().args,
            vec![json!("none"), json!("failed")]
        );
    }

    #[tokio::test]
    async fn empty_upstream_body_reports_none() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let outcome = gate_for(&mock_server, true).forward(&json!({})).await;
        assert_eq!(outcome.body(), None);
        assert_eq!(outcome.result_frame().args[0], json!("none"));
    }
}
