//! Relay engine.
//!
//! Maps each inbound [`Frame`] to its [`EventKind`], validates it, and then
//! either broadcasts the normalized payload to every registered connection
//! (the sender included) or hands it to a side pipeline:
//!
//! | event | result |
//! |---|---|
//! | `log-lat-long`, `log-lat-long-json` | background store write, no broadcast |
//! | `start`, `stop`, `upload` | rebroadcast with the id normalized |
//! | `unit-update` | `device-data` broadcast of the validated pose |
//! | `biometrics`, `biometrics-json` | `biometrics` broadcast |
//! | `transmit-comp-data` | flag write, broadcast of the current value |
//! | `send-competition-data` | background forward, then `competition-data-result` |
//!
//! Rejected and unknown events produce no side effects. Rejections are logged
//! at `info` and never reported to the sender.

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Rejection;
use crate::forwarding::{ForwardOutcome, ForwardingGate};
use crate::registry::ConnectionRegistry;
use crate::sink::PositionSink;
use crate::types::{EventKind, Frame, DEVICE_DATA};
use crate::validate::{
    biometrics_from_json, competition_payload, normalize_biometrics, normalize_session_args,
    parse_toggle, validate_pose, validate_position_args, validate_position_json,
};

/// Position of the id argument in `start(lat, lng, alt, id, scenario)`.
const START_ID_INDEX: usize = 3;

/// What the relay did with one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Broadcast to this many connections.
    Broadcast(usize),
    /// Handed to the position sink.
    Persisted,
    /// Handed to the forwarding gate in the background.
    Forwarding,
    /// Unknown event name.
    Ignored,
    /// Dropped by validation.
    Rejected(Rejection),
}

/// The event-processing core shared by every connection.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: ConnectionRegistry,
    sink: PositionSink,
    gate: ForwardingGate,
}

impl Relay {
    pub fn new(registry: ConnectionRegistry, sink: PositionSink, gate: ForwardingGate) -> Self {
        Self {
            registry,
            sink,
            gate,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn gate(&self) -> &ForwardingGate {
        &self.gate
    }

    /// Handles one raw text message from a connection.
    pub fn handle_text(&self, connection_id: Uuid, text: &str) -> Handled {
        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => self.handle_frame(connection_id, frame),
            Err(err) => {
                let rejection = Rejection::Decode(err.to_string());
                debug!(
                    connection_id = %connection_id,
                    error = %rejection,
                    "Dropping undecodable frame"
                );
                Handled::Rejected(rejection)
            }
        }
    }

    /// Handles one decoded frame from a connection.
    pub fn handle_frame(&self, connection_id: Uuid, frame: Frame) -> Handled {
        let Some(kind) = EventKind::parse(&frame.event) else {
            debug!(connection_id = %connection_id, event = %frame.event, "Ignoring unknown event");
            return Handled::Ignored;
        };

        match self.dispatch(kind, frame.args) {
            Ok(handled) => handled,
            Err(rejection) => {
                info!(
                    connection_id = %connection_id,
                    event = kind.as_str(),
                    code = rejection.code(),
                    reason = %rejection,
                    "Rejected inbound event"
                );
                Handled::Rejected(rejection)
            }
        }
    }

    fn dispatch(&self, kind: EventKind, args: Vec<Value>) -> Result<Handled, Rejection> {
        match kind {
            EventKind::LogLatLong => {
                self.sink.record(validate_position_args(&args)?);
                Ok(Handled::Persisted)
            }
            EventKind::LogLatLongJson => {
                self.sink.record(validate_position_json(args.first())?);
                Ok(Handled::Persisted)
            }
            EventKind::Start => Ok(self.broadcast(Frame::new(
                kind.as_str(),
                normalize_session_args(args, START_ID_INDEX),
            ))),
            EventKind::Stop | EventKind::Upload => Ok(self.broadcast(Frame::new(
                kind.as_str(),
                normalize_session_args(args, 0),
            ))),
            EventKind::UnitUpdate => {
                let pose = validate_pose(args.first())?;
                Ok(self.broadcast(Frame::single(DEVICE_DATA, pose.0)))
            }
            EventKind::Biometrics | EventKind::BiometricsJson => {
                let event = if kind == EventKind::Biometrics {
                    normalize_biometrics(&args)?
                } else {
                    biometrics_from_json(args.first())?
                };
                let payload =
                    serde_json::to_value(event).map_err(|e| Rejection::Decode(e.to_string()))?;
                Ok(self.broadcast(Frame::single(EventKind::Biometrics.as_str(), payload)))
            }
            EventKind::TransmitCompData => {
                let flag = self.gate.flag();
                let enabled = match parse_toggle(args.first())? {
                    Some(enabled) => {
                        let previous = flag.set(enabled);
                        info!(previous, enabled, "Competition forwarding toggled");
                        enabled
                    }
                    None => flag.is_enabled(),
                };
                Ok(self.broadcast(Frame::single(kind.as_str(), Value::Bool(enabled))))
            }
            EventKind::SendCompetitionData => {
                self.spawn_forward(competition_payload(args.first())?);
                Ok(Handled::Forwarding)
            }
        }
    }

    fn broadcast(&self, frame: Frame) -> Handled {
        Handled::Broadcast(self.registry.broadcast(frame))
    }

    /// Forwards a channel-triggered payload in the background, honoring the
    /// flag, and announces the outcome.
    pub fn spawn_forward(&self, payload: Value) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let outcome = relay.gate.forward(&payload).await;
            relay.announce(&outcome);
        })
    }

    /// Forwards an HTTP-triggered payload without consulting the flag and
    /// announces the outcome.
    pub async fn forward_ungated(&self, payload: &Value) -> ForwardOutcome {
        let outcome = self.gate.forward_ungated(payload).await;
        self.announce(&outcome);
        outcome
    }

    fn announce(&self, outcome: &ForwardOutcome) {
        let delivered = self.registry.broadcast(outcome.result_frame());
        debug!(outcome = outcome.label(), delivered, "Announced forwarding result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{
        CompetitionSink, ForwardError, ForwardingFlag, UpstreamResponse,
    };
    use crate::registry::Connection;
    use crate::sink::{PositionStore, SinkError, StoredPosition};
    use crate::types::{PositionSample, COMPETITION_DATA_RESULT};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ChannelStore(mpsc::UnboundedSender<PositionSample>);

    #[async_trait]
    impl PositionStore for ChannelStore {
        async fn write(&self, sample: &PositionSample) -> Result<(), SinkError> {
            let _ = self.0.send(sample.clone());
            Ok(())
        }

        async fn recent(
            &self,
            _window: Duration,
            _limit: usize,
        ) -> Result<Vec<StoredPosition>, SinkError> {
            Ok(Vec::new())
        }
    }

    struct FakeEndpoint {
        sent: mpsc::UnboundedSender<Value>,
        status: Option<u16>,
    }

    #[async_trait]
    impl CompetitionSink for FakeEndpoint {
        async fn send(&self, payload: &Value) -> Result<UpstreamResponse, ForwardError> {
            let _ = self.sent.send(payload.clone());
            match self.status {
                Some(status) => Ok(UpstreamResponse {
                    status,
                    body: format!("status {status}"),
                }),
                None => Err(ForwardError::Request("connection refused".into())),
            }
        }
    }

    struct Harness {
        relay: Relay,
        samples: mpsc::UnboundedReceiver<PositionSample>,
        forwarded: mpsc::UnboundedReceiver<Value>,
    }

    fn harness(enabled: bool, status: Option<u16>) -> Harness {
        let (sample_tx, samples) = mpsc::unbounded_channel();
        let (sent, forwarded) = mpsc::unbounded_channel();
        let gate = ForwardingGate::new(
            ForwardingFlag::new(enabled),
            Arc::new(FakeEndpoint { sent, status }),
        );
        let relay = Relay::new(
            ConnectionRegistry::new(),
            PositionSink::new(Arc::new(ChannelStore(sample_tx))),
            gate,
        );
        Harness {
            relay,
            samples,
            forwarded,
        }
    }

    fn send(relay: &Relay, event: &str, args: Value) -> Handled {
        let text = json!({"event": event, "args": args}).to_string();
        relay.handle_text(Uuid::new_v4(), &text)
    }

    async fn next_frame(connection: &mut Connection) -> Frame {
        timeout(Duration::from_secs(1), connection.recv())
            .await
            .expect("timed out waiting for broadcast")
            .unwrap()
    }

    fn assert_silent(connection: &mut Connection) {
        assert!(matches!(connection.try_recv(), Err(TryRecvError::Empty)));
    }

    fn valid_pose() -> Value {
        json!({
            "ID": "u1",
            "Position": {"x": 1, "y": 2, "z": 3},
            "Orientation": {"x": 0, "y": 0, "z": 0, "w": 1},
            "Confidence": 0.9
        })
    }

    // ==================== decoding ====================

    #[tokio::test]
    async fn undecodable_frame_is_rejected_without_broadcast() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        let handled = h.relay.handle_text(Uuid::new_v4(), "{not json");

        assert!(matches!(handled, Handled::Rejected(Rejection::Decode(_))));
        assert_silent(&mut conn);
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        assert_eq!(send(&h.relay, "self-destruct", json!([])), Handled::Ignored);
        assert_silent(&mut conn);
    }

    // ==================== pose ====================

    #[tokio::test]
    async fn pose_is_broadcast_to_every_connection_including_sender() {
        let h = harness(false, Some(200));
        let mut sender = h.relay.registry().register();
        let mut other = h.relay.registry().register();

        let text = json!({"event": "unit-update", "args": [valid_pose()]}).to_string();
        let handled = h.relay.handle_text(sender.id(), &text);

        assert_eq!(handled, Handled::Broadcast(2));
        for conn in [&mut sender, &mut other] {
            assert_eq!(
                next_frame(conn).await,
                Frame::single(DEVICE_DATA, valid_pose())
            );
        }
    }

    #[tokio::test]
    async fn pose_string_form_is_decoded_before_broadcast() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        let handled = send(&h.relay, "unit-update", json!([valid_pose().to_string()]));

        assert_eq!(handled, Handled::Broadcast(1));
        assert_eq!(next_frame(&mut conn).await.args, vec![valid_pose()]);
    }

    #[tokio::test]
    async fn invalid_pose_is_rejected_silently() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();
        let mut pose = valid_pose();
        pose["Orientation"].as_object_mut().unwrap().remove("w");

        let handled = send(&h.relay, "unit-update", json!([pose]));

        assert_eq!(handled, Handled::Rejected(Rejection::MissingField("Orientation.w")));
        assert_silent(&mut conn);
    }

    // ==================== positions ====================

    #[tokio::test]
    async fn position_sample_is_persisted_not_broadcast() {
        let mut h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        let handled = send(&h.relay, "log-lat-long", json!(["91.5", -10.2, 3, "drone-7"]));
        assert_eq!(handled, Handled::Persisted);

        let sample = timeout(Duration::from_secs(1), h.samples.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.unit_id, "drone-7");
        assert_eq!(sample.lat, 91.5);
        assert_eq!(sample.long, -10.2);
        assert_eq!(sample.alt, 3.0);
        assert_silent(&mut conn);
    }

    #[tokio::test]
    async fn json_position_form_reaches_the_same_sink() {
        let mut h = harness(false, Some(200));

        let payload = json!({"lat": 1, "long": 2, "alt": 3}).to_string();
        assert_eq!(
            send(&h.relay, "log-lat-long-json", json!([payload])),
            Handled::Persisted
        );

        let sample = timeout(Duration::from_secs(1), h.samples.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.unit_id, "none");
    }

    #[tokio::test]
    async fn non_numeric_position_is_rejected_and_not_written() {
        let mut h = harness(false, Some(200));

        let handled = send(&h.relay, "log-lat-long", json!(["abc", 1, 2]));

        assert!(matches!(
            handled,
            Handled::Rejected(Rejection::InvalidNumber { field: "lat", .. })
        ));
        tokio::task::yield_now().await;
        assert!(h.samples.try_recv().is_err());
    }

    // ==================== session events ====================

    #[tokio::test]
    async fn start_normalizes_id_and_relays_other_args() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        send(&h.relay, "start", json!([1.5, 2.5, 3.5, "42", "scenario-a"]));

        assert_eq!(
            next_frame(&mut conn).await,
            Frame::new("start", vec![json!(1.5), json!(2.5), json!(3.5), json!(42), json!("scenario-a")])
        );
    }

    #[tokio::test]
    async fn stop_and_upload_keep_non_numeric_ids() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        send(&h.relay, "stop", json!(["7"]));
        send(&h.relay, "upload", json!(["drone-7"]));

        assert_eq!(next_frame(&mut conn).await, Frame::single("stop", json!(7)));
        assert_eq!(
            next_frame(&mut conn).await,
            Frame::single("upload", json!("drone-7"))
        );
    }

    // ==================== biometrics ====================

    #[tokio::test]
    async fn biometric_forms_broadcast_the_same_shape() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();
        let expected = json!({
            "id": 1, "unitName": "alpha", "heartRate": 72, "bloodO2": 98, "bodyTemp": 36.6
        });

        send(&h.relay, "biometrics", json!([1, "alpha", 72, 98, 36.6]));
        send(&h.relay, "biometrics-json", json!([expected.to_string()]));

        for _ in 0..2 {
            assert_eq!(
                next_frame(&mut conn).await,
                Frame::single("biometrics", expected.clone())
            );
        }
    }

    // ==================== forwarding ====================

    #[tokio::test]
    async fn toggle_writes_flag_and_broadcasts_value() {
        let h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        send(&h.relay, "transmit-comp-data", json!([true]));
        assert!(h.relay.gate().flag().is_enabled());
        assert_eq!(
            next_frame(&mut conn).await,
            Frame::single("transmit-comp-data", json!(true))
        );

        send(&h.relay, "transmit-comp-data", json!([]));
        assert_eq!(
            next_frame(&mut conn).await,
            Frame::single("transmit-comp-data", json!(true))
        );
    }

    #[tokio::test]
    async fn toggle_broadcasts_written_value_and_reads_current_flag() {
        let h = harness(true, Some(200));
        let mut conn = h.relay.registry().register();

        send(&h.relay, "transmit-comp-data", json!([false]));
        assert_eq!(
            next_frame(&mut conn).await,
            Frame::single("transmit-comp-data", json!(false))
        );

        // Another writer flips the flag; a bare read reports that value.
        h.relay.gate().flag().set(true);
        send(&h.relay, "transmit-comp-data", json!([null]));
        assert_eq!(
            next_frame(&mut conn).await,
            Frame::single("transmit-comp-data", json!(true))
        );
    }

    #[tokio::test]
    async fn toggle_with_non_boolean_is_rejected() {
        let h = harness(true, Some(200));

        let handled = send(&h.relay, "transmit-comp-data", json!(["yes"]));

        assert!(matches!(handled, Handled::Rejected(Rejection::InvalidField { .. })));
        assert!(h.relay.gate().flag().is_enabled());
    }

    #[tokio::test]
    async fn disabled_forwarding_announces_disabled_without_calling_out() {
        let mut h = harness(false, Some(200));
        let mut conn = h.relay.registry().register();

        let handled = send(&h.relay, "send-competition-data", json!([{"team": "blue"}]));

        assert_eq!(handled, Handled::Forwarding);
        assert_eq!(
            next_frame(&mut conn).await,
            Frame::new(COMPETITION_DATA_RESULT, vec![json!("none"), json!("disabled")])
        );
        assert!(h.forwarded.try_recv().is_err());
    }

    #[tokio::test]
    async fn enabled_forwarding_sends_decoded_payload_and_announces_body() {
        let mut h = harness(true, Some(200));
        let mut conn = h.relay.registry().register();

        send(
            &h.relay,
            "send-competition-data",
            json!([r#"{"team":"blue","laps":3}"#]),
        );

        assert_eq!(
            next_frame(&mut conn).await,
            Frame::new(COMPETITION_DATA_RESULT, vec![json!("status 200"), json!("sent")])
        );
        assert_eq!(
            h.forwarded.recv().await.unwrap(),
            json!({"team": "blue", "laps": 3})
        );
    }

    #[tokio::test]
    async fn forwarding_failure_is_announced() {
        let h = harness(true, None);
        let mut conn = h.relay.registry().register();

        send(&h.relay, "send-competition-data", json!([{}]));

        assert_eq!(
            next_frame(&mut conn).await.args,
            vec![json!("none"), json!("failed")]
        );
    }

    #[tokio::test]
    async fn ungated_forward_ignores_flag_and_announces() {
        let mut h = harness(false, Some(202));
        let mut conn = h.relay.registry().register();

        let outcome = h.relay.forward_ungated(&json!({"a": 1})).await;

        assert_eq!(outcome.status(), Some(202));
        assert_eq!(h.forwarded.recv().await.unwrap(), json!({"a": 1}));
        assert_eq!(
            next_frame(&mut conn).await.args,
            vec![json!("status 202"), json!("sent")]
        );
    }

    #[tokio::test]
    async fn missing_competition_payload_is_rejected() {
        let h = harness(true, Some(200));
        assert_eq!(
            send(&h.relay, "send-competition-data", json!([])),
            Handled::Rejected(Rejection::MissingField("payload"))
        );
    }
}
