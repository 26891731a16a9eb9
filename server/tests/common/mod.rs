//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;

use telemetry_relay_server::config::Config;
use telemetry_relay_server::forwarding::{CompetitionSink, ForwardError, UpstreamResponse};
use telemetry_relay_server::routes::{create_router, AppState};
use telemetry_relay_server::sink::{PositionStore, SinkError, StoredPosition};
use telemetry_relay_server::types::PositionSample;

/// Configuration with placeholder secrets; clients are injected directly.
pub fn test_config(transmit_comp_data: bool) -> Config {
    Config {
        port: 0,
        logging_enabled: false,
        influxdb_host: "http://127.0.0.1:1".to_string(),
        influxdb_token: "test-token".to_string(),
        influxdb_database: "positions".to_string(),
        competition_endpoint: "http://127.0.0.1:1/ingest".to_string(),
        client_cert_base64: String::new(),
        client_key_base64: String::new(),
        transmit_comp_data,
    }
}

/// In-memory position store that reads back what was written.
#[derive(Default)]
pub struct MemoryStore {
    samples: Mutex<Vec<PositionSample>>,
}

impl MemoryStore {
    pub fn samples(&self) -> Vec<PositionSample> {
        self.samples.lock().unwrap().clone()
    }

    /// Polls until at least `count` samples were written.
    pub async fn wait_for(&self, count: usize) -> Vec<PositionSample> {
        for _ in 0..100 {
            let samples = self.samples();
            if samples.len() >= count {
                return samples;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} samples");
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn write(&self, sample: &PositionSample) -> Result<(), SinkError> {
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }

    async fn recent(
        &self,
        _window: Duration,
        limit: usize,
    ) -> Result<Vec<StoredPosition>, SinkError> {
        Ok(self
            .samples()
            .into_iter()
            .take(limit)
            .map(|s| StoredPosition {
                time: s.observed_at,
                lat: Some(s.lat),
                long: Some(s.long),
            })
            .collect())
    }
}

/// Competition endpoint that records payloads and answers with a fixed
/// status.
pub struct RecordingEndpoint {
    pub status: u16,
    pub received: Mutex<Vec<Value>>,
}

impl RecordingEndpoint {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompetitionSink for RecordingEndpoint {
    async fn send(&self, payload: &Value) -> Result<UpstreamResponse, ForwardError> {
        self.received.lock().unwrap().push(payload.clone());
        Ok(UpstreamResponse {
            status: self.status,
            body: "ack".to_string(),
        })
    }
}

/// Builds state around the given fakes.
pub fn test_state(
    transmit_comp_data: bool,
    store: Arc<MemoryStore>,
    endpoint: Arc<RecordingEndpoint>,
) -> AppState {
    AppState::with_components(test_config(transmit_comp_data), store, endpoint)
}

/// Spawns the server on a random available port.
pub async fn spawn_server(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    (addr, handle)
}
