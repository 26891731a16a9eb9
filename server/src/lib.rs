//! Telemetry Relay Server - real-time position and pose event relay.
//!
//! This crate provides the server that sits between field units and the
//! dashboards watching them:
//! - Relaying pose, biometric and session events to every connected client
//! - Persisting position samples to a time-series store
//! - Serving the recent position log over HTTP
//! - Forwarding competition payloads to an external endpoint over mTLS
//!
//! # Architecture
//!
//! Clients connect over a WebSocket and are all equal peers: anything one
//! client sends that passes validation is broadcast to all of them, the
//! sender included. Position samples and competition payloads additionally
//! take a side pipeline that runs in the background and never holds up the
//! relay.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod history;
pub mod influx;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod sink;
pub mod types;
pub mod validate;
