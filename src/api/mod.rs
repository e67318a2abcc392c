//! HTTP API Module
//!
//! Provides the replication endpoints and the node's REST API.

mod http;

pub use http::{HealthResponse, HttpServer, StatusResponse, VolumeResponse, VolumeSummary};
