//! Connectors to third-party integrations
//!
//! This module provides:
//! - The [`Transport`] seam and the hyper-based [`HttpTransport`]
//! - [`Connector`], enforcing lifecycle, circuit breaking, rate limiting,
//!   response caching and retries for one integration
//! - [`ConnectorRegistry`], handing out one connector per id

pub mod client;
pub mod registry;
pub mod transport;
pub mod types;

pub use client::Connector;
pub use registry::ConnectorRegistry;
pub use transport::{
    build_url, encode_component, HttpTransport, Transport, TransportError, TransportRequest,
    TransportResponse,
};
pub use types::{
    ConnectorMetrics, ConnectorPhase, ConnectorRequest, ConnectorResponse, ConnectorState,
};
