#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! medialink: a high-throughput, low-latency transport SDK for
//! uncompressed video, audio and ancillary data.
//!
//! Payloads are fragmented into datagrams, tracked packet by packet
//! through adapter completions and reported back to the application with
//! exactly one callback each. An out-of-band probe channel establishes
//! and monitors peer liveness so the data path can be reset without
//! losing control continuity. The primary target is an RDMA-capable
//! fabric; the UDP socket adapter included here is a drop-in alternative
//! used for testing.

pub mod adapter;
pub mod api;
pub mod connection;
mod control;
mod endpoint_manager;
mod error;
mod packetizer;
mod pool;
mod probe;
mod sgl;
mod tx_payload;

pub use adapter::AdapterKind;
pub use api::{
    adapter_destroy, adapter_initialize, connection_destroy, rx_connection_create, rx_free_buffer,
    sdk_shutdown, tx_connection_create, tx_payload_submit, tx_stream_endpoint_create,
    tx_stream_payload_submit, AdapterHandle, ConnectionHandle, EndpointHandle,
};
pub use connection::{
    Connection, ConnectionCallback, ConnectionCallbacks, ConnectionChange, ConnectionConfig,
    ConnectionStatus, PayloadCallback,
};
pub use endpoint_manager::MAX_ENDPOINTS;
pub use error::{Error, Result, Status};
pub use sgl::Sgl;
pub use tx_payload::{PayloadConfig, PayloadResult};

pub use anc::{AncPacket, AncPayload, FieldKind};
pub use stats::{LoggingSink, MetricsSink, StatsReport};
pub use wire::ProtocolVersion;
