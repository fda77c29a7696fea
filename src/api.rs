
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use lazy_static::lazy_static;

use crate::adapter::AdapterKind;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Error, Result};
use crate::sgl::Sgl;
use crate::tx_payload::PayloadConfig;

/// Opaque handle to an initialized adapter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AdapterHandle(u64);

/// Opaque handle to a live connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

/// Opaque handle to one endpoint within a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndpointHandle {
    connection: ConnectionHandle,
    endpoint_id: usize,
}

#[derive(Debug, Clone)]
struct AdapterEntry {
    kind: AdapterKind,
    local_ip: String,
    tx_buffer_bytes: usize,
}

#[derive(Default)]
struct SdkContext {
    next_handle: u64,
    adapters: HashMap<u64, AdapterEntry>,
    connections: HashMap<u64, (u64, Arc<Connection>)>,
}

impl SdkContext {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

lazy_static! {
    static ref SDK: Mutex<SdkContext> = Mutex::new(SdkContext::default());
}

fn lock_sdk() -> MutexGuard<'static, SdkContext> {
    match SDK.lock() {
        Ok(context) => context,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registers an adapter: the provider family, the local interface address
/// and the size of the pinned transmit buffer each connection will carve
/// headers from.
pub fn adapter_initialize(
    kind: AdapterKind,
    local_ip: &str,
    tx_buffer_bytes: usize,
) -> Result<AdapterHandle> {
    if tx_buffer_bytes == 0 {
        return Err(Error::ErrInvalidParameter);
    }
    if kind != AdapterKind::Socket {
        // The fabric provider is an external library; this build carries
        // the socket transport only.
        return Err(Error::ErrAdapterUnsupported);
    }
    let mut sdk = lock_sdk();
    let handle = sdk.allocate_handle();
    sdk.adapters.insert(
        handle,
        AdapterEntry {
            kind,
            local_ip: local_ip.to_owned(),
            tx_buffer_bytes,
        },
    );
    Ok(AdapterHandle(handle))
}

fn connection_config(
    sdk: &SdkContext,
    adapter: AdapterHandle,
    remote_addr: SocketAddr,
    mut config: ConnectionConfig,
) -> Result<ConnectionConfig> {
    let entry = sdk.adapters.get(&adapter.0).ok_or(Error::ErrInvalidHandle)?;
    config.adapter_kind = entry.kind;
    config.local_ip = entry.local_ip.clone();
    config.tx_buffer_bytes = entry.tx_buffer_bytes;
    config.remote_addr = remote_addr;
    Ok(config)
}

/// Creates a transmit connection on an adapter.
pub async fn tx_connection_create(
    adapter: AdapterHandle,
    remote_addr: SocketAddr,
    config: ConnectionConfig,
) -> Result<ConnectionHandle> {
    let config = connection_config(&lock_sdk(), adapter, remote_addr, config)?;
    let connection = Connection::tx(config).await?;
    let mut sdk = lock_sdk();
    let handle = sdk.allocate_handle();
    sdk.connections.insert(handle, (adapter.0, connection));
    Ok(ConnectionHandle(handle))
}

/// Creates a receive connection on an adapter.
pub async fn rx_connection_create(
    adapter: AdapterHandle,
    remote_addr: SocketAddr,
    config: ConnectionConfig,
) -> Result<ConnectionHandle> {
    let config = connection_config(&lock_sdk(), adapter, remote_addr, config)?;
    let connection = Connection::rx(config).await?;
    let mut sdk = lock_sdk();
    let handle = sdk.allocate_handle();
    sdk.connections.insert(handle, (adapter.0, connection));
    Ok(ConnectionHandle(handle))
}

fn connection(handle: ConnectionHandle) -> Result<Arc<Connection>> {
    lock_sdk()
        .connections
        .get(&handle.0)
        .map(|(_, connection)| Arc::clone(connection))
        .ok_or(Error::ErrInvalidHandle)
}

/// Adds a stream endpoint to an existing transmit connection.
pub async fn tx_stream_endpoint_create(
    handle: ConnectionHandle,
    stream_id: i32,
    remote_addr: SocketAddr,
) -> Result<EndpointHandle> {
    let connection = connection(handle)?;
    let endpoint_id = connection.add_endpoint(remote_addr, Some(stream_id)).await?;
    Ok(EndpointHandle {
        connection: handle,
        endpoint_id,
    })
}

/// Submits one payload on a connection's first endpoint.
pub fn tx_payload_submit(
    handle: ConnectionHandle,
    config: PayloadConfig,
    source_sgl: Sgl,
    max_latency_microsecs: u64,
) -> Result<()> {
    connection(handle)?.submit_payload(0, config, source_sgl, max_latency_microsecs)
}

/// Submits one payload on a specific stream endpoint.
pub fn tx_stream_payload_submit(
    handle: EndpointHandle,
    config: PayloadConfig,
    source_sgl: Sgl,
    max_latency_microsecs: u64,
) -> Result<()> {
    connection(handle.connection)?.submit_payload(
        handle.endpoint_id,
        config,
        source_sgl,
        max_latency_microsecs,
    )
}

/// Hands receive buffers back to the SDK.
pub fn rx_free_buffer(handle: ConnectionHandle, sgl: Sgl) -> Result<()> {
    connection(handle)?.free_rx_buffer(sgl);
    Ok(())
}

/// Destroys a connection, failing any in-flight payloads back to the
/// application first.
pub async fn connection_destroy(handle: ConnectionHandle) -> Result<()> {
    let connection = {
        let mut sdk = lock_sdk();
        sdk.connections
            .remove(&handle.0)
            .map(|(_, connection)| connection)
            .ok_or(Error::ErrInvalidHandle)?
    };
    connection.close().await;
    Ok(())
}

/// Destroys an adapter; refuses while connections still use it.
pub fn adapter_destroy(handle: AdapterHandle) -> Result<()> {
    let mut sdk = lock_sdk();
    if sdk
        .connections
        .values()
        .any(|(adapter, _)| *adapter == handle.0)
    {
        return Err(Error::ErrShutdownWhileBusy);
    }
    sdk.adapters
        .remove(&handle.0)
        .map(|_| ())
        .ok_or(Error::ErrInvalidHandle)
}

/// Tears down the process-wide context. Only legal after every adapter
/// and connection has been destroyed.
pub fn sdk_shutdown() -> Result<()> {
    let mut sdk = lock_sdk();
    if !sdk.connections.is_empty() || !sdk.adapters.is_empty() {
        return Err(Error::ErrShutdownWhileBusy);
    }
    sdk.next_handle = 0;
    Ok(())
}
