pub mod memory;
pub mod socket;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use memory::MemBlock;

/// Largest datagram the socket adapter will emit. A fabric provider
/// reports its own limit at open time.
pub const SOCKET_MAX_PACKET_SIZE: usize = 8192;
/// Per-packet cap on source slices, matching provider send-SGL limits.
pub const MAX_TX_SGL_ENTRIES: usize = 20;
/// Transmit region block size; every packet header fits in one block.
pub const HEADER_BLOCK_SIZE: usize = 1024;
/// Extra data must leave room for the fixed number-0 fields in one block.
pub const MAX_EXTRA_DATA_SIZE: usize = HEADER_BLOCK_SIZE - wire::NUM0_FIXED_HEADER_SIZE;

/// Datagram provider families an endpoint can be opened on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdapterKind {
    /// RDMA-capable network fabric (external provider library).
    Fabric,
    /// Plain UDP sockets; the drop-in alternative used for testing.
    Socket,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AdapterKind::Fabric => "Fabric",
            AdapterKind::Socket => "Socket",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointDirection {
    Send,
    Receive,
}

impl fmt::Display for EndpointDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            EndpointDirection::Send => "Send",
            EndpointDirection::Receive => "Receive",
        };
        write!(f, "{s}")
    }
}

/// Result of one poll turn.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Idle,
    Work,
}

/// Ack state a completion reports for its packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    NotConnected,
}

/// One outgoing packet: a header block inside the transmit region followed
/// by zero or more payload slices.
#[derive(Debug, Clone)]
pub struct TxPacket {
    /// Round-trips to the originating work request through the completion.
    pub work_id: u32,
    pub header: MemBlock,
    pub payload: Vec<Bytes>,
}

/// Delivered once per submitted packet, in submission order per endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SendCompletion {
    pub work_id: u32,
    pub status: CompletionStatus,
}

/// Uniform send/poll surface over one datagram endpoint.
///
/// Runtime send and poll are single-threaded by design: only the payload
/// worker calls `enqueue_send` and only the poll worker calls `poll`.
/// `reset`/`start`/`close` come from the endpoint manager while those
/// workers are quiesced.
#[async_trait]
pub trait AdapterEndpoint: fmt::Debug + Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn reset(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Hands a batch to the provider. Completions for accepted packets are
    /// delivered later through the completion channel registered at open.
    async fn enqueue_send(&self, batch: Vec<TxPacket>) -> Result<()>;

    /// One poll turn: drain provider completions into the completion
    /// channel. Must never block beyond a bounded amount of work.
    async fn poll(&self) -> PollStatus;

    /// Packets accepted but not yet completed.
    fn transmit_queue_level(&self) -> usize;

    fn max_packet_size(&self) -> usize;
    fn max_tx_sgl_entries(&self) -> usize;
}
