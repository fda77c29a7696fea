use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use portable_atomic::AtomicBool;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::adapter::memory::SharedRegion;
use crate::adapter::{
    AdapterEndpoint, CompletionStatus, PollStatus, SendCompletion, TxPacket,
    MAX_TX_SGL_ENTRIES, SOCKET_MAX_PACKET_SIZE,
};
use crate::error::{Error, Result};

/// UDP-backed endpoint.
///
/// A datagram either leaves the socket or fails locally, so completions
/// are synthesized at send time and parked until the next poll turn, which
/// mirrors how a fabric provider's completion queue drains.
pub struct SocketEndpoint {
    name: String,
    socket: UdpSocket,
    remote: SocketAddr,
    region: SharedRegion,
    started: AtomicBool,
    pending: Mutex<VecDeque<SendCompletion>>,
    completion_tx: mpsc::Sender<SendCompletion>,
}

impl std::fmt::Debug for SocketEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEndpoint")
            .field("name", &self.name)
            .field("remote", &self.remote)
            .field("started", &self.started)
            .finish()
    }
}

impl SocketEndpoint {
    pub async fn open(
        name: String,
        local_ip: &str,
        remote: SocketAddr,
        region: SharedRegion,
        completion_tx: mpsc::Sender<SendCompletion>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((local_ip, 0)).await?;
        Ok(SocketEndpoint {
            name,
            socket,
            remote,
            region,
            started: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            completion_tx,
        })
    }

    fn push_completion(&self, completion: SendCompletion) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(completion);
        }
    }
}

#[async_trait]
impl AdapterEndpoint for SocketEndpoint {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        log::debug!("[{}] socket endpoint started", self.name);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        log::debug!("[{}] socket endpoint reset", self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn enqueue_send(&self, batch: Vec<TxPacket>) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::ErrNotConnected);
        }

        for packet in batch {
            if packet.payload.len() > MAX_TX_SGL_ENTRIES {
                return Err(Error::ErrArraySizeExceeded);
            }

            let mut datagram = {
                let region = match self.region.lock() {
                    Ok(region) => region,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let header = region.slice(&packet.header);
                let mut datagram = Vec::with_capacity(
                    header.len() + packet.payload.iter().map(|e| e.len()).sum::<usize>(),
                );
                datagram.extend_from_slice(header);
                datagram
            };
            for entry in &packet.payload {
                datagram.extend_from_slice(entry);
            }

            let status = match self.socket.send_to(&datagram, self.remote).await {
                Ok(_) => CompletionStatus::Ok,
                Err(e) => {
                    log::warn!("[{}] send to {} failed: {}", self.name, self.remote, e);
                    CompletionStatus::NotConnected
                }
            };
            self.push_completion(SendCompletion {
                work_id: packet.work_id,
                status,
            });
        }
        Ok(())
    }

    async fn poll(&self) -> PollStatus {
        let drained: Vec<SendCompletion> = {
            let mut pending = match self.pending.lock() {
                Ok(pending) => pending,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return PollStatus::Idle;
        }
        for completion in drained {
            if self.completion_tx.send(completion).await.is_err() {
                return PollStatus::Idle;
            }
        }
        PollStatus::Work
    }

    fn transmit_queue_level(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn max_packet_size(&self) -> usize {
        SOCKET_MAX_PACKET_SIZE
    }

    fn max_tx_sgl_entries(&self) -> usize {
        MAX_TX_SGL_ENTRIES
    }
}
