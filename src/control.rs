use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use portable_atomic::AtomicU64;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use wire::ProbeHeader;

use crate::error::Result;

/// Largest control datagram worth reading; real probe packets are a few
/// hundred bytes.
const CONTROL_RECV_SIZE: usize = 2048;

/// Decode-failure counters for inbound control traffic.
#[derive(Default, Debug)]
pub(crate) struct ControlStats {
    pub crc_error_count: AtomicU64,
    pub size_error_count: AtomicU64,
}

/// Dedicated bidirectional socket for probe traffic.
///
/// Control never shares resources with the data endpoint, so the data
/// endpoint can be reset freely without losing control continuity. The
/// local port is OS-assigned and advertised to the peer inside every
/// probe header.
pub(crate) struct ControlInterface {
    name: String,
    socket: Arc<UdpSocket>,
    local_port: u16,
    pub(crate) stats: Arc<ControlStats>,
}

impl ControlInterface {
    /// Binds the control socket. A receiver binds its advertised
    /// destination port; a transmitter passes 0 for an OS-assigned
    /// ephemeral port.
    pub(crate) async fn bind(name: String, local_ip: &str, port: u16) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((local_ip, port)).await?;
        let local_port = socket.local_addr()?.port();
        log::debug!("[{name}] control interface bound to port {local_port}");
        Ok(Arc::new(ControlInterface {
            name,
            socket: Arc::new(socket),
            local_port,
            stats: Arc::new(ControlStats::default()),
        }))
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    pub(crate) async fn send_probe(&self, remote: SocketAddr, header: &ProbeHeader) -> Result<()> {
        let raw = header.marshal()?;
        self.socket.send_to(&raw, remote).await?;
        log::trace!("[{}] sent probe {} to {}", self.name, header, remote);
        Ok(())
    }

    /// Receive loop: decode inbound probe packets and forward them with
    /// their origin. Damaged packets are dropped and counted; the peer's
    /// retry machinery recovers.
    pub(crate) fn spawn_receiver(
        self: &Arc<Self>,
        probe_tx: mpsc::Sender<(SocketAddr, ProbeHeader)>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; CONTROL_RECV_SIZE];
            loop {
                tokio::select! {
                    _ = close_rx.recv() => return,
                    received = control.socket.recv_from(&mut buf) => {
                        let (n, from) = match received {
                            Ok(received) => received,
                            Err(e) => {
                                log::warn!("[{}] control receive failed: {}", control.name, e);
                                continue;
                            }
                        };
                        let raw = Bytes::copy_from_slice(&buf[..n]);
                        match ProbeHeader::unmarshal(&raw) {
                            Ok(header) => {
                                if probe_tx.send((from, header)).await.is_err() {
                                    return;
                                }
                            }
                            Err(wire::Error::ErrProbePacketCrc) => {
                                control.stats.crc_error_count.fetch_add(1, Ordering::SeqCst);
                                log::debug!("[{}] dropped control packet with bad checksum", control.name);
                            }
                            Err(wire::Error::ErrProbePacketSize) => {
                                control.stats.size_error_count.fetch_add(1, Ordering::SeqCst);
                                log::debug!("[{}] dropped control packet with bad size", control.name);
                            }
                            Err(e) => {
                                log::debug!("[{}] dropped undecodable control packet: {}", control.name, e);
                            }
                        }
                    }
                }
            }
        });
    }
}
