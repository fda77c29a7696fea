#[cfg(test)]
mod probe_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

use stats::EndpointStats;
use wire::{ProbeCommand, ProbeHeader, ProbeTail, ProtocolVersion, PROTOCOL_VERSION};

use crate::control::ControlInterface;

/// Probe engine clock. Retry and liveness windows below are counted in
/// ticks.
pub(crate) const PROBE_TICK: Duration = Duration::from_millis(100);
/// Ticks to wait for an ack before retrying the command.
const RETRY_TICKS: u32 = 3;
/// Bounded retry attempts before the handshake restarts from Reset.
pub(crate) const PROBE_MAX_RETRIES: u32 = 5;
/// Connected transmitters ping on this many ticks.
const PING_INTERVAL_TICKS: u32 = 10;
/// A connected receiver that hears nothing for this long declares the
/// peer gone.
const PING_TIMEOUT_TICKS: u32 = 40;
/// Inbound control packet numbers remembered for duplicate suppression.
const DEDUP_WINDOW: usize = 64;

/// Which half of the handshake this endpoint runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ProbeRole {
    Transmitter,
    Receiver,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ProbeState {
    Disconnected,
    SendReset,
    WaitReset,
    SendProtocolVersion,
    WaitProtocolVersionAck,
    Connected,
}

/// State transitions surfaced to the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeEvent {
    Connected { version: ProtocolVersion },
    Disconnected,
}

/// Duplicate suppression on `(endpoint, control_packet_num)`: the engine
/// re-acks duplicates without reprocessing them.
#[derive(Default, Debug)]
pub(crate) struct PacketNumTracker {
    seen: VecDeque<u16>,
}

impl PacketNumTracker {
    pub(crate) fn new() -> Self {
        PacketNumTracker::default()
    }

    /// True when the number has not been seen inside the window.
    pub(crate) fn observe(&mut self, num: u16) -> bool {
        if self.seen.contains(&num) {
            return false;
        }
        self.seen.push_back(num);
        if self.seen.len() > DEDUP_WINDOW {
            self.seen.pop_front();
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Debug)]
struct AwaitedAck {
    command: ProbeCommand,
    control_packet_num: u16,
    ticks_waiting: u32,
    retries: u32,
}

#[derive(Debug)]
struct ProbeInner {
    state: ProbeState,
    /// Where outgoing probes go; updated from inbound headers so replies
    /// follow the peer's advertised control port.
    remote_addr: SocketAddr,
    next_packet_num: u16,
    awaiting: Option<AwaitedAck>,
    tracker: PacketNumTracker,
    negotiated: Option<ProtocolVersion>,
    /// Tx: ticks since the last ping went out. Rx: ticks since anything
    /// was heard.
    quiet_ticks: u32,
}

/// Per-endpoint probe handshake driver.
pub(crate) struct ProbeEndpoint {
    name: String,
    role: ProbeRole,
    control: Arc<ControlInterface>,
    local_ip: String,
    stream_name: String,
    stream_id: i32,
    stats: Arc<EndpointStats>,
    events_tx: mpsc::Sender<ProbeEvent>,
    inner: Mutex<ProbeInner>,
}

impl ProbeEndpoint {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        role: ProbeRole,
        control: Arc<ControlInterface>,
        remote_addr: SocketAddr,
        local_ip: String,
        stream_name: String,
        stream_id: i32,
        stats: Arc<EndpointStats>,
        events_tx: mpsc::Sender<ProbeEvent>,
    ) -> Arc<Self> {
        let state = match role {
            ProbeRole::Transmitter => ProbeState::SendReset,
            ProbeRole::Receiver => ProbeState::Disconnected,
        };
        Arc::new(ProbeEndpoint {
            name,
            role,
            control,
            local_ip,
            stream_name,
            stream_id,
            stats,
            events_tx,
            inner: Mutex::new(ProbeInner {
                state,
                remote_addr,
                next_packet_num: 0,
                awaiting: None,
                tracker: PacketNumTracker::new(),
                negotiated: None,
                quiet_ticks: 0,
            }),
        })
    }

    pub(crate) fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.lock_inner().negotiated
    }

    pub(crate) fn state(&self) -> ProbeState {
        self.lock_inner().state
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ProbeInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        mut probe_rx: mpsc::Receiver<(SocketAddr, ProbeHeader)>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(PROBE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = close_rx.recv() => return,
                _ = ticker.tick() => {
                    let (outgoing, events) = self.handle_tick();
                    self.dispatch(outgoing, events).await;
                }
                packet = probe_rx.recv() => {
                    let Some((from, header)) = packet else { return };
                    let (outgoing, events) = self.handle_packet(from, header);
                    self.dispatch(outgoing, events).await;
                }
            }
        }
    }

    async fn dispatch(&self, outgoing: Vec<(SocketAddr, ProbeHeader)>, events: Vec<ProbeEvent>) {
        for (remote, header) in outgoing {
            if let Err(e) = self.control.send_probe(remote, &header).await {
                log::warn!("[{}] failed to send probe {}: {}", self.name, header, e);
            }
        }
        for event in events {
            let _ = self.events_tx.send(event).await;
        }
    }

    fn build_header(&self, inner: &mut ProbeInner, command: ProbeCommand, tail: ProbeTail) -> ProbeHeader {
        let control_packet_num = inner.next_packet_num;
        inner.next_packet_num = inner.next_packet_num.wrapping_add(1);
        ProbeHeader {
            protocol_version: PROTOCOL_VERSION,
            command,
            sender_ip: self.local_ip.clone(),
            sender_gid: [0u8; wire::probe::SENDER_GID_SIZE],
            sender_stream_name: self.stream_name.clone(),
            sender_stream_id: self.stream_id,
            sender_control_dest_port: self.control.local_port(),
            control_packet_num,
            tail,
        }
    }

    fn send_command(
        &self,
        inner: &mut ProbeInner,
        outgoing: &mut Vec<(SocketAddr, ProbeHeader)>,
        command: ProbeCommand,
    ) {
        let header = self.build_header(inner, command, ProbeTail::Command { requires_ack: true });
        inner.awaiting = Some(AwaitedAck {
            command,
            control_packet_num: header.control_packet_num,
            ticks_waiting: 0,
            retries: 0,
        });
        outgoing.push((inner.remote_addr, header));
    }

    fn send_ack(
        &self,
        inner: &mut ProbeInner,
        outgoing: &mut Vec<(SocketAddr, ProbeHeader)>,
        acked: &ProbeHeader,
    ) {
        let tail = ProbeTail::Ack {
            ack_command: acked.command,
            ack_control_packet_num: acked.control_packet_num,
        };
        let header = self.build_header(inner, ProbeCommand::Ack, tail);
        outgoing.push((inner.remote_addr, header));
    }

    #[must_use]
    fn handle_tick(&self) -> (Vec<(SocketAddr, ProbeHeader)>, Vec<ProbeEvent>) {
        let mut outgoing = Vec::new();
        let mut events = Vec::new();
        let mut inner = self.lock_inner();

        if let Some(mut awaiting) = inner.awaiting.take() {
            awaiting.ticks_waiting += 1;
            if awaiting.ticks_waiting < RETRY_TICKS {
                inner.awaiting = Some(awaiting);
            } else if awaiting.retries >= PROBE_MAX_RETRIES {
                log::warn!(
                    "[{}] {} unacknowledged after {} retries, restarting handshake",
                    self.name,
                    awaiting.command,
                    awaiting.retries
                );
                self.drop_connection(&mut inner, &mut events);
            } else {
                // Retry with a fresh control packet number.
                let command = awaiting.command;
                let header =
                    self.build_header(&mut inner, command, ProbeTail::Command { requires_ack: true });
                inner.awaiting = Some(AwaitedAck {
                    command,
                    control_packet_num: header.control_packet_num,
                    ticks_waiting: 0,
                    retries: awaiting.retries + 1,
                });
                self.stats.inc_probe_retries();
                outgoing.push((inner.remote_addr, header));
                return (outgoing, events);
            }
        }

        match (self.role, inner.state) {
            (ProbeRole::Transmitter, ProbeState::Disconnected | ProbeState::SendReset) => {
                inner.state = ProbeState::WaitReset;
                self.send_command(&mut inner, &mut outgoing, ProbeCommand::Reset);
            }
            (ProbeRole::Transmitter, ProbeState::SendProtocolVersion) => {
                inner.state = ProbeState::WaitProtocolVersionAck;
                self.send_command(&mut inner, &mut outgoing, ProbeCommand::ProtocolVersion);
            }
            (ProbeRole::Transmitter, ProbeState::Connected) => {
                if inner.awaiting.is_none() {
                    inner.quiet_ticks += 1;
                    if inner.quiet_ticks >= PING_INTERVAL_TICKS {
                        inner.quiet_ticks = 0;
                        self.send_command(&mut inner, &mut outgoing, ProbeCommand::Ping);
                    }
                }
            }
            (ProbeRole::Receiver, ProbeState::Connected) => {
                inner.quiet_ticks += 1;
                if inner.quiet_ticks >= PING_TIMEOUT_TICKS {
                    log::warn!("[{}] peer went quiet, dropping connection", self.name);
                    self.drop_connection(&mut inner, &mut events);
                }
            }
            _ => {}
        }

        (outgoing, events)
    }

    fn drop_connection(&self, inner: &mut ProbeInner, events: &mut Vec<ProbeEvent>) {
        let was_connected = inner.state == ProbeState::Connected;
        inner.awaiting = None;
        inner.negotiated = None;
        inner.quiet_ticks = 0;
        inner.state = match self.role {
            ProbeRole::Transmitter => ProbeState::SendReset,
            ProbeRole::Receiver => ProbeState::Disconnected,
        };
        if was_connected {
            self.stats.inc_disconnections();
        }
        events.push(ProbeEvent::Disconnected);
    }

    #[must_use]
    fn handle_packet(
        &self,
        from: SocketAddr,
        header: ProbeHeader,
    ) -> (Vec<(SocketAddr, ProbeHeader)>, Vec<ProbeEvent>) {
        let mut outgoing = Vec::new();
        let mut events = Vec::new();
        let mut inner = self.lock_inner();

        if !PROTOCOL_VERSION.compatible(&header.protocol_version) {
            log::warn!(
                "[{}] peer protocol {} is incompatible with {}",
                self.name,
                header.protocol_version,
                PROTOCOL_VERSION
            );
            return (outgoing, events);
        }

        // Replies go to the control port the peer advertised, not the
        // ephemeral port the packet happened to leave from.
        inner.remote_addr = SocketAddr::new(from.ip(), header.sender_control_dest_port);
        if self.role == ProbeRole::Receiver {
            inner.quiet_ticks = 0;
        }

        if header.command == ProbeCommand::Ack {
            self.handle_ack(&mut inner, &header, &mut events);
            return (outgoing, events);
        }

        if !inner.tracker.observe(header.control_packet_num) {
            log::debug!("[{}] duplicate control packet {}", self.name, header);
            if matches!(header.tail, ProbeTail::Command { requires_ack: true }) {
                self.send_ack(&mut inner, &mut outgoing, &header);
            }
            return (outgoing, events);
        }

        match header.command {
            ProbeCommand::Reset => {
                // Peer restarted; any negotiated state is void.
                if inner.state == ProbeState::Connected {
                    self.drop_connection(&mut inner, &mut events);
                }
                if self.role == ProbeRole::Receiver {
                    inner.state = ProbeState::WaitProtocolVersionAck;
                }
                self.send_ack(&mut inner, &mut outgoing, &header);
            }
            ProbeCommand::ProtocolVersion => {
                self.send_ack(&mut inner, &mut outgoing, &header);
                if self.role == ProbeRole::Receiver {
                    let negotiated = PROTOCOL_VERSION
                        .negotiate(&header.protocol_version)
                        .unwrap_or(PROTOCOL_VERSION);
                    inner.negotiated = Some(negotiated);
                    inner.state = ProbeState::Connected;
                    inner.quiet_ticks = 0;
                    events.push(ProbeEvent::Connected {
                        version: negotiated,
                    });
                    // Announce readiness; informational, so no ack asked.
                    let connected = self.build_header(
                        &mut inner,
                        ProbeCommand::Connected,
                        ProbeTail::Command {
                            requires_ack: false,
                        },
                    );
                    outgoing.push((inner.remote_addr, connected));
                }
            }
            ProbeCommand::Ping | ProbeCommand::Connected => {
                if matches!(header.tail, ProbeTail::Command { requires_ack: true }) {
                    self.send_ack(&mut inner, &mut outgoing, &header);
                }
            }
            ProbeCommand::Ack => unreachable!("handled above"),
        }

        (outgoing, events)
    }

    fn handle_ack(
        &self,
        inner: &mut ProbeInner,
        header: &ProbeHeader,
        events: &mut Vec<ProbeEvent>,
    ) {
        let ProbeTail::Ack {
            ack_command,
            ack_control_packet_num,
        } = &header.tail
        else {
            return;
        };
        let (ack_command, ack_control_packet_num) = (*ack_command, *ack_control_packet_num);

        let matches_awaited = inner.awaiting.as_ref().is_some_and(|awaited| {
            awaited.command == ack_command && awaited.control_packet_num == ack_control_packet_num
        });
        if !matches_awaited {
            log::debug!("[{}] stale ack {}", self.name, header);
            return;
        }
        inner.awaiting = None;

        match ack_command {
            ProbeCommand::Reset => {
                inner.state = ProbeState::SendProtocolVersion;
            }
            ProbeCommand::ProtocolVersion => {
                let negotiated = PROTOCOL_VERSION
                    .negotiate(&header.protocol_version)
                    .unwrap_or(PROTOCOL_VERSION);
                inner.negotiated = Some(negotiated);
                inner.state = ProbeState::Connected;
                inner.quiet_ticks = 0;
                events.push(ProbeEvent::Connected {
                    version: negotiated,
                });
            }
            _ => {}
        }
    }
}
