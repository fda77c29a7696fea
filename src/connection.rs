use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use portable_atomic::AtomicBool;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Duration;

use stats::{EndpointStats, LoggingSink, MetricsSink, StatsGatherer};
use wire::ProtocolVersion;

use crate::adapter::memory::{MemRegion, SharedRegion};
use crate::adapter::socket::SocketEndpoint;
use crate::adapter::{AdapterKind, EndpointDirection, PollStatus, HEADER_BLOCK_SIZE};
use crate::control::ControlInterface;
use crate::endpoint_manager::{EndpointManager, ManagedEndpoint};
use crate::error::{Error, Result};
use crate::probe::{ProbeEndpoint, ProbeEvent, ProbeRole};
use crate::sgl::Sgl;
use crate::tx_payload::{PayloadConfig, PayloadResult, TxPipeline};

/// Queue sizes for channels whose producers are bounded elsewhere.
const APP_EVENT_QUEUE: usize = 1024;
const COMPLETION_QUEUE: usize = 2048;
const PROBE_PACKET_QUEUE: usize = 64;
const PROBE_EVENT_QUEUE: usize = 16;
/// Poll worker back-off when a full pass found no work.
const POLL_IDLE_SLEEP: Duration = Duration::from_millis(1);
/// How long `close` waits for shutdown commands to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Folded status across every endpoint of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
        };
        write!(f, "{s}")
    }
}

/// Connection callback argument.
#[derive(Debug, Clone)]
pub struct ConnectionChange {
    pub status: ConnectionStatus,
    pub version: Option<ProtocolVersion>,
    pub remote_addr: SocketAddr,
}

/// Events bound for the application callback task, which is the only
/// place user code runs; no internal lock is held while it does.
pub(crate) enum AppEvent {
    Payload(PayloadResult),
    Connection(ConnectionChange),
}

pub type PayloadCallback = Arc<dyn Fn(PayloadResult) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(ConnectionChange) + Send + Sync>;

#[derive(Default, Clone)]
pub struct ConnectionCallbacks {
    pub on_payload: Option<PayloadCallback>,
    pub on_connection: Option<ConnectionCallback>,
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_payload", &self.on_payload.is_some())
            .field("on_connection", &self.on_connection.is_some())
            .finish()
    }
}

/// Everything needed to stand up one connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub name: Option<String>,
    pub adapter_kind: AdapterKind,
    pub local_ip: String,
    pub remote_addr: SocketAddr,
    pub stream_name: Option<String>,
    pub stream_id: Option<i32>,
    pub max_payloads: usize,
    pub tx_buffer_bytes: usize,
    /// Local control port to listen on. A receiver binds the port its
    /// peers are configured to probe; 0 picks an ephemeral port.
    pub control_port: u16,
    pub stats_period: Duration,
    pub metrics_sink: Option<Arc<dyn MetricsSink + Send + Sync>>,
    pub callbacks: ConnectionCallbacks,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("adapter_kind", &self.adapter_kind)
            .field("local_ip", &self.local_ip)
            .field("remote_addr", &self.remote_addr)
            .field("stream_name", &self.stream_name)
            .field("stream_id", &self.stream_id)
            .field("max_payloads", &self.max_payloads)
            .field("tx_buffer_bytes", &self.tx_buffer_bytes)
            .field("control_port", &self.control_port)
            .field("stats_period", &self.stats_period)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(remote_addr: SocketAddr) -> Self {
        ConnectionConfig {
            name: None,
            adapter_kind: AdapterKind::Socket,
            local_ip: "0.0.0.0".to_owned(),
            remote_addr,
            stream_name: None,
            stream_id: None,
            max_payloads: 64,
            tx_buffer_bytes: 2 * 1024 * 1024,
            control_port: 0,
            stats_period: Duration::from_secs(60),
            metrics_sink: None,
            callbacks: ConnectionCallbacks::default(),
        }
    }
}

/// One logical channel to a remote peer, holding up to
/// [`crate::endpoint_manager::MAX_ENDPOINTS`] endpoints. The connection
/// outlives every endpoint it contains; dropping it tears the tasks down
/// through the close channel.
pub struct Connection {
    name: String,
    direction: EndpointDirection,
    local_ip: String,
    control_port: u16,
    stream_name: String,
    max_payloads: usize,
    stats_period: Duration,
    metrics_sink: Arc<dyn MetricsSink + Send + Sync>,
    manager: Arc<EndpointManager>,
    region: SharedRegion,
    close_tx: broadcast::Sender<()>,
    app_events_tx: mpsc::Sender<AppEvent>,
    /// Serializes endpoint creation so ids assigned by the manager match
    /// the endpoints we build.
    setup: Mutex<()>,
    /// Receive-side free buffer queue, refilled via `free_rx_buffer`.
    rx_free_queue: std::sync::Mutex<Vec<bytes::Bytes>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish()
    }
}

impl Connection {
    /// Creates a transmit connection with its first endpoint and starts
    /// every worker task.
    pub async fn tx(config: ConnectionConfig) -> Result<Arc<Self>> {
        let connection = Self::build(EndpointDirection::Send, &config)?;
        connection
            .add_endpoint(config.remote_addr, config.stream_id)
            .await?;
        connection.start_connection_tasks();
        Ok(connection)
    }

    /// Creates a receive connection: probe responder plus adapter
    /// endpoint; payload reassembly happens downstream of the adapter.
    pub async fn rx(config: ConnectionConfig) -> Result<Arc<Self>> {
        let connection = Self::build(EndpointDirection::Receive, &config)?;
        connection
            .add_endpoint(config.remote_addr, config.stream_id)
            .await?;
        connection.start_connection_tasks();
        Ok(connection)
    }

    fn build(direction: EndpointDirection, config: &ConnectionConfig) -> Result<Arc<Self>> {
        if config.adapter_kind != AdapterKind::Socket {
            return Err(Error::ErrAdapterUnsupported);
        }
        let name = config.name.clone().unwrap_or_else(|| {
            format!(
                "{}-{:04x}",
                match direction {
                    EndpointDirection::Send => "tx",
                    EndpointDirection::Receive => "rx",
                },
                rand::random::<u16>()
            )
        });

        let (close_tx, _) = broadcast::channel(16);
        let (app_events_tx, app_events_rx) = mpsc::channel(APP_EVENT_QUEUE);
        let manager = EndpointManager::new(name.clone(), app_events_tx.clone());

        Self::spawn_callback_task(config.callbacks.clone(), app_events_rx, close_tx.subscribe());

        Ok(Arc::new(Connection {
            name,
            direction,
            local_ip: config.local_ip.clone(),
            control_port: config.control_port,
            stream_name: config
                .stream_name
                .clone()
                .unwrap_or_else(|| "default".to_owned()),
            max_payloads: config.max_payloads,
            stats_period: config.stats_period,
            metrics_sink: config
                .metrics_sink
                .clone()
                .unwrap_or_else(|| Arc::new(LoggingSink)),
            manager,
            region: MemRegion::shared(config.tx_buffer_bytes, HEADER_BLOCK_SIZE),
            close_tx,
            app_events_tx,
            setup: Mutex::new(()),
            rx_free_queue: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connection_connected()
    }

    pub fn endpoint_count(&self) -> usize {
        self.manager.endpoint_count()
    }

    /// Adds one more stream endpoint toward `remote`; refuses a duplicate
    /// `(remote, stream)` pair.
    pub async fn add_endpoint(
        self: &Arc<Self>,
        remote: SocketAddr,
        stream_id: Option<i32>,
    ) -> Result<usize> {
        let _guard = self.setup.lock().await;

        for id in 0..self.manager.endpoint_count() {
            if let Some(existing) = self.manager.endpoint(id) {
                if existing.remote_addr == remote && existing.stream_id == stream_id {
                    return Err(Error::ErrAdapterDuplicateEntry);
                }
            }
        }

        let id = self.manager.endpoint_count();
        let endpoint_name = format!("{}:ep{}", self.name, id);
        let stats = Arc::new(EndpointStats::new());
        let connected = Arc::new(AtomicBool::new(false));

        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_QUEUE);
        let adapter = Arc::new(
            SocketEndpoint::open(
                endpoint_name.clone(),
                &self.local_ip,
                remote,
                Arc::clone(&self.region),
                completion_tx,
            )
            .await?,
        );

        let pipeline = if self.direction == EndpointDirection::Send {
            Some(TxPipeline::new(
                endpoint_name.clone(),
                adapter.clone(),
                Arc::clone(&self.region),
                Arc::clone(&connected),
                completion_rx,
                self.app_events_tx.clone(),
                Arc::clone(&stats),
                self.max_payloads,
            ))
        } else {
            drop(completion_rx);
            None
        };

        let endpoint = Arc::new(ManagedEndpoint {
            id,
            name: endpoint_name.clone(),
            direction: self.direction,
            remote_addr: remote,
            stream_id,
            adapter,
            pipeline: pipeline.clone(),
            connected,
            negotiated_version: std::sync::Mutex::new(None),
            stats: Arc::clone(&stats),
        });
        let assigned = self.manager.add_endpoint(Arc::clone(&endpoint))?;
        debug_assert_eq!(assigned, id);

        self.start_endpoint_tasks(endpoint, pipeline).await?;
        Ok(id)
    }

    async fn start_endpoint_tasks(
        self: &Arc<Self>,
        endpoint: Arc<ManagedEndpoint>,
        pipeline: Option<Arc<TxPipeline>>,
    ) -> Result<()> {
        // Only the first endpoint claims the configured control port;
        // additional stream endpoints take ephemeral ports and advertise
        // them through their probe headers.
        let control_port = if endpoint.id == 0 { self.control_port } else { 0 };
        let control =
            ControlInterface::bind(endpoint.name.clone(), &self.local_ip, control_port).await?;

        let (probe_packet_tx, probe_packet_rx) = mpsc::channel(PROBE_PACKET_QUEUE);
        control.spawn_receiver(probe_packet_tx, self.close_tx.subscribe());

        let (probe_events_tx, probe_events_rx) = mpsc::channel(PROBE_EVENT_QUEUE);
        let role = match self.direction {
            EndpointDirection::Send => ProbeRole::Transmitter,
            EndpointDirection::Receive => ProbeRole::Receiver,
        };
        let probe = ProbeEndpoint::new(
            endpoint.name.clone(),
            role,
            control,
            endpoint.remote_addr,
            self.local_ip.clone(),
            self.stream_name.clone(),
            endpoint.stream_id.unwrap_or(-1),
            Arc::clone(&endpoint.stats),
            probe_events_tx,
        );
        tokio::spawn(probe.run(probe_packet_rx, self.close_tx.subscribe()));

        Self::spawn_probe_event_task(
            Arc::clone(&self.manager),
            endpoint.id,
            probe_events_rx,
            self.close_tx.subscribe(),
        );

        if let Some(pipeline) = pipeline {
            let worker = self.manager.register(&format!("{}-payload", endpoint.name));
            tokio::spawn(pipeline.run_worker(worker, self.close_tx.subscribe()));
        }

        let gatherer = StatsGatherer::new(
            endpoint.name.clone(),
            Arc::clone(&endpoint.stats),
            Arc::clone(&self.metrics_sink),
        );
        tokio::spawn(gatherer.run(self.stats_period, self.close_tx.subscribe()));

        Ok(())
    }

    fn start_connection_tasks(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(&self.manager).run(self.close_tx.subscribe()));
        Self::spawn_poll_worker(Arc::clone(&self.manager), self.close_tx.subscribe());
    }

    fn spawn_callback_task(
        callbacks: ConnectionCallbacks,
        mut app_events_rx: mpsc::Receiver<AppEvent>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let deliver = |event: AppEvent| match event {
                AppEvent::Payload(result) => {
                    if let Some(on_payload) = &callbacks.on_payload {
                        on_payload(result);
                    }
                }
                AppEvent::Connection(change) => {
                    if let Some(on_connection) = &callbacks.on_connection {
                        on_connection(change);
                    }
                }
            };
            loop {
                tokio::select! {
                    biased;
                    event = app_events_rx.recv() => {
                        match event {
                            Some(event) => deliver(event),
                            None => return,
                        }
                    }
                    _ = close_rx.recv() => {
                        // Flush whatever is already queued; pending failed
                        // payload reports must still reach the application.
                        while let Ok(event) = app_events_rx.try_recv() {
                            deliver(event);
                        }
                        return;
                    }
                }
            }
        });
    }

    fn spawn_probe_event_task(
        manager: Arc<EndpointManager>,
        endpoint_id: usize,
        mut probe_events_rx: mpsc::Receiver<ProbeEvent>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.recv() => return,
                    event = probe_events_rx.recv() => {
                        match event {
                            Some(ProbeEvent::Connected { version }) => {
                                manager.update_endpoint_connected(endpoint_id, true, Some(version));
                                manager.queue_start(endpoint_id);
                            }
                            Some(ProbeEvent::Disconnected) => {
                                manager.update_endpoint_connected(endpoint_id, false, None);
                                manager.queue_reset(endpoint_id);
                            }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    /// Single shared poll worker: adapter polling, command gating through
    /// the manager, and deferred endpoint destruction.
    fn spawn_poll_worker(manager: Arc<EndpointManager>, mut close_rx: broadcast::Receiver<()>) {
        manager.register_poll_worker("poll");
        tokio::spawn(async move {
            let mut cursor = 0usize;
            loop {
                if close_rx.try_recv().is_ok() {
                    return;
                }
                let count = manager.endpoint_count();
                if count == 0 {
                    tokio::time::sleep(POLL_IDLE_SLEEP).await;
                    continue;
                }
                let idx = cursor % count;
                let (should_poll, next) = manager.poll(cursor);
                let mut worked = false;
                if should_poll {
                    if let Some(endpoint) = manager.endpoint(idx) {
                        worked = endpoint.adapter.poll().await == PollStatus::Work;
                    }
                }
                for endpoint in manager.drain_destroy() {
                    log::debug!("destroying endpoint {}", endpoint.name);
                    let _ = endpoint.adapter.close().await;
                }
                cursor = next;
                if !worked {
                    tokio::time::sleep(POLL_IDLE_SLEEP).await;
                }
            }
        });
    }

    /// Submits a payload on one of this connection's send endpoints.
    pub fn submit_payload(
        &self,
        endpoint_id: usize,
        config: PayloadConfig,
        source_sgl: Sgl,
        max_latency_microsecs: u64,
    ) -> Result<()> {
        let endpoint = self
            .manager
            .endpoint(endpoint_id)
            .ok_or(Error::ErrInvalidHandle)?;
        let pipeline = endpoint
            .pipeline
            .as_ref()
            .ok_or(Error::ErrInvalidParameter)?;
        pipeline.submit(config, source_sgl, max_latency_microsecs)
    }

    /// Returns receive buffers to the endpoint's free queue.
    pub fn free_rx_buffer(&self, sgl: Sgl) {
        if let Ok(mut queue) = self.rx_free_queue.lock() {
            for entry in sgl.entries() {
                queue.push(entry.clone());
            }
        }
    }

    /// Cooperative teardown: shut every endpoint down (flushing pending
    /// payloads to the application), wait for the commands to drain, then
    /// stop every task.
    pub async fn close(&self) {
        log::debug!("[{}] closing connection", self.name);
        let count = self.manager.endpoint_count();
        for id in 0..count {
            self.manager.shutdown(id);
        }

        let deadline = Instant::now() + CLOSE_DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            let all_down = (0..count).all(|id| self.manager.endpoint(id).is_none());
            if all_down {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = self.close_tx.send(());
    }
}
