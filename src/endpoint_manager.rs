
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use portable_atomic::AtomicBool;
use tokio::sync::{broadcast, mpsc, watch, Notify};

use stats::EndpointStats;
use wire::ProtocolVersion;

use crate::adapter::{AdapterEndpoint, EndpointDirection};
use crate::connection::{AppEvent, ConnectionChange, ConnectionStatus};
use crate::error::{Error, Result};
use crate::tx_payload::TxPipeline;

/// Bound on endpoints per connection.
pub const MAX_ENDPOINTS: usize = 16;

/// State changes workers can queue against an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EndpointCommand {
    Idle,
    Reset,
    Start,
    Shutdown,
}

impl fmt::Display for EndpointCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            EndpointCommand::Idle => "Idle",
            EndpointCommand::Reset => "Reset",
            EndpointCommand::Start => "Start",
            EndpointCommand::Shutdown => "Shutdown",
        };
        write!(f, "{s}")
    }
}

/// One endpoint as the manager sees it: the adapter handle to reset and
/// start, the pipeline to flush, and the connection-status inputs.
pub(crate) struct ManagedEndpoint {
    pub(crate) id: usize,
    pub(crate) name: String,
    pub(crate) direction: EndpointDirection,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) stream_id: Option<i32>,
    pub(crate) adapter: Arc<dyn AdapterEndpoint>,
    pub(crate) pipeline: Option<Arc<TxPipeline>>,
    /// Shared with the endpoint's pipeline, which gates submissions on it.
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) negotiated_version: Mutex<Option<ProtocolVersion>>,
    pub(crate) stats: Arc<EndpointStats>,
}

impl ManagedEndpoint {
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct EndpointEntry {
    endpoint: Arc<ManagedEndpoint>,
    commands: VecDeque<EndpointCommand>,
    /// Set while a queued command has not finished executing; the poll
    /// worker skips gated endpoints.
    gated: bool,
    shutdown_absorbed: bool,
    destroyed: bool,
}

struct ManagerInner {
    blocking_workers: usize,
    poll_registered: bool,
    waiting: usize,
    poll_waiting: bool,
    endpoints: Vec<EndpointEntry>,
    destroy_queue: VecDeque<usize>,
    connection_connected: bool,
    status_reported: bool,
}

/// Per-connection state-change coordinator.
///
/// Workers that touch endpoint-owned resources register once at startup
/// and park in `wait_for_completion` whenever the command signal fires.
/// The manager task executes queued commands only after every registered
/// worker is parked (the poll worker reports itself waiting through `poll`
/// instead of blocking), which is what makes the single-writer pools safe
/// to flush.
pub(crate) struct EndpointManager {
    name: String,
    inner: Mutex<ManagerInner>,
    command_seq_tx: watch::Sender<u64>,
    command_done_tx: watch::Sender<u64>,
    all_waiting: Notify,
    app_events_tx: mpsc::Sender<AppEvent>,
}

/// Registration receipt for a blocking worker; wraps the command signal
/// and the completion wait.
pub(crate) struct WorkerHandle {
    name: String,
    manager: Arc<EndpointManager>,
    seq_rx: watch::Receiver<u64>,
    done_rx: watch::Receiver<u64>,
}

impl WorkerHandle {
    /// True when a state change has been queued since the last wait.
    pub(crate) fn has_new_command(&mut self) -> bool {
        self.seq_rx.has_changed().unwrap_or(false)
    }

    /// Resolves when the command signal fires. Never resolves once the
    /// manager is gone, so worker select loops wind down via their close
    /// channel instead of spinning.
    pub(crate) async fn changed(&mut self) {
        if self.seq_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Parks this worker until the state change completes.
    pub(crate) async fn wait_for_completion(&mut self) {
        let target = *self.seq_rx.borrow_and_update();
        self.manager.worker_entered_wait(&self.name);
        loop {
            if *self.done_rx.borrow_and_update() >= target {
                break;
            }
            if self.done_rx.changed().await.is_err() {
                break;
            }
        }
        self.manager.worker_left_wait();
    }
}

impl EndpointManager {
    pub(crate) fn new(name: String, app_events_tx: mpsc::Sender<AppEvent>) -> Arc<Self> {
        let (command_seq_tx, _) = watch::channel(0u64);
        let (command_done_tx, _) = watch::channel(0u64);
        Arc::new(EndpointManager {
            name,
            inner: Mutex::new(ManagerInner {
                blocking_workers: 0,
                poll_registered: false,
                waiting: 0,
                poll_waiting: false,
                endpoints: Vec::new(),
                destroy_queue: VecDeque::new(),
                connection_connected: false,
                status_reported: false,
            }),
            command_seq_tx,
            command_done_tx,
            all_waiting: Notify::new(),
            app_events_tx,
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, ManagerInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn add_endpoint(&self, endpoint: Arc<ManagedEndpoint>) -> Result<usize> {
        let mut inner = self.lock_inner();
        if inner.endpoints.len() >= MAX_ENDPOINTS {
            return Err(Error::ErrEndpointLimit);
        }
        let id = inner.endpoints.len();
        inner.endpoints.push(EndpointEntry {
            endpoint,
            commands: VecDeque::new(),
            gated: false,
            shutdown_absorbed: false,
            destroyed: false,
        });
        Ok(id)
    }

    pub(crate) fn endpoint(&self, id: usize) -> Option<Arc<ManagedEndpoint>> {
        let inner = self.lock_inner();
        let entry = inner.endpoints.get(id)?;
        if entry.destroyed {
            return None;
        }
        Some(Arc::clone(&entry.endpoint))
    }

    pub(crate) fn endpoint_count(&self) -> usize {
        self.lock_inner().endpoints.len()
    }

    /// Registers a blocking worker. Must be called before the worker's
    /// task starts observing the command signal.
    pub(crate) fn register(self: &Arc<Self>, name: &str) -> WorkerHandle {
        let mut inner = self.lock_inner();
        inner.blocking_workers += 1;
        log::debug!("[{}] registered worker {}", self.name, name);
        WorkerHandle {
            name: name.to_owned(),
            manager: Arc::clone(self),
            seq_rx: self.command_seq_tx.subscribe(),
            done_rx: self.command_done_tx.subscribe(),
        }
    }

    /// Registers the (single) poll worker, which reports waiting through
    /// `poll` instead of parking.
    pub(crate) fn register_poll_worker(&self, name: &str) {
        let mut inner = self.lock_inner();
        inner.poll_registered = true;
        log::debug!("[{}] registered poll worker {}", self.name, name);
    }

    pub(crate) fn queue_reset(&self, id: usize) {
        self.enqueue(id, EndpointCommand::Reset);
    }

    pub(crate) fn queue_start(&self, id: usize) {
        self.enqueue(id, EndpointCommand::Start);
    }

    pub(crate) fn queue_idle(&self, id: usize) {
        self.enqueue(id, EndpointCommand::Idle);
    }

    /// Idempotent: a second shutdown for the same endpoint is absorbed, as
    /// is any command queued after it.
    pub(crate) fn shutdown(&self, id: usize) {
        self.enqueue(id, EndpointCommand::Shutdown);
    }

    fn enqueue(&self, id: usize, command: EndpointCommand) {
        {
            let mut inner = self.lock_inner();
            let Some(entry) = inner.endpoints.get_mut(id) else {
                return;
            };
            if entry.destroyed || entry.shutdown_absorbed {
                return;
            }
            if command == EndpointCommand::Shutdown
                && entry.commands.back() == Some(&EndpointCommand::Shutdown)
            {
                return;
            }
            entry.commands.push_back(command);
            entry.gated = true;
        }
        self.command_seq_tx.send_modify(|generation| *generation += 1);
    }

    /// Poll-worker gate. Returns whether the endpoint at `cursor` may be
    /// polled and the next cursor. The first refusal of a cycle counts the
    /// poll worker as waiting; it keeps polling unaffected endpoints.
    pub(crate) fn poll(&self, cursor: usize) -> (bool, usize) {
        let mut inner = self.lock_inner();
        let count = inner.endpoints.len();
        if count == 0 {
            return (false, 0);
        }
        let idx = cursor % count;
        let next = (idx + 1) % count;

        let any_gated = inner.endpoints.iter().any(|e| e.gated);
        if any_gated && !inner.poll_waiting {
            inner.poll_waiting = true;
            if Self::quiesced(&inner) {
                self.all_waiting.notify_one();
            }
        }
        let entry = &inner.endpoints[idx];
        if entry.destroyed || entry.gated {
            return (false, next);
        }
        (true, next)
    }

    /// Defers endpoint teardown to the poll worker so no poll turn can be
    /// mid-call on the adapter handle when it closes.
    pub(crate) fn queue_destroy(&self, id: usize) {
        let mut inner = self.lock_inner();
        if inner.endpoints.get(id).is_some_and(|e| !e.destroyed) {
            inner.destroy_queue.push_back(id);
        }
    }

    pub(crate) fn drain_destroy(&self) -> Vec<Arc<ManagedEndpoint>> {
        let mut inner = self.lock_inner();
        let mut out = Vec::new();
        while let Some(id) = inner.destroy_queue.pop_front() {
            let entry = &mut inner.endpoints[id];
            if !entry.destroyed {
                entry.destroyed = true;
                out.push(Arc::clone(&entry.endpoint));
            }
        }
        out
    }

    /// Folds per-endpoint status into the connection status and notifies
    /// the application on a change. The connection is Connected iff every
    /// live endpoint is.
    pub(crate) fn update_endpoint_connected(
        &self,
        id: usize,
        connected: bool,
        version: Option<ProtocolVersion>,
    ) {
        let change = {
            let mut inner = self.lock_inner();
            let Some(entry) = inner.endpoints.get(id) else {
                return;
            };
            let endpoint = Arc::clone(&entry.endpoint);
            endpoint.connected.store(connected, Ordering::SeqCst);
            if let Ok(mut negotiated) = endpoint.negotiated_version.lock() {
                *negotiated = version;
            }

            let live = inner.endpoints.iter().filter(|e| !e.destroyed);
            let mut any = false;
            let folded = live.fold(true, |acc, e| {
                any = true;
                acc && e.endpoint.is_connected()
            }) && any;

            if folded == inner.connection_connected && inner.status_reported {
                None
            } else {
                inner.connection_connected = folded;
                inner.status_reported = true;
                Some(ConnectionChange {
                    status: if folded {
                        ConnectionStatus::Connected
                    } else {
                        ConnectionStatus::Disconnected
                    },
                    version,
                    remote_addr: endpoint.remote_addr,
                })
            }
        };

        if let Some(change) = change {
            log::info!("[{}] connection is now {}", self.name, change.status);
            if self.app_events_tx.try_send(AppEvent::Connection(change)).is_err() {
                log::warn!("[{}] application event queue full, dropped status change", self.name);
            }
        }
    }

    pub(crate) fn is_connection_connected(&self) -> bool {
        self.lock_inner().connection_connected
    }

    fn quiesced(inner: &ManagerInner) -> bool {
        inner.waiting == inner.blocking_workers && (!inner.poll_registered || inner.poll_waiting)
    }

    fn worker_entered_wait(&self, name: &str) {
        let mut inner = self.lock_inner();
        inner.waiting += 1;
        log::trace!("[{}] worker {} waiting", self.name, name);
        if Self::quiesced(&inner) {
            self.all_waiting.notify_one();
        }
    }

    fn worker_left_wait(&self) {
        let mut inner = self.lock_inner();
        inner.waiting = inner.waiting.saturating_sub(1);
    }

    /// Manager task: wait for a command signal, wait for quiescence, drain
    /// each endpoint's queue in arrival order, signal completion.
    pub(crate) async fn run(self: Arc<Self>, mut close_rx: broadcast::Receiver<()>) {
        let mut seq_rx = self.command_seq_tx.subscribe();
        loop {
            tokio::select! {
                _ = close_rx.recv() => return,
                changed = seq_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let generation = *seq_rx.borrow_and_update();

            loop {
                let notified = self.all_waiting.notified();
                if Self::quiesced(&self.lock_inner()) {
                    break;
                }
                tokio::select! {
                    _ = close_rx.recv() => {
                        // Shutting down mid-cycle: release any parked
                        // worker before the task exits.
                        self.command_done_tx
                            .send_modify(|done| *done = generation.max(*done));
                        return;
                    }
                    _ = notified => {}
                }
            }

            self.execute_commands().await;

            {
                let mut inner = self.lock_inner();
                for entry in &mut inner.endpoints {
                    entry.gated = false;
                }
                inner.poll_waiting = false;
            }
            self.command_done_tx
                .send_modify(|done| *done = generation.max(*done));
        }
    }

    async fn execute_commands(&self) {
        let work: Vec<(Arc<ManagedEndpoint>, Vec<EndpointCommand>)> = {
            let mut inner = self.lock_inner();
            inner
                .endpoints
                .iter_mut()
                .filter(|e| !e.commands.is_empty() && !e.destroyed)
                .map(|e| {
                    (
                        Arc::clone(&e.endpoint),
                        e.commands.drain(..).collect::<Vec<_>>(),
                    )
                })
                .collect()
        };

        for (endpoint, commands) in work {
            for command in commands {
                log::debug!("[{}] executing {} on {}", self.name, command, endpoint.name);
                match command {
                    EndpointCommand::Idle => {}
                    EndpointCommand::Reset => {
                        if let Some(pipeline) = &endpoint.pipeline {
                            pipeline.flush().await;
                        }
                        if let Err(e) = endpoint.adapter.reset().await {
                            log::error!("[{}] reset of {} failed: {}", self.name, endpoint.name, e);
                        }
                    }
                    EndpointCommand::Start => {
                        if let Err(e) = endpoint.adapter.start().await {
                            log::error!("[{}] start of {} failed: {}", self.name, endpoint.name, e);
                        }
                    }
                    EndpointCommand::Shutdown => {
                        if let Some(pipeline) = &endpoint.pipeline {
                            pipeline.flush().await;
                        }
                        if let Err(e) = endpoint.adapter.close().await {
                            log::error!("[{}] close of {} failed: {}", self.name, endpoint.name, e);
                        }
                        {
                            let mut inner = self.lock_inner();
                            if let Some(entry) = inner.endpoints.get_mut(endpoint.id) {
                                entry.shutdown_absorbed = true;
                            }
                        }
                        self.queue_destroy(endpoint.id);
                        break;
                    }
                }
            }
        }
    }
}
