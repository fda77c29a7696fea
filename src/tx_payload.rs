#[cfg(test)]
mod tx_payload_test;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use portable_atomic::AtomicBool;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Duration;

use stats::EndpointStats;
use wire::{PayloadType, PtpTimestamp};

use crate::adapter::memory::{MemBlock, MemRegion, SharedRegion};
use crate::adapter::{
    AdapterEndpoint, CompletionStatus, SendCompletion, TxPacket, MAX_EXTRA_DATA_SIZE,
};
use crate::connection::AppEvent;
use crate::endpoint_manager::WorkerHandle;
use crate::error::{Error, Result, Status};
use crate::packetizer::{PacketizeStatus, Packetizer};
use crate::pool::{Pool, PoolIdx};
use crate::sgl::Sgl;

/// A connected but idle transmitter sends a keep-alive payload on this
/// period so the receiver's liveness window stays open.
pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Batches start at one packet for latency and double per send up to this
/// cap for throughput.
const MAX_BATCH_SIZE: usize = 32;
/// Bound on in-flight packet work requests per endpoint.
const WORK_REQUEST_BOUND: usize = 1024;

/// Per-payload submission parameters.
#[derive(Default, Debug, Clone)]
pub struct PayloadConfig {
    /// Semantic unit width in bits (e.g. one pixel group); used to keep
    /// units from straddling packets.
    pub unit_size_bits: u32,
    /// Opaque value echoed back in the completion callback and carried in
    /// the number-0 header.
    pub payload_user_data: u64,
    /// Application header bytes carried in the number-0 packet.
    pub extra_data: Bytes,
}

/// Delivered to the application exactly once per submitted payload.
#[derive(Debug, Clone)]
pub struct PayloadResult {
    pub status: Status,
    pub payload_user_data: u64,
    /// The source SGL handed back to the application.
    pub source_sgl: Sgl,
    pub elapsed_microsecs: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PayloadKind {
    Data,
    KeepAlive,
}

/// Sequence cursor across a payload's packets.
#[derive(Default, Debug, Copy, Clone)]
pub(crate) struct PayloadPacketState {
    pub(crate) source_entry_index: usize,
    pub(crate) source_entry_offset: usize,
    pub(crate) payload_byte_offset: usize,
    pub(crate) packet_sequence_num: u16,
    pub(crate) use_data_offset: bool,
}

/// Pipeline-side state of one submitted payload, created at submission
/// and destroyed when its single completion has been delivered.
#[derive(Debug)]
pub(crate) struct TxPayloadState {
    pub(crate) kind: PayloadKind,
    pub(crate) payload_num: u8,
    pub(crate) packet_state: PayloadPacketState,
    pub(crate) source_sgl: Sgl,
    pub(crate) group_size_bytes: usize,
    pub(crate) group_warned: bool,
    pub(crate) max_latency_microsecs: u64,
    pub(crate) start: Instant,
    pub(crate) origination_ptp_timestamp: PtpTimestamp,
    pub(crate) payload_user_data: u64,
    pub(crate) extra_data: Bytes,
    pub(crate) data_bytes_transferred: usize,
}

impl TxPayloadState {
    pub(crate) fn new(
        kind: PayloadKind,
        config: PayloadConfig,
        source_sgl: Sgl,
        max_latency_microsecs: u64,
    ) -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        TxPayloadState {
            kind,
            payload_num: 0, // assigned on the read side of the queue
            packet_state: PayloadPacketState::default(),
            source_sgl,
            group_size_bytes: group_size_bytes(config.unit_size_bits),
            group_warned: false,
            max_latency_microsecs,
            start: Instant::now(),
            origination_ptp_timestamp: PtpTimestamp {
                seconds: since_epoch.as_secs() as u32,
                nanoseconds: since_epoch.subsec_nanos(),
            },
            payload_user_data: config.payload_user_data,
            extra_data: config.extra_data,
            data_bytes_transferred: 0,
        }
    }

    pub(crate) fn wire_payload_type(&self) -> PayloadType {
        match self.kind {
            PayloadKind::Data => PayloadType::Data,
            PayloadKind::KeepAlive => PayloadType::KeepAlive,
        }
    }
}

/// Smallest run of units that lands on a byte boundary: 1, 2, 4 or 8
/// units depending on `unit_size mod 8`.
pub(crate) fn group_size_bytes(unit_size_bits: u32) -> usize {
    if unit_size_bits == 0 {
        return 0;
    }
    let units: usize = match unit_size_bits % 8 {
        0 => 1,
        4 => 2,
        2 | 6 => 4,
        _ => 8,
    };
    unit_size_bits as usize * units / 8
}

/// One outgoing packet: back-pointer to its payload plus the header block
/// and payload slices. Lives from packetization until the adapter signals
/// completion.
#[derive(Debug)]
pub(crate) struct WorkRequest {
    pub(crate) payload_idx: PoolIdx,
    pub(crate) payload_num: u8,
    pub(crate) packet_sequence_num: u16,
    pub(crate) header_block: MemBlock,
    pub(crate) packet_payload_size: usize,
    pub(crate) entries: Vec<Bytes>,
}

impl WorkRequest {
    pub(crate) fn new(payload_idx: PoolIdx, payload_num: u8, packet_sequence_num: u16) -> Self {
        WorkRequest {
            payload_idx,
            payload_num,
            packet_sequence_num,
            header_block: MemBlock { offset: 0, len: 0 },
            packet_payload_size: 0,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct WorkerState {
    work_pool: Pool<WorkRequest>,
    packetizer: Packetizer,
    next_payload_num: u8,
    current: Option<PoolIdx>,
    batch: Vec<PoolIdx>,
    batch_size: usize,
}

enum WorkerEvent {
    Close,
    Command,
    Completion(SendCompletion),
    NewPayload(PoolIdx),
    KeepAliveTick,
}

/// Transmit payload pipeline for one endpoint.
///
/// Submission happens on application threads; everything downstream runs
/// on the payload worker task, which keeps the work-request pool
/// single-writer. The endpoint manager touches these resources only
/// through `flush`, while the worker is parked in `wait_for_completion`.
pub(crate) struct TxPipeline {
    name: String,
    adapter: Arc<dyn AdapterEndpoint>,
    region: SharedRegion,
    connected: Arc<AtomicBool>,
    payload_tx: mpsc::Sender<PoolIdx>,
    payload_rx: Mutex<mpsc::Receiver<PoolIdx>>,
    completion_rx: Mutex<mpsc::Receiver<SendCompletion>>,
    payload_pool: StdMutex<Pool<TxPayloadState>>,
    worker: Mutex<WorkerState>,
    app_events_tx: mpsc::Sender<AppEvent>,
    stats: Arc<EndpointStats>,
}

impl TxPipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        adapter: Arc<dyn AdapterEndpoint>,
        region: SharedRegion,
        connected: Arc<AtomicBool>,
        completion_rx: mpsc::Receiver<SendCompletion>,
        app_events_tx: mpsc::Sender<AppEvent>,
        stats: Arc<EndpointStats>,
        max_payloads: usize,
    ) -> Arc<Self> {
        let (payload_tx, payload_rx) = mpsc::channel(max_payloads.max(1));
        let packetizer = Packetizer::new(adapter.max_packet_size(), adapter.max_tx_sgl_entries());
        Arc::new(TxPipeline {
            name,
            adapter,
            region,
            connected,
            payload_tx,
            payload_rx: Mutex::new(payload_rx),
            completion_rx: Mutex::new(completion_rx),
            payload_pool: StdMutex::new(Pool::new("tx-payload-state", max_payloads.max(1))),
            worker: Mutex::new(WorkerState {
                work_pool: Pool::new("tx-work-request", WORK_REQUEST_BOUND),
                packetizer,
                next_payload_num: 0,
                current: None,
                batch: Vec::new(),
                batch_size: 1,
            }),
            app_events_tx,
            stats,
        })
    }

    fn lock_payload_pool(&self) -> MutexGuard<'_, Pool<TxPayloadState>> {
        match self.payload_pool.lock() {
            Ok(pool) => pool,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_region(&self) -> MutexGuard<'_, MemRegion> {
        match self.region.lock() {
            Ok(region) => region,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Accepts a payload from the application. Synchronous and lock-light
    /// so it is cheap to call from any thread.
    pub(crate) fn submit(
        &self,
        config: PayloadConfig,
        source_sgl: Sgl,
        max_latency_microsecs: u64,
    ) -> Result<()> {
        self.submit_kind(PayloadKind::Data, config, source_sgl, max_latency_microsecs)
    }

    fn submit_kind(
        &self,
        kind: PayloadKind,
        config: PayloadConfig,
        source_sgl: Sgl,
        max_latency_microsecs: u64,
    ) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ErrNotConnected);
        }
        if config.extra_data.len() > MAX_EXTRA_DATA_SIZE {
            return Err(Error::ErrArraySizeExceeded);
        }
        source_sgl.validate()?;

        let state = TxPayloadState::new(kind, config, source_sgl, max_latency_microsecs);
        let idx = self
            .lock_payload_pool()
            .get(state)
            .ok_or(Error::ErrQueueFull)?;
        if self.payload_tx.try_send(idx).is_err() {
            self.lock_payload_pool().put(idx);
            return Err(Error::ErrQueueFull);
        }
        Ok(())
    }

    /// Payload worker task. Drives the packetizer, matches completions and
    /// parks for the endpoint manager on command signals.
    pub(crate) async fn run_worker(
        self: Arc<Self>,
        mut worker: WorkerHandle,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        loop {
            if worker.has_new_command() {
                worker.wait_for_completion().await;
                continue;
            }

            let busy = { self.worker.lock().await.current.is_some() };
            let event = tokio::select! {
                biased;
                _ = close_rx.recv() => WorkerEvent::Close,
                _ = worker.changed() => WorkerEvent::Command,
                completion = async { self.completion_rx.lock().await.recv().await } => {
                    match completion {
                        Some(completion) => WorkerEvent::Completion(completion),
                        None => WorkerEvent::Close,
                    }
                }
                payload = async { self.payload_rx.lock().await.recv().await }, if !busy => {
                    match payload {
                        Some(idx) => WorkerEvent::NewPayload(idx),
                        None => WorkerEvent::Close,
                    }
                }
                _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => WorkerEvent::KeepAliveTick,
            };

            match event {
                WorkerEvent::Close => return,
                WorkerEvent::Command => {
                    worker.wait_for_completion().await;
                }
                WorkerEvent::Completion(completion) => {
                    {
                        let mut ws = self.worker.lock().await;
                        self.handle_completion(&mut ws, completion).await;
                        loop {
                            let next = { self.completion_rx.lock().await.try_recv() };
                            match next {
                                Ok(completion) => {
                                    self.handle_completion(&mut ws, completion).await
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    self.pump().await;
                }
                WorkerEvent::NewPayload(idx) => {
                    self.begin_payload(idx).await;
                    self.pump().await;
                }
                WorkerEvent::KeepAliveTick => {
                    self.maybe_keep_alive().await;
                }
            }
        }
    }

    /// Payload numbers are assigned here, on the read side of the queue,
    /// so a submission rejected with QueueFull never burns a number.
    async fn begin_payload(&self, idx: PoolIdx) {
        let mut ws = self.worker.lock().await;
        let num = ws.next_payload_num;
        {
            let mut pool = self.lock_payload_pool();
            let Some(payload) = pool.get_mut(idx) else {
                return;
            };
            payload.payload_num = num;
        }
        ws.next_payload_num = num.wrapping_add(1);
        ws.current = Some(idx);
        ws.batch_size = 1;
        ws.batch.clear();
        ws.packetizer.reset();
    }

    /// Packetize-and-send loop: fill the batch, hand it to the adapter,
    /// double the batch, repeat until the payload is fully enqueued or a
    /// pool runs dry.
    async fn pump(&self) {
        loop {
            let (packets, payload_done) = {
                let mut ws = self.worker.lock().await;
                let WorkerState {
                    work_pool,
                    packetizer,
                    current,
                    batch,
                    batch_size,
                    ..
                } = &mut *ws;
                let Some(current_idx) = *current else {
                    return;
                };

                let mut last_queued = false;
                while batch.len() < *batch_size && !last_queued {
                    let status = {
                        let mut pool = self.lock_payload_pool();
                        let Some(payload) = pool.get_mut(current_idx) else {
                            // Flushed out from under us.
                            *current = None;
                            return;
                        };
                        let mut region = self.lock_region();
                        packetizer.next_packet(current_idx, payload, work_pool, &mut region)
                    };
                    match status {
                        Ok(PacketizeStatus::Packet { work_id, last }) => {
                            batch.push(work_id);
                            last_queued = last;
                        }
                        Ok(PacketizeStatus::NotReady) => break,
                        Err(e) => {
                            log::error!("[{}] packetize failed: {}", self.name, e);
                            break;
                        }
                    }
                }

                if batch.is_empty() {
                    return;
                }
                let packets: Vec<TxPacket> = batch
                    .iter()
                    .map(|&work_id| {
                        let request = work_pool
                            .get_ref(work_id)
                            .expect("batched work request is live");
                        TxPacket {
                            work_id,
                            header: request.header_block,
                            payload: request.entries.clone(),
                        }
                    })
                    .collect();
                (packets, last_queued)
            };

            match self.adapter.enqueue_send(packets).await {
                Ok(()) => {
                    let mut ws = self.worker.lock().await;
                    ws.batch.clear();
                    ws.batch_size = (ws.batch_size * 2).min(MAX_BATCH_SIZE);
                    if payload_done {
                        ws.current = None;
                        ws.packetizer.reset();
                        return;
                    }
                }
                Err(Error::ErrNotConnected) => {
                    // The batch stays allocated; a reset will flush it.
                    log::debug!("[{}] send while not connected, parking batch", self.name);
                    return;
                }
                Err(e) => {
                    log::error!("[{}] adapter send failed: {}", self.name, e);
                    return;
                }
            }
        }
    }

    /// Matches one completion to its payload: frees the work request,
    /// accounts the bytes and finishes the payload when everything has
    /// been acknowledged.
    async fn handle_completion(&self, ws: &mut WorkerState, completion: SendCompletion) {
        let Some(request) = ws.work_pool.put(completion.work_id) else {
            return; // reclaimed by a flush
        };
        self.lock_region().free(request.header_block);
        ws.batch.retain(|&id| id != completion.work_id);

        if completion.status == CompletionStatus::NotConnected {
            // The payload will be reported through the flush path.
            return;
        }

        let finished = {
            let mut pool = self.lock_payload_pool();
            match pool.get_mut(request.payload_idx) {
                None => None,
                Some(payload) if payload.payload_num != request.payload_num => {
                    log::warn!(
                        "[{}] dropping completion for stale payload {}",
                        self.name,
                        request.payload_num
                    );
                    None
                }
                Some(payload) => {
                    payload.data_bytes_transferred += request.packet_payload_size;
                    if payload.data_bytes_transferred >= payload.source_sgl.total_data_size() {
                        pool.put(request.payload_idx)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(payload) = finished {
            let elapsed = payload.start.elapsed().as_micros() as u64;
            self.stats.record_payload(
                true,
                elapsed,
                payload.max_latency_microsecs,
                payload.source_sgl.total_data_size() as u64,
            );
            if payload.kind == PayloadKind::Data {
                let result = PayloadResult {
                    status: Status::Ok,
                    payload_user_data: payload.payload_user_data,
                    source_sgl: payload.source_sgl,
                    elapsed_microsecs: elapsed,
                };
                let _ = self.app_events_tx.send(AppEvent::Payload(result)).await;
            }
        }
    }

    /// Invoked by the endpoint manager during Reset and Shutdown, with
    /// every registered worker parked. Guarantees that each submitted
    /// payload still owned by the pipeline produces exactly one SendFailed
    /// callback, in submission order, before the reset completes.
    pub(crate) async fn flush(&self) {
        let mut ws = self.worker.lock().await;

        {
            let mut payload_rx = self.payload_rx.lock().await;
            while payload_rx.try_recv().is_ok() {}
        }
        {
            let mut completion_rx = self.completion_rx.lock().await;
            while completion_rx.try_recv().is_ok() {}
        }

        for work_id in ws.work_pool.in_use_indexes() {
            if let Some(request) = ws.work_pool.put(work_id) {
                self.lock_region().free(request.header_block);
            }
        }

        let mut failed: Vec<TxPayloadState> = {
            let mut pool = self.lock_payload_pool();
            pool.in_use_indexes()
                .into_iter()
                .filter_map(|idx| pool.put(idx))
                .collect()
        };
        failed.sort_by_key(|payload| payload.start);

        ws.current = None;
        ws.batch.clear();
        ws.batch_size = 1;
        ws.next_payload_num = 0;
        ws.packetizer.reset();
        let flushed = failed.len();
        drop(ws);

        for payload in failed {
            let elapsed = payload.start.elapsed().as_micros() as u64;
            self.stats
                .record_payload(false, elapsed, payload.max_latency_microsecs, 0);
            if payload.kind == PayloadKind::Data {
                let result = PayloadResult {
                    status: Status::SendFailed,
                    payload_user_data: payload.payload_user_data,
                    source_sgl: payload.source_sgl,
                    elapsed_microsecs: elapsed,
                };
                let _ = self.app_events_tx.send(AppEvent::Payload(result)).await;
            }
        }
        if flushed > 0 {
            log::debug!("[{}] flushed {} undelivered payloads", self.name, flushed);
        }
    }

    async fn maybe_keep_alive(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let idle = {
            let ws = self.worker.lock().await;
            ws.current.is_none() && ws.work_pool.in_use_count() == 0
        };
        if !idle {
            return;
        }
        if let Err(e) = self.submit_kind(PayloadKind::KeepAlive, PayloadConfig::default(), Sgl::new(), 0)
        {
            log::debug!("[{}] keep-alive submission skipped: {}", self.name, e);
        }
    }

    #[cfg(test)]
    pub(crate) fn payloads_in_flight(&self) -> usize {
        self.lock_payload_pool().in_use_count()
    }
}
