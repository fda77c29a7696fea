use std::collections::VecDeque;
use std::sync::Mutex as TestMutex;

use async_trait::async_trait;

use super::*;
use crate::adapter::memory::MemRegion;
use crate::adapter::{AdapterEndpoint, PollStatus};
use crate::connection::AppEvent;
use crate::endpoint_manager::{EndpointManager, ManagedEndpoint};
use crate::adapter::EndpointDirection;

use tokio::time::{sleep, timeout};
use wire::PacketHeader;

/// Adapter double: records every packet, optionally completing it on the
/// next poll turn like the socket adapter does.
#[derive(Debug)]
struct MockEndpoint {
    region: SharedRegion,
    completion_tx: mpsc::Sender<SendCompletion>,
    auto_complete: AtomicBool,
    sent: TestMutex<Vec<(PacketHeader, usize)>>,
    pending: TestMutex<VecDeque<SendCompletion>>,
    reset_count: portable_atomic::AtomicUsize,
}

impl MockEndpoint {
    fn new(region: SharedRegion, completion_tx: mpsc::Sender<SendCompletion>) -> Arc<Self> {
        Arc::new(MockEndpoint {
            region,
            completion_tx,
            auto_complete: AtomicBool::new(true),
            sent: TestMutex::new(Vec::new()),
            pending: TestMutex::new(VecDeque::new()),
            reset_count: portable_atomic::AtomicUsize::new(0),
        })
    }

    fn sent_headers(&self) -> Vec<(PacketHeader, usize)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdapterEndpoint for MockEndpoint {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.reset_count.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue_send(&self, batch: Vec<TxPacket>) -> Result<()> {
        for packet in batch {
            let raw = {
                let region = self.region.lock().unwrap();
                Bytes::copy_from_slice(region.slice(&packet.header))
            };
            let header = PacketHeader::unmarshal(&raw).expect("well-formed header");
            let payload_bytes = packet.payload.iter().map(|e| e.len()).sum();
            self.sent.lock().unwrap().push((header, payload_bytes));
            if self.auto_complete.load(Ordering::SeqCst) {
                self.pending.lock().unwrap().push_back(SendCompletion {
                    work_id: packet.work_id,
                    status: CompletionStatus::Ok,
                });
            }
        }
        Ok(())
    }

    async fn poll(&self) -> PollStatus {
        let drained: Vec<SendCompletion> = self.pending.lock().unwrap().drain(..).collect();
        if drained.is_empty() {
            return PollStatus::Idle;
        }
        for completion in drained {
            let _ = self.completion_tx.send(completion).await;
        }
        PollStatus::Work
    }

    fn transmit_queue_level(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn max_packet_size(&self) -> usize {
        1000
    }

    fn max_tx_sgl_entries(&self) -> usize {
        8
    }
}

struct Rig {
    pipeline: Arc<TxPipeline>,
    adapter: Arc<MockEndpoint>,
    manager: Arc<EndpointManager>,
    connected: Arc<AtomicBool>,
    app_events_rx: mpsc::Receiver<AppEvent>,
    close_tx: broadcast::Sender<()>,
}

async fn rig(max_payloads: usize) -> Rig {
    rig_with(max_payloads, true).await
}

async fn rig_with(max_payloads: usize, start_worker: bool) -> Rig {
    let (close_tx, _) = broadcast::channel(8);
    let (app_events_tx, app_events_rx) = mpsc::channel(256);
    let (completion_tx, completion_rx) = mpsc::channel(256);

    let region = MemRegion::shared(64 * 1024, 1024);
    let adapter = MockEndpoint::new(Arc::clone(&region), completion_tx);
    let connected = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(EndpointStats::new());

    let manager = EndpointManager::new("test".to_owned(), app_events_tx.clone());
    let pipeline = TxPipeline::new(
        "test:ep0".to_owned(),
        adapter.clone() as Arc<dyn AdapterEndpoint>,
        region,
        Arc::clone(&connected),
        completion_rx,
        app_events_tx,
        stats,
        max_payloads,
    );

    let endpoint = Arc::new(ManagedEndpoint {
        id: 0,
        name: "test:ep0".to_owned(),
        direction: EndpointDirection::Send,
        remote_addr: "127.0.0.1:9000".parse().unwrap(),
        stream_id: None,
        adapter: adapter.clone() as Arc<dyn AdapterEndpoint>,
        pipeline: Some(Arc::clone(&pipeline)),
        connected: Arc::clone(&connected),
        negotiated_version: std::sync::Mutex::new(None),
        stats: Arc::new(EndpointStats::new()),
    });
    manager.add_endpoint(endpoint).unwrap();

    if start_worker {
        let worker = manager.register("payload-worker");
        tokio::spawn(Arc::clone(&pipeline).run_worker(worker, close_tx.subscribe()));
    }
    tokio::spawn(Arc::clone(&manager).run(close_tx.subscribe()));

    // Stand-in poll worker delivering mock completions.
    let poll_adapter = adapter.clone();
    let mut poll_close = close_tx.subscribe();
    tokio::spawn(async move {
        loop {
            if poll_close.try_recv().is_ok() {
                return;
            }
            if poll_adapter.poll().await == PollStatus::Idle {
                sleep(Duration::from_millis(1)).await;
            }
        }
    });

    Rig {
        pipeline,
        adapter,
        manager,
        connected,
        app_events_rx,
        close_tx,
    }
}

async fn next_payload_result(rx: &mut mpsc::Receiver<AppEvent>) -> PayloadResult {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a payload callback")
            .expect("event channel closed");
        if let AppEvent::Payload(result) = event {
            return result;
        }
    }
}

fn sgl_of(sizes: &[usize]) -> Sgl {
    Sgl::from_entries(
        sizes
            .iter()
            .map(|&size| Bytes::from(vec![0x3Cu8; size]))
            .collect(),
    )
}

#[tokio::test]
async fn test_single_payload_completes_once() {
    let mut rig = rig(8).await;

    rig.pipeline
        .submit(PayloadConfig::default(), sgl_of(&[100]), 16_666)
        .unwrap();

    let result = next_payload_result(&mut rig.app_events_rx).await;
    assert_eq!(result.status, Status::Ok);
    assert_eq!(result.source_sgl.total_data_size(), 100);

    // No second callback arrives for the same payload.
    sleep(Duration::from_millis(50)).await;
    assert!(rig.app_events_rx.try_recv().is_err());
    assert_eq!(rig.pipeline.payloads_in_flight(), 0);

    let sent = rig.adapter.sent_headers();
    assert_eq!(sent.len(), 1);
    assert!(matches!(sent[0].0, PacketHeader::Num0 { .. }));

    let _ = rig.close_tx.send(());
}

#[tokio::test]
async fn test_bytes_accounting_across_packets() {
    let mut rig = rig(8).await;

    // Three packets with the mock's 1000-byte packets.
    rig.pipeline
        .submit(PayloadConfig::default(), sgl_of(&[1500, 500]), 33_000)
        .unwrap();

    let result = next_payload_result(&mut rig.app_events_rx).await;
    assert_eq!(result.status, Status::Ok);

    let sent = rig.adapter.sent_headers();
    let payload_total: usize = sent.iter().map(|(_, bytes)| bytes).sum();
    assert_eq!(payload_total, 2000, "per-packet sizes must sum to the SGL total");

    // Exactly one packet 0 and it is the number-0 variant.
    let zero_packets: Vec<_> = sent
        .iter()
        .filter(|(header, _)| header.common().packet_sequence_num == 0)
        .collect();
    assert_eq!(zero_packets.len(), 1);
    assert!(matches!(zero_packets[0].0, PacketHeader::Num0 { .. }));

    let _ = rig.close_tx.send(());
}

#[tokio::test]
async fn test_payload_numbers_monotonic_mod_256() {
    let mut rig = rig(8).await;

    for index in 0..300usize {
        rig.pipeline
            .submit(PayloadConfig::default(), sgl_of(&[16]), 0)
            .unwrap();
        let result = next_payload_result(&mut rig.app_events_rx).await;
        assert_eq!(result.status, Status::Ok, "payload {index}");
    }

    let sent = rig.adapter.sent_headers();
    assert_eq!(sent.len(), 300);
    for (index, (header, _)) in sent.iter().enumerate() {
        assert_eq!(
            header.common().payload_num,
            (index % 256) as u8,
            "payload number must be monotonic modulo 256"
        );
    }

    let _ = rig.close_tx.send(());
}

#[tokio::test]
async fn test_submit_rejections() {
    let rig = rig(1).await;

    // Not connected.
    rig.connected.store(false, Ordering::SeqCst);
    assert_eq!(
        rig.pipeline.submit(PayloadConfig::default(), sgl_of(&[10]), 0),
        Err(Error::ErrNotConnected)
    );
    rig.connected.store(true, Ordering::SeqCst);

    // Declared total disagrees with the entries.
    let bad_sgl = Sgl::with_total(vec![Bytes::from_static(b"abcd")], 10);
    assert_eq!(
        rig.pipeline.submit(PayloadConfig::default(), bad_sgl, 0),
        Err(Error::ErrSglSizeMismatch)
    );

    // Oversized extra data.
    let config = PayloadConfig {
        extra_data: Bytes::from(vec![0u8; MAX_EXTRA_DATA_SIZE + 1]),
        ..PayloadConfig::default()
    };
    assert_eq!(
        rig.pipeline.submit(config, sgl_of(&[10]), 0),
        Err(Error::ErrArraySizeExceeded)
    );

    let _ = rig.close_tx.send(());
}

#[tokio::test]
async fn test_queue_full_rolls_back_pool_entry() {
    // No worker: the first submission stays queued.
    let rig = rig_with(1, false).await;

    rig.pipeline
        .submit(PayloadConfig::default(), sgl_of(&[10]), 0)
        .unwrap();
    assert_eq!(
        rig.pipeline.submit(PayloadConfig::default(), sgl_of(&[10]), 0),
        Err(Error::ErrQueueFull)
    );

    let _ = rig.close_tx.send(());
}

#[tokio::test]
async fn test_flush_on_reset_fails_pending_payloads_in_order() {
    let mut rig = rig(8).await;

    // Stop completions so payloads stay in flight.
    rig.adapter.auto_complete.store(false, Ordering::SeqCst);

    for user_data in 0..3u64 {
        let config = PayloadConfig {
            payload_user_data: user_data,
            ..PayloadConfig::default()
        };
        rig.pipeline.submit(config, sgl_of(&[64]), 0).unwrap();
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.pipeline.payloads_in_flight(), 3);

    rig.manager.queue_reset(0);

    // Exactly one SendFailed callback per payload, in submission order,
    // delivered before anything else.
    for expected_user_data in 0..3u64 {
        let result = next_payload_result(&mut rig.app_events_rx).await;
        assert_eq!(result.status, Status::SendFailed);
        assert_eq!(result.payload_user_data, expected_user_data);
    }
    assert_eq!(rig.pipeline.payloads_in_flight(), 0);
    assert_eq!(rig.adapter.reset_count.load(Ordering::SeqCst), 1);

    // After the reset the payload numbering restarts from zero.
    rig.adapter.auto_complete.store(true, Ordering::SeqCst);
    let before = rig.adapter.sent_headers().len();
    rig.pipeline
        .submit(PayloadConfig::default(), sgl_of(&[32]), 0)
        .unwrap();
    let result = next_payload_result(&mut rig.app_events_rx).await;
    assert_eq!(result.status, Status::Ok);

    let sent = rig.adapter.sent_headers();
    assert_eq!(sent[before].0.common().payload_num, 0);

    let _ = rig.close_tx.send(());
}

#[tokio::test]
async fn test_keep_alive_suppresses_callback() {
    let mut rig = rig(8).await;

    // Idle past the keep-alive interval.
    sleep(KEEP_ALIVE_INTERVAL + Duration::from_millis(500)).await;

    let sent = rig.adapter.sent_headers();
    assert!(
        sent.iter().any(|(header, _)| {
            header.common().payload_type == wire::PayloadType::KeepAlive
        }),
        "an idle connected endpoint must emit keep-alive payloads"
    );
    assert!(
        rig.app_events_rx.try_recv().is_err(),
        "keep-alive payloads must not reach the application callback"
    );

    let _ = rig.close_tx.send(());
}
