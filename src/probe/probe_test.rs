use super::*;

use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

#[test]
fn test_packet_num_tracker_reordered_stream() {
    // Out-of-order arrival taken from a captured reorder-heavy run; every
    // number must be accepted exactly once and nothing may dangle.
    let sequence = [2u16, 0, 1, 6, 7, 4, 3, 5, 8, 10, 12, 11, 9, 15, 14, 13];

    let mut tracker = PacketNumTracker::new();
    let mut fresh = 0;
    for num in sequence {
        if tracker.observe(num) {
            fresh += 1;
        }
    }
    assert_eq!(fresh, sequence.len(), "no packet may be dropped");
    assert_eq!(tracker.len(), sequence.len());

    for num in sequence {
        assert!(!tracker.observe(num), "{num} must be seen as a duplicate");
    }
}

#[test]
fn test_packet_num_tracker_window_bounded() {
    let mut tracker = PacketNumTracker::new();
    for num in 0..10_000u16 {
        assert!(tracker.observe(num ^ 0x5A5A));
        assert!(tracker.len() <= 64);
    }
}

async fn probe_pair() -> (
    Arc<ProbeEndpoint>,
    Arc<ProbeEndpoint>,
    mpsc::Receiver<ProbeEvent>,
    mpsc::Receiver<ProbeEvent>,
    broadcast::Sender<()>,
) {
    let (close_tx, _close_keep) = broadcast::channel(8);

    let rx_control = ControlInterface::bind("rx".to_owned(), "127.0.0.1", 0)
        .await
        .unwrap();
    let tx_control = ControlInterface::bind("tx".to_owned(), "127.0.0.1", 0)
        .await
        .unwrap();

    let rx_addr: SocketAddr = format!("127.0.0.1:{}", rx_control.local_port())
        .parse()
        .unwrap();
    let tx_addr: SocketAddr = format!("127.0.0.1:{}", tx_control.local_port())
        .parse()
        .unwrap();

    let (tx_events_tx, tx_events_rx) = mpsc::channel(16);
    let (rx_events_tx, rx_events_rx) = mpsc::channel(16);

    let tx_probe = ProbeEndpoint::new(
        "tx".to_owned(),
        ProbeRole::Transmitter,
        Arc::clone(&tx_control),
        rx_addr,
        "127.0.0.1".to_owned(),
        "stream-0".to_owned(),
        0,
        Arc::new(EndpointStats::new()),
        tx_events_tx,
    );
    let rx_probe = ProbeEndpoint::new(
        "rx".to_owned(),
        ProbeRole::Receiver,
        Arc::clone(&rx_control),
        tx_addr,
        "127.0.0.1".to_owned(),
        "stream-0".to_owned(),
        0,
        Arc::new(EndpointStats::new()),
        rx_events_tx,
    );

    let (tx_probe_tx, tx_probe_rx) = mpsc::channel(16);
    let (rx_probe_tx, rx_probe_rx) = mpsc::channel(16);
    tx_control.spawn_receiver(tx_probe_tx, close_tx.subscribe());
    rx_control.spawn_receiver(rx_probe_tx, close_tx.subscribe());

    tokio::spawn(Arc::clone(&tx_probe).run(tx_probe_rx, close_tx.subscribe()));
    tokio::spawn(Arc::clone(&rx_probe).run(rx_probe_rx, close_tx.subscribe()));

    (tx_probe, rx_probe, tx_events_rx, rx_events_rx, close_tx)
}

#[tokio::test]
async fn test_handshake_connects_both_sides() {
    let (tx_probe, rx_probe, mut tx_events, mut rx_events, close_tx) = probe_pair().await;

    let tx_event = timeout(Duration::from_secs(5), tx_events.recv())
        .await
        .expect("transmitter never connected")
        .unwrap();
    let rx_event = timeout(Duration::from_secs(5), rx_events.recv())
        .await
        .expect("receiver never connected")
        .unwrap();

    let expected = ProbeEvent::Connected {
        version: PROTOCOL_VERSION,
    };
    assert_eq!(tx_event, expected);
    assert_eq!(rx_event, expected);
    assert_eq!(tx_probe.state(), ProbeState::Connected);
    assert_eq!(rx_probe.state(), ProbeState::Connected);
    assert_eq!(tx_probe.negotiated_version(), Some(PROTOCOL_VERSION));
    assert_eq!(rx_probe.negotiated_version(), Some(PROTOCOL_VERSION));

    let _ = close_tx.send(());
}

#[tokio::test]
async fn test_transmitter_retries_without_peer() {
    let (close_tx, _close_keep) = broadcast::channel(8);
    let control = ControlInterface::bind("lonely".to_owned(), "127.0.0.1", 0)
        .await
        .unwrap();
    // Point at a port nobody listens on.
    let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let stats = Arc::new(EndpointStats::new());
    let probe = ProbeEndpoint::new(
        "lonely".to_owned(),
        ProbeRole::Transmitter,
        control,
        remote,
        "127.0.0.1".to_owned(),
        "stream-0".to_owned(),
        0,
        Arc::clone(&stats),
        events_tx,
    );

    let (_probe_tx, probe_rx) = mpsc::channel(16);
    tokio::spawn(Arc::clone(&probe).run(probe_rx, close_tx.subscribe()));

    // Retries exhaust and the handshake restarts, reporting Disconnected.
    let event = timeout(Duration::from_secs(10), events_rx.recv())
        .await
        .expect("no disconnect event")
        .unwrap();
    assert_eq!(event, ProbeEvent::Disconnected);
    assert!(stats.snapshot().probe_retries >= PROBE_MAX_RETRIES as u64);

    let _ = close_tx.send(());
}
