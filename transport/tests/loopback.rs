use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use rudp2p::{EndPoint, RudpConfig, TransportError};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn loopback(end_point: &EndPoint) -> SocketAddr {
    let port = end_point.local_addr().unwrap().port();
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn collecting_handler(end_point: &EndPoint, routing_key: i32) -> (rudp2p::HandlerRegistration, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registration = end_point.register_handler(routing_key, Arc::new(move |from: SocketAddr, buf: &[u8]| {
        let _ = tx.send((from, buf.to_vec()));
    }));
    (registration, rx)
}

#[tokio::test]
async fn test_reliable_round_trip() {
    let sender = EndPoint::new(RudpConfig::default()).unwrap();
    let receiver = EndPoint::new(RudpConfig::default()).unwrap();
    let (_registration, mut received) = collecting_handler(&receiver, 7);

    sender.start(0).await.unwrap();
    receiver.start(0).await.unwrap();

    let payload = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let outcome = sender.send_message(loopback(&receiver), 7, &payload, true).await.unwrap();
    assert_eq!(outcome.fragment_count, 8);
    assert!(outcome.is_fully_acknowledged());

    let (from, msg) = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(from.port(), sender.local_addr().unwrap().port());
    assert_eq!(msg, payload);

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn test_rate_limited_round_trip() {
    let config = RudpConfig {
        enable_send_rate_limit: true,
        send_bucket_byte_size: 20_000,
        send_bucket_refill_rate_per_sec: 200_000,
        ..Default::default()
    };
    let sender = EndPoint::new(config).unwrap();
    let receiver = EndPoint::new(RudpConfig::default()).unwrap();
    let (_registration, mut received) = collecting_handler(&receiver, 1);

    sender.start(0).await.unwrap();
    receiver.start(0).await.unwrap();

    let payload = vec![42u8; 50_000];
    let outcome = sender.send_message(loopback(&receiver), 1, &payload, true).await.unwrap();
    assert!(outcome.is_fully_acknowledged());

    let (_, msg) = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(msg, payload);
}

#[tokio::test]
async fn test_lifecycle() {
    let end_point = EndPoint::new(RudpConfig::default()).unwrap();

    end_point.start(0).await.unwrap();
    let first_addr = end_point.local_addr().unwrap();
    assert!(matches!(end_point.start(0).await, Err(TransportError::AlreadyStarted)));
    assert_eq!(end_point.local_addr(), Some(first_addr));

    end_point.close().await;
    end_point.close().await;
    assert!(!end_point.is_running());
    assert!(matches!(end_point.send_message(first_addr, 1, &[1], false).await, Err(TransportError::NotStarted)));

    end_point.start(0).await.unwrap();
    assert!(end_point.is_running());
}

#[tokio::test]
async fn test_bind_error() {
    let first = EndPoint::new(RudpConfig::default()).unwrap();
    first.start(0).await.unwrap();
    let port = first.local_addr().unwrap().port();

    let second = EndPoint::new(RudpConfig::default()).unwrap();
    match second.start(port).await {
        Err(TransportError::Bind { port: p, .. }) => assert_eq!(p, port),
        other => panic!("expected bind error, was {:?}", other),
    }
    assert!(!second.is_running());
}

#[tokio::test]
async fn test_send_and_forget() {
    let sender = Arc::new(EndPoint::new(RudpConfig::default()).unwrap());
    let receiver = EndPoint::new(RudpConfig::default()).unwrap();
    let (_registration, mut received) = collecting_handler(&receiver, 3);

    sender.start(0).await.unwrap();
    receiver.start(0).await.unwrap();

    sender.send_and_forget(loopback(&receiver), 3, vec![1, 2, 3], true);

    let (_, msg) = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(msg, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_oversized_message() {
    let end_point = EndPoint::new(RudpConfig { mtu: 20, ..Default::default() }).unwrap();
    end_point.start(0).await.unwrap();

    let payload = vec![0u8; 8 * 65535 + 1];
    let result = end_point.send_message(loopback(&end_point), 1, &payload, true).await;
    assert!(matches!(result, Err(TransportError::PayloadTooLarge { .. })));
}

#[tokio::test]
async fn test_restart_on_same_port() {
    let end_point = EndPoint::new(RudpConfig::default()).unwrap();
    end_point.start(0).await.unwrap();
    let port = end_point.local_addr().unwrap().port();

    end_point.close().await;
    end_point.start(port).await.unwrap();
    assert_eq!(end_point.local_addr().unwrap().port(), port);

    // the restarted endpoint is fully functional
    let (_registration, mut received) = collecting_handler(&end_point, 2);
    end_point.send_message(loopback(&end_point), 2, &[4, 5, 6], true).await.unwrap();
    let (_, msg) = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    assert_eq!(msg, vec![4, 5, 6]);

    end_point.close().await;
}

#[tokio::test]
async fn test_port_is_free_after_close() {
    let first = EndPoint::new(RudpConfig::default()).unwrap();
    first.start(0).await.unwrap();
    let port = first.local_addr().unwrap().port();
    first.close().await;

    let second = EndPoint::new(RudpConfig::default()).unwrap();
    second.start(port).await.unwrap();
    assert_eq!(second.local_addr().unwrap().port(), port);
    second.close().await;
}

#[tokio::test]
async fn test_close_during_reliable_send() {
    let config = RudpConfig {
        reliable_retry_interval: Duration::from_secs(1),
        ..Default::default()
    };
    let end_point = EndPoint::new(config).unwrap();
    end_point.start(0).await.unwrap();
    let port = end_point.local_addr().unwrap().port();

    // never acknowledges anything
    let silent_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent_peer.local_addr().unwrap();

    let (result, _) = tokio::join!(
        end_point.send_message(silent_addr, 1, &[1, 2, 3], true),
        async {
            sleep(Duration::from_millis(100)).await;
            end_point.close().await;
        },
    );
    assert!(matches!(result, Err(TransportError::Closed)));
    assert!(!end_point.is_running());

    let rebound = EndPoint::new(RudpConfig::default()).unwrap();
    rebound.start(port).await.unwrap();
    rebound.close().await;
}
