use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use rudp2p::{EndPoint, HandlerRegistration, RudpConfig};
use tracing::{info, Level};

const GREETING: i32 = 1;
const TEXT: i32 = 2;

fn register_handlers(name: &'static str, end_point: &EndPoint) -> Vec<HandlerRegistration> {
    vec![
        end_point.register_handler(GREETING, Arc::new(move |from: SocketAddr, buf: &[u8]| {
            info!("{}: greeting from {:?}: {}", name, from, String::from_utf8_lossy(buf));
        })),
        end_point.register_handler(TEXT, Arc::new(move |from: SocketAddr, buf: &[u8]| {
            let text = String::from_utf8_lossy(buf);
            info!("{}: {} characters of text from {:?}, starting with {:?}", name, text.len(), from, &text[..40.min(text.len())]);
        })),
    ]
}

fn loopback(end_point: &EndPoint) -> anyhow::Result<SocketAddr> {
    let port = end_point.local_addr()
        .ok_or_else(|| anyhow::anyhow!("end point is not running"))?
        .port();
    Ok(SocketAddr::from(([127, 0, 0, 1], port)))
}

/// Starts two endpoints on localhost that exchange a big text message in both directions
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();

    let alice = Arc::new(EndPoint::new(RudpConfig::default())?);
    let bob = Arc::new(EndPoint::new(RudpConfig {
        enable_send_rate_limit: true,
        ..Default::default()
    })?);

    let _alice_handlers = register_handlers("alice", &alice);
    let _bob_handlers = register_handlers("bob", &bob);

    alice.start(0).await?;
    bob.start(0).await?;
    let alice_addr = loopback(&alice)?;
    let bob_addr = loopback(&bob)?;

    alice.send_and_forget(bob_addr, GREETING, b"hello bob".to_vec(), false);
    bob.send_and_forget(alice_addr, GREETING, b"hello alice".to_vec(), false);

    let text = "The quick brown fox jumps over the lazy dog. ".repeat(2_000);
    let (to_bob, to_alice) = tokio::join!(
        alice.send_message(bob_addr, TEXT, text.as_bytes(), true),
        bob.send_message(alice_addr, TEXT, text.as_bytes(), true),
    );
    for outcome in [to_bob?, to_alice?] {
        info!("message {}: {} fragments, {} unacknowledged", outcome.message_id, outcome.fragment_count, outcome.unacknowledged.len());
    }

    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.close().await;
    bob.close().await;
    Ok(())
}
