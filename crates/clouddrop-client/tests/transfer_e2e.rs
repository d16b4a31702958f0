//! End-to-end transfer tests: two clients joined through an in-process hub.
//!
//! The engine races direct establishment against the relay fallback; these
//! tests assert the observable contract only (bytes round-trip intact)
//! and stay agnostic about which path won the race.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use clouddrop_client::{Client, ClientConfig, Event};
use clouddrop_core::protocol::{DeviceClass, PeerId};
use clouddrop_hub::Hub;

const EVENT_WAIT: Duration = Duration::from_secs(30);
const TRANSFER_WAIT: Duration = Duration::from_secs(60);

fn start_hub() -> SocketAddr {
    let hub = Hub::new(Hub::default_ice_servers());
    let (addr, server) = hub.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    tokio::spawn(server);
    addr
}

fn config(addr: SocketAddr, name: &str) -> ClientConfig {
    ClientConfig {
        hub_url: format!("ws://{addr}"),
        display_name: name.into(),
        device_class: DeviceClass::Desktop,
        browser_info: "integration test".into(),
        room: Some("ABC234".into()),
        password: None,
        strict_integrity: false,
        // Keep connection attempts tied to transfers for determinism.
        prewarm: false,
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn wait_joined(rx: &mut mpsc::UnboundedReceiver<Event>) -> PeerId {
    loop {
        if let Event::RoomJoined { local_id, .. } = next_event(rx).await {
            return local_id;
        }
    }
}

async fn wait_peer_joined(rx: &mut mpsc::UnboundedReceiver<Event>) -> PeerId {
    loop {
        if let Event::PeerJoined { peer } = next_event(rx).await {
            return peer.id;
        }
    }
}

/// Drain a receiver's events forever, answering every file request with
/// `accept` and forwarding received files to `files_tx`.
fn auto_responder(
    mut rx: mpsc::UnboundedReceiver<Event>,
    accept: bool,
    files_tx: mpsc::UnboundedSender<(String, String, Bytes, Vec<u32>)>,
    texts_tx: mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::FileRequest { respond, .. } => {
                    let _ = respond.send(accept);
                }
                Event::FileReceived {
                    file_name,
                    mime_type,
                    bytes,
                    missing,
                    ..
                } => {
                    let _ = files_tx.send((file_name, mime_type, bytes, missing));
                }
                Event::TextReceived { text, .. } => {
                    let _ = texts_tx.send(text);
                }
                _ => {}
            }
        }
    });
}

struct Pair {
    sender: Client,
    _receiver: Client,
    receiver_id: PeerId,
    files: mpsc::UnboundedReceiver<(String, String, Bytes, Vec<u32>)>,
    texts: mpsc::UnboundedReceiver<String>,
}

/// Bring up a hub and two joined clients; the receiver auto-answers
/// requests with `accept`.
async fn joined_pair(accept: bool) -> Pair {
    let addr = start_hub();

    let mut sender = Client::connect(config(addr, "sender")).unwrap();
    let mut sender_events = sender.events();
    wait_joined(&mut sender_events).await;

    let mut receiver = Client::connect(config(addr, "receiver")).unwrap();
    let mut receiver_events = receiver.events();
    wait_joined(&mut receiver_events).await;

    let receiver_id = wait_peer_joined(&mut sender_events).await;

    // Keep draining the sender's events so nothing backs up.
    tokio::spawn(async move { while sender_events.recv().await.is_some() {} });

    let (files_tx, files) = mpsc::unbounded_channel();
    let (texts_tx, texts) = mpsc::unbounded_channel();
    auto_responder(receiver_events, accept, files_tx, texts_tx);

    Pair {
        sender,
        _receiver: receiver,
        receiver_id,
        files,
        texts,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn file_round_trips_intact() {
    let mut pair = joined_pair(true).await;

    // 100 KiB: two chunks, the second short.
    let payload: Vec<u8> = (0..102_400u32).map(|i| (i % 251) as u8).collect();
    let handle = pair
        .sender
        .send_file(
            &pair.receiver_id,
            "hello.bin",
            "application/octet-stream",
            Bytes::from(payload.clone()),
        )
        .await
        .unwrap();

    timeout(TRANSFER_WAIT, handle.finished())
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    let (name, mime, bytes, missing) = timeout(EVENT_WAIT, pair.files.recv())
        .await
        .expect("no file delivered")
        .unwrap();
    assert_eq!(name, "hello.bin");
    assert_eq!(mime, "application/octet-stream");
    assert_eq!(bytes.len(), 102_400);
    assert_eq!(&bytes[..], &payload[..]);
    assert!(missing.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_file_round_trips() {
    let mut pair = joined_pair(true).await;

    let handle = pair
        .sender
        .send_file(
            &pair.receiver_id,
            "empty.bin",
            "application/octet-stream",
            Bytes::new(),
        )
        .await
        .unwrap();
    timeout(TRANSFER_WAIT, handle.finished())
        .await
        .expect("transfer timed out")
        .expect("transfer failed");

    let (name, _, bytes, missing) = timeout(EVENT_WAIT, pair.files.recv())
        .await
        .expect("no file delivered")
        .unwrap();
    assert_eq!(name, "empty.bin");
    assert!(bytes.is_empty());
    assert!(missing.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn declined_request_fails_the_send() {
    let pair = joined_pair(false).await;

    let handle = pair
        .sender
        .send_file(
            &pair.receiver_id,
            "unwanted.bin",
            "application/octet-stream",
            Bytes::from_static(b"nope"),
        )
        .await
        .unwrap();

    let result = timeout(TRANSFER_WAIT, handle.finished())
        .await
        .expect("transfer timed out");
    assert!(matches!(
        result,
        Err(clouddrop_core::Error::PeerDeclined)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn text_message_round_trips() {
    let mut pair = joined_pair(true).await;

    timeout(
        TRANSFER_WAIT,
        pair.sender.send_text(&pair.receiver_id, "hello over there"),
    )
    .await
    .expect("text timed out")
    .expect("text failed");

    let text = timeout(EVENT_WAIT, pair.texts.recv())
        .await
        .expect("no text delivered")
        .unwrap();
    assert_eq!(text, "hello over there");
}
