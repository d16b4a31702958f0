//! End-to-end tests for the hub: the room API, the password gate, and
//! point-to-point frame forwarding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use clouddrop_core::constants::CLOSE_PASSWORD_INCORRECT;
use clouddrop_core::crypto::hash_password_for_server;
use clouddrop_core::room::RoomCode;
use clouddrop_hub::Hub;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn start_hub() -> SocketAddr {
    let hub = Hub::new(Hub::default_ice_servers());
    let (addr, server) = hub.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    tokio::spawn(server);
    addr
}

async fn ws_connect(addr: SocketAddr, query: &str) -> WsStream {
    let url = format!("ws://{addr}/ws{query}");
    let (ws, _) = connect_async(&url).await.expect("ws connect");
    ws
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        match ws.next().await.expect("stream open").expect("frame") {
            Message::Text(text) => return serde_json::from_str(&text).expect("json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

/// Join a room and return (socket, issued peer id).
async fn join(addr: SocketAddr, room: &str, name: &str) -> (WsStream, String) {
    let mut ws = ws_connect(addr, &format!("?room={room}")).await;
    send_json(
        &mut ws,
        json!({"type": "join", "name": name, "deviceType": "desktop", "browserInfo": "test"}),
    )
    .await;
    let joined = recv_json(&mut ws).await;
    assert_eq!(joined["type"], "joined");
    assert_eq!(joined["roomCode"], room);
    let peer_id = joined["peerId"].as_str().expect("peerId").to_string();
    (ws, peer_id)
}

#[tokio::test]
async fn ice_servers_endpoint() {
    let addr = start_hub();
    let body: Value = reqwest::get(format!("http://{addr}/api/ice-servers"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let servers = body["iceServers"].as_array().expect("iceServers array");
    assert!(!servers.is_empty());
    assert!(servers[0]["urls"][0].as_str().unwrap().starts_with("stun:"));
}

#[tokio::test]
async fn set_password_is_immutable() {
    let addr = start_hub();
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/room/set-password?room=SECUR3");
    let hash_a = "a".repeat(64);
    let hash_b = "b".repeat(64);

    let first: Value = client
        .post(&url)
        .json(&json!({"passwordHash": hash_a}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["success"], true);

    let second: Value = client
        .post(&url)
        .json(&json!({"passwordHash": hash_b}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["success"], false);

    let check: Value = client
        .get(format!("http://{addr}/api/room/check-password?room=SECUR3"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check["hasPassword"], true);
}

#[tokio::test]
async fn wrong_password_is_rejected_with_close_4002() {
    let addr = start_hub();
    let room = RoomCode::parse("SECUR3").unwrap();
    let good_hash = hash_password_for_server("correct-horse", &room);
    let bad_hash = hash_password_for_server("wrong-battery", &room);

    let client = reqwest::Client::new();
    let resp: Value = client
        .post(format!("http://{addr}/api/room/set-password?room=SECUR3"))
        .json(&json!({"passwordHash": good_hash}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);

    // An existing member must not observe any peer-joined broadcast from
    // the rejected attempt.
    let (mut member, _) = {
        let mut ws = ws_connect(addr, &format!("?room=SECUR3&passwordHash={good_hash}")).await;
        send_json(
            &mut ws,
            json!({"type": "join", "name": "insider", "deviceType": "desktop", "browserInfo": "t"}),
        )
        .await;
        let joined = recv_json(&mut ws).await;
        let id = joined["peerId"].as_str().unwrap().to_string();
        (ws, id)
    };

    let mut rejected = ws_connect(addr, &format!("?room=SECUR3&passwordHash={bad_hash}")).await;
    let error = recv_json(&mut rejected).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"], "PASSWORD_INCORRECT");
    match rejected.next().await.expect("close frame").expect("frame") {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), CLOSE_PASSWORD_INCORRECT);
        }
        other => panic!("expected close, got {other:?}"),
    }

    // Missing hash entirely: error then close 4001.
    let mut missing = ws_connect(addr, "?room=SECUR3").await;
    let error = recv_json(&mut missing).await;
    assert_eq!(error["error"], "PASSWORD_REQUIRED");

    // The insider saw nothing.
    send_json(&mut member, json!({"type": "ping"})).await;
    let reply = recv_json(&mut member).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn join_flow_and_membership_broadcast() {
    let addr = start_hub();
    let (mut alice, alice_id) = join(addr, "ABC234", "alice").await;
    let (mut bob, bob_id) = join(addr, "ABC234", "bob").await;
    assert_ne!(alice_id, bob_id);

    // Alice sees bob join.
    let announce = recv_json(&mut alice).await;
    assert_eq!(announce["type"], "peer-joined");
    assert_eq!(announce["peer"]["id"], bob_id.as_str());
    assert_eq!(announce["peer"]["name"], "bob");

    // Bob's joined reply listed alice.
    drop(bob.close(None).await);

    // Alice sees bob leave.
    let farewell = recv_json(&mut alice).await;
    assert_eq!(farewell["type"], "peer-left");
    assert_eq!(farewell["peerId"], bob_id.as_str());
}

#[tokio::test]
async fn addressed_frames_reach_only_the_addressee() {
    let addr = start_hub();
    let (mut alice, alice_id) = join(addr, "ABC234", "alice").await;
    let (mut bob, bob_id) = join(addr, "ABC234", "bob").await;
    let (mut carol, _carol_id) = join(addr, "ABC234", "carol").await;

    // Drain membership broadcasts.
    let _ = recv_json(&mut alice).await; // bob joined
    let _ = recv_json(&mut alice).await; // carol joined
    let _ = recv_json(&mut bob).await; // carol joined

    send_json(
        &mut alice,
        json!({"type": "key-exchange", "to": bob_id, "publicKey": "KEYDATA"}),
    )
    .await;

    let delivered = recv_json(&mut bob).await;
    assert_eq!(delivered["type"], "key-exchange");
    assert_eq!(delivered["publicKey"], "KEYDATA");
    // The hub fills in the sender.
    assert_eq!(delivered["from"], alice_id.as_str());

    // Carol must see nothing but her own pong.
    send_json(&mut carol, json!({"type": "ping"})).await;
    let next = recv_json(&mut carol).await;
    assert_eq!(next["type"], "pong");
}

#[tokio::test]
async fn relay_data_is_forwarded_opaquely() {
    let addr = start_hub();
    let (mut alice, _) = join(addr, "ABC234", "alice").await;
    let (mut bob, bob_id) = join(addr, "ABC234", "bob").await;
    let _ = recv_json(&mut alice).await; // bob joined

    let chunk = json!({
        "type": "relay-data",
        "to": bob_id,
        "data": {"type": "chunk", "fileId": "8c2f04f2-4e9f-4c7d-9d5e-0a9b27f95c11",
                 "index": 5, "data": "QUJDRA==", "retry": true}
    });
    send_json(&mut alice, chunk).await;

    let delivered = recv_json(&mut bob).await;
    assert_eq!(delivered["type"], "relay-data");
    assert_eq!(delivered["data"]["index"], 5);
    assert_eq!(delivered["data"]["retry"], true);
    assert_eq!(delivered["data"]["data"], "QUJDRA==");
}

#[tokio::test]
async fn name_change_updates_and_broadcasts() {
    let addr = start_hub();
    let (mut alice, _) = join(addr, "ABC234", "alice").await;
    let (mut bob, bob_id) = join(addr, "ABC234", "bob").await;
    let _ = recv_json(&mut alice).await; // bob joined

    send_json(&mut bob, json!({"type": "name-changed", "name": "robert"})).await;
    let update = recv_json(&mut alice).await;
    assert_eq!(update["type"], "name-changed");
    assert_eq!(update["name"], "robert");
    assert_eq!(update["from"], bob_id.as_str());
}
