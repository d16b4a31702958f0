//! Per-client WebSocket session handling.
//!
//! Each accepted socket runs one session task: password gate, then a read
//! loop that answers keep-alives, handles `join`/`name-changed` locally,
//! and forwards every frame carrying a `to` field verbatim (with `from`
//! injected) to exactly the addressed peer. The hub never inspects
//! forwarded payloads.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::ws::{Message, WebSocket};

use clouddrop_core::constants::{CLOSE_PASSWORD_INCORRECT, CLOSE_PASSWORD_REQUIRED};
use clouddrop_core::protocol::{ErrorCode, FramePayload, PeerId, PeerInfo, SignalFrame};
use clouddrop_core::room::RoomCode;

use crate::room::{Participant, RoomRegistry};

/// Query parameters of the `/ws` upgrade.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub room: Option<String>,
    pub password_hash: Option<String>,
}

/// Resolve the session's room: an explicit code when supplied, otherwise
/// the deterministic network-derived code for the client address.
fn resolve_room(query_room: Option<&str>, addr: Option<SocketAddr>) -> Result<String, String> {
    if let Some(code) = query_room {
        let canonical = code.trim().to_ascii_uppercase();
        // Derived codes are hex-shaped and bypass the entry alphabet, so the
        // gate here is only shape: six alphanumeric characters.
        if canonical.len() == 6 && canonical.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Ok(canonical);
        }
        return Err(format!("invalid room code: {code}"));
    }
    let ip = addr
        .map(|a| a.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    Ok(RoomCode::from_network(ip).as_str().to_string())
}

/// Drive one client session to completion.
pub async fn run_session(
    ws: WebSocket,
    query: WsQuery,
    addr: Option<SocketAddr>,
    registry: Arc<RoomRegistry>,
) {
    let (mut sink, mut stream) = ws.split();

    let room = match resolve_room(query.room.as_deref(), addr) {
        Ok(room) => room,
        Err(reason) => {
            debug!(%reason, "rejecting session");
            let _ = sink.close().await;
            return;
        }
    };

    // Password gate. A room without a stored hash accepts any joiner.
    if let Some(stored) = registry.password_hash(&room).await {
        let rejection = match query.password_hash.as_deref() {
            None => Some((ErrorCode::PasswordRequired, CLOSE_PASSWORD_REQUIRED)),
            Some(supplied) if supplied != stored => {
                Some((ErrorCode::PasswordIncorrect, CLOSE_PASSWORD_INCORRECT))
            }
            Some(_) => None,
        };
        if let Some((code, close_code)) = rejection {
            warn!(room = %room, ?code, "password gate rejected session");
            let error_frame = SignalFrame::local(FramePayload::Error { error: code });
            if let Ok(text) = error_frame.encode() {
                let _ = sink.send(Message::text(text)).await;
            }
            let reason = match code {
                ErrorCode::PasswordRequired => "PASSWORD_REQUIRED",
                ErrorCode::PasswordIncorrect => "PASSWORD_INCORRECT",
            };
            let _ = sink.send(Message::close_with(close_code, reason)).await;
            return;
        }
    }

    let peer_id = PeerId::generate();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: the outbound queue serializes all writes to this socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    info!(room = %room, %peer_id, "session accepted");
    let mut joined = false;

    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!(room = %room, %peer_id, "socket error: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        let Ok(text) = msg.to_str() else {
            debug!(room = %room, %peer_id, "ignoring non-text frame");
            continue;
        };

        let Ok(mut value) = serde_json::from_str::<Value>(text) else {
            debug!(room = %room, %peer_id, "ignoring unparseable frame");
            continue;
        };

        // Addressed frames are forwarded verbatim, `from` filled in. The
        // payload is never inspected.
        if value.get("to").is_some() {
            if !joined {
                debug!(room = %room, %peer_id, "dropping forward from unjoined session");
                continue;
            }
            let Some(to) = value.get("to").and_then(Value::as_str).map(PeerId::from) else {
                continue;
            };
            if let Value::Object(map) = &mut value {
                map.insert("from".into(), json!(peer_id));
            }
            match registry.sender_to(&room, &to).await {
                Some(sender) => {
                    let _ = sender.send(Message::text(value.to_string()));
                }
                None => debug!(room = %room, %to, "dropping frame for unknown peer"),
            }
            continue;
        }

        // Everything else is handled locally.
        let frame = match serde_json::from_value::<SignalFrame>(value) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(room = %room, %peer_id, "ignoring unknown frame: {e}");
                continue;
            }
        };
        match frame.payload {
            FramePayload::Join {
                name,
                device_type,
                browser_info,
            } => {
                let info = PeerInfo {
                    id: peer_id.clone(),
                    name,
                    device_type,
                    browser_info,
                };
                let existing = registry
                    .join(
                        &room,
                        Participant {
                            info: info.clone(),
                            sender: tx.clone(),
                        },
                    )
                    .await;
                joined = true;

                let reply = SignalFrame::local(FramePayload::Joined {
                    peer_id: peer_id.clone(),
                    room_code: room.clone(),
                    peers: existing,
                });
                send_frame(&tx, &reply);

                let announce = SignalFrame::local(FramePayload::PeerJoined { peer: info });
                broadcast(&registry, &room, &peer_id, &announce).await;
            }
            FramePayload::NameChanged { name } => {
                if let Some(info) = registry.rename(&room, &peer_id, name.clone()).await {
                    debug!(room = %room, %peer_id, name = %info.name, "attachment renamed");
                    let mut update = SignalFrame::local(FramePayload::NameChanged { name });
                    update.from = Some(peer_id.clone());
                    broadcast(&registry, &room, &peer_id, &update).await;
                }
            }
            FramePayload::Ping => {
                send_frame(&tx, &SignalFrame::local(FramePayload::Pong));
            }
            other => {
                debug!(room = %room, %peer_id, "ignoring unaddressed frame: {other:?}");
            }
        }
    }

    if joined {
        registry.leave(&room, &peer_id).await;
        let farewell = SignalFrame::local(FramePayload::PeerLeft {
            peer_id: peer_id.clone(),
        });
        broadcast(&registry, &room, &peer_id, &farewell).await;
    }
    info!(room = %room, %peer_id, "session closed");
    drop(tx);
    let _ = writer.await;
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &SignalFrame) {
    if let Ok(text) = frame.encode() {
        let _ = tx.send(Message::text(text));
    }
}

async fn broadcast(registry: &RoomRegistry, room: &str, exclude: &PeerId, frame: &SignalFrame) {
    let Ok(text) = frame.encode() else { return };
    for sender in registry.senders_except(room, exclude).await {
        let _ = sender.send(Message::text(text.clone()));
    }
}
