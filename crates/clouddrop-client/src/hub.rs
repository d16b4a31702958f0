//! The client's hub session.
//!
//! One background task owns the signaling socket. Outbound frames funnel
//! through an unbounded queue (serializing writes); inbound frames are
//! dispatched to the client, which routes per-peer traffic into the peer
//! actors. On transport loss every peer is discarded and the session
//! reconnects after a delay; a password rejection stops the loop and hands
//! control back to the user.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use clouddrop_core::constants::{
    CLOSE_PASSWORD_INCORRECT, CLOSE_PASSWORD_REQUIRED, HUB_PING_INTERVAL, HUB_RECONNECT_DELAY,
};
use clouddrop_core::crypto::hash_password_for_server;
use clouddrop_core::protocol::{FramePayload, SignalFrame};
use clouddrop_core::room::RoomCode;
use clouddrop_core::{Error, Result};

use crate::client::Shared;

/// Clonable handle for queueing frames to the hub.
#[derive(Clone)]
pub(crate) struct HubHandle {
    tx: mpsc::UnboundedSender<SignalFrame>,
}

impl HubHandle {
    pub fn send(&self, frame: SignalFrame) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::NetworkDisconnected)
    }
}

/// Create the outbound queue before the session task exists, so peer actors
/// can hold the handle from the start.
pub(crate) fn channel() -> (HubHandle, mpsc::UnboundedReceiver<SignalFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HubHandle { tx }, rx)
}

fn build_ws_url(shared: &Shared) -> String {
    let base = shared.config.hub_url.trim_end_matches('/');
    let mut url = format!("{base}/ws");
    let mut sep = '?';
    if let Some(room) = &shared.config.room {
        url.push(sep);
        url.push_str(&format!("room={room}"));
        sep = '&';
        if let Some(password) = &shared.config.password {
            if let Ok(code) = RoomCode::parse(room) {
                url.push(sep);
                url.push_str(&format!(
                    "passwordHash={}",
                    hash_password_for_server(password, &code)
                ));
            }
        }
    }
    url
}

/// Run the hub session until shutdown or a password rejection.
pub(crate) async fn run_session(
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<SignalFrame>,
) {
    loop {
        // Frames queued while we were down address peers of a dead session.
        while outbound.try_recv().is_ok() {}

        let url = build_ws_url(&shared);
        let ws = match connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!("hub connect failed: {e}");
                sleep(HUB_RECONNECT_DELAY).await;
                continue;
            }
        };
        info!("hub connected");
        let (mut sink, mut stream) = ws.split();

        let join = SignalFrame::local(FramePayload::Join {
            name: shared.config.display_name.clone(),
            device_type: shared.config.device_class,
            browser_info: shared.config.browser_info.clone(),
        });
        let joined = match join.encode() {
            Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
            Err(_) => false,
        };
        if !joined {
            sleep(HUB_RECONNECT_DELAY).await;
            continue;
        }

        let mut keepalive = tokio::time::interval(HUB_PING_INTERVAL);
        keepalive.reset(); // no ping before the first interval elapses

        let mut password_rejected = false;
        loop {
            tokio::select! {
                maybe = outbound.recv() => match maybe {
                    Some(frame) => {
                        let Ok(text) = frame.encode() else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // The client was dropped; end the session.
                    None => {
                        let _ = sink.close().await;
                        return;
                    }
                },
                _ = keepalive.tick() => {
                    if let Ok(text) = SignalFrame::local(FramePayload::Ping).encode() {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                },
                item = stream.next() => match item {
                    Some(Ok(Message::Text(text))) => shared.dispatch(&text).await,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            let code = u16::from(frame.code);
                            if code == CLOSE_PASSWORD_REQUIRED || code == CLOSE_PASSWORD_INCORRECT {
                                shared.handle_password_rejection(code).await;
                                password_rejected = true;
                            }
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("hub socket error: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }

        if password_rejected {
            // No automatic retry: the user must supply a new password.
            return;
        }

        warn!("hub disconnected, reconnecting shortly");
        shared.handle_disconnect().await;
        sleep(HUB_RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn ws_url_without_room() {
        let shared = Shared::for_tests(ClientConfig::default());
        assert_eq!(build_ws_url(&shared), "ws://127.0.0.1:8787/ws");
    }

    #[test]
    fn ws_url_with_room_and_password() {
        let config = ClientConfig {
            room: Some("ABC234".into()),
            password: Some("hunter2hunter".into()),
            ..Default::default()
        };
        let shared = Shared::for_tests(config);
        let url = build_ws_url(&shared);
        assert!(url.starts_with("ws://127.0.0.1:8787/ws?room=ABC234&passwordHash="));
        let hash = url.rsplit('=').next().unwrap();
        assert_eq!(hash.len(), 64);
    }
}
