//! The client facade: session lifecycle, peer registry, and frame dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use clouddrop_core::constants::CLOSE_PASSWORD_REQUIRED;
use clouddrop_core::crypto::KeyManager;
use clouddrop_core::protocol::{FileId, FramePayload, PeerId, PeerInfo, SignalFrame};
use clouddrop_core::room::RoomCode;
use clouddrop_core::transfer::FileMeta;
use clouddrop_core::{Error, Result};

use crate::config::ClientConfig;
use crate::engine::peer::{PeerCommand, PeerHandle};
use crate::engine::IceProvider;
use crate::events::Event;
use crate::hub::{self, HubHandle};

/// State shared between the hub session, the peer actors, and transfers.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub keys: std::sync::RwLock<KeyManager>,
    pub events: mpsc::UnboundedSender<Event>,
    pub hub: HubHandle,
    pub ice: IceProvider,
    local_id: std::sync::RwLock<Option<PeerId>>,
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
    /// Kept so `for_tests` construction does not lose the receiver early.
    #[allow(dead_code)]
    test_rx: Option<TestChannels>,
}

#[allow(dead_code)]
struct TestChannels {
    events: mpsc::UnboundedReceiver<Event>,
    outbound: mpsc::UnboundedReceiver<SignalFrame>,
}

/// A running transfer on the sending side.
pub struct SendHandle {
    pub file_id: FileId,
    done: oneshot::Receiver<Result<()>>,
}

impl SendHandle {
    /// Wait for the transfer to settle.
    pub async fn finished(self) -> Result<()> {
        self.done.await.map_err(|_| Error::ConnectionClosed)?
    }
}

/// A CloudDrop client session: one device in one room.
pub struct Client {
    shared: Arc<Shared>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    hub_task: JoinHandle<()>,
}

impl Client {
    /// Connect to the hub and join the configured room. The returned client
    /// is live immediately; room membership arrives as a
    /// [`Event::RoomJoined`].
    pub fn connect(config: ClientConfig) -> Result<Client> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (hub_handle, outbound_rx) = hub::channel();

        let mut keys = KeyManager::generate();
        if let (Some(password), Some(room)) = (&config.password, &config.room) {
            keys.set_room_password(password, &RoomCode::parse(room)?)?;
        }

        let ice = IceProvider::new(config.api_base());
        let shared = Arc::new(Shared {
            config,
            keys: std::sync::RwLock::new(keys),
            events: event_tx,
            hub: hub_handle,
            ice,
            local_id: std::sync::RwLock::new(None),
            peers: Mutex::new(HashMap::new()),
            test_rx: None,
        });

        let hub_task = tokio::spawn(hub::run_session(shared.clone(), outbound_rx));
        Ok(Client {
            shared,
            events: Some(event_rx),
            hub_task,
        })
    }

    /// Take the observer event stream. Callable once.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.events.take().expect("event stream already taken")
    }

    /// The peer id the hub issued us, once joined.
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.shared.local_id.read().expect("id lock").clone()
    }

    /// Start sending a file to `peer`. Returns immediately with a handle;
    /// the transfer itself runs the request/accept/stream protocol.
    pub async fn send_file(
        &self,
        peer: &PeerId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Bytes,
    ) -> Result<SendHandle> {
        let meta = FileMeta::new(name, bytes.len() as u64, mime_type);
        let file_id = meta.id;
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .peer_command(peer, PeerCommand::SendFile {
                meta,
                bytes,
                done: done_tx,
            })
            .await?;
        Ok(SendHandle {
            file_id,
            done: done_rx,
        })
    }

    /// Send an encrypted text message to `peer`.
    pub async fn send_text(&self, peer: &PeerId, text: impl Into<String>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .peer_command(peer, PeerCommand::SendText {
                text: text.into(),
                done: done_tx,
            })
            .await?;
        done_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Cancel a transfer in either direction.
    pub async fn cancel_transfer(
        &self,
        peer: &PeerId,
        file_id: FileId,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.shared
            .peer_command(peer, PeerCommand::CancelTransfer {
                file_id,
                reason: reason.into(),
            })
            .await
    }

    /// Begin connecting to `peer` ahead of any transfer.
    pub async fn ensure_connection(&self, peer: &PeerId) -> Result<()> {
        self.shared
            .peer_command(peer, PeerCommand::EnsureConnection)
            .await
    }

    /// Announce a new display name to the room.
    pub fn set_display_name(&self, name: impl Into<String>) -> Result<()> {
        self.shared
            .hub
            .send(SignalFrame::local(FramePayload::NameChanged {
                name: name.into(),
            }))
    }

    /// Tear down the connection and all state for one peer.
    pub async fn close_connection(&self, peer: &PeerId) {
        self.shared.drop_peer(peer).await;
    }

    /// Leave the room and stop all tasks.
    pub async fn shutdown(self) {
        let peers: Vec<PeerId> = {
            let peers = self.shared.peers.lock().await;
            peers.keys().cloned().collect()
        };
        for peer in peers {
            self.shared.drop_peer(&peer).await;
        }
        self.hub_task.abort();
    }
}

impl Shared {
    /// Dispatch one inbound hub frame.
    pub(crate) async fn dispatch(self: &Arc<Self>, text: &str) {
        let frame = match SignalFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("undecodable hub frame: {e}");
                return;
            }
        };

        // Peer-originated traffic goes to that peer's actor.
        if let Some(from) = frame.from.clone() {
            match frame.payload {
                FramePayload::NameChanged { name } => {
                    let mut peers = self.peers.lock().await;
                    if let Some(handle) = peers.get_mut(&from) {
                        handle.info.name = name.clone();
                    }
                    drop(peers);
                    let _ = self.events.send(Event::PeerRenamed {
                        peer_id: from,
                        name,
                    });
                }
                payload => {
                    self.route_to_peer(from, payload).await;
                }
            }
            return;
        }

        match frame.payload {
            FramePayload::Joined {
                peer_id,
                room_code,
                peers,
            } => {
                info!(%peer_id, room = %room_code, peer_count = peers.len(), "joined room");
                *self.local_id.write().expect("id lock") = Some(peer_id.clone());
                for info in &peers {
                    self.spawn_peer(info.clone()).await;
                }
                let _ = self.events.send(Event::RoomJoined {
                    room_code,
                    local_id: peer_id,
                    peers,
                });
            }
            FramePayload::PeerJoined { peer } => {
                info!(peer_id = %peer.id, name = %peer.name, "peer joined");
                self.spawn_peer(peer.clone()).await;
                let _ = self.events.send(Event::PeerJoined { peer });
            }
            FramePayload::PeerLeft { peer_id } => {
                info!(%peer_id, "peer left");
                self.drop_peer(&peer_id).await;
                let _ = self.events.send(Event::PeerLeft { peer_id });
            }
            FramePayload::Ping => {
                let _ = self.hub.send(SignalFrame::local(FramePayload::Pong));
            }
            FramePayload::Pong => {}
            FramePayload::Error { error } => {
                debug!(?error, "hub error frame");
            }
            other => debug!("unhandled hub frame: {other:?}"),
        }
    }

    async fn spawn_peer(self: &Arc<Self>, info: PeerInfo) {
        let Some(local_id) = self.local_id.read().expect("id lock").clone() else {
            warn!("peer announcement before join completed");
            return;
        };
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&info.id) {
            return;
        }
        let handle = PeerHandle::spawn(self.clone(), local_id, info.clone(), self.config.prewarm);
        peers.insert(info.id, handle);
    }

    /// Route a forwarded frame to its peer actor, creating the actor lazily
    /// (e.g. an offer racing ahead of the `peer-joined` broadcast).
    async fn route_to_peer(self: &Arc<Self>, from: PeerId, payload: FramePayload) {
        let Some(local_id) = self.local_id.read().expect("id lock").clone() else {
            debug!(%from, "dropping frame before join completed");
            return;
        };
        let mut peers = self.peers.lock().await;
        let handle = peers.entry(from.clone()).or_insert_with(|| {
            debug!(%from, "creating peer lazily for inbound frame");
            let info = PeerInfo {
                id: from.clone(),
                name: String::new(),
                device_type: Default::default(),
                browser_info: String::new(),
            };
            // No prewarm: the inbound frame is already driving a connection.
            PeerHandle::spawn(self.clone(), local_id, info, false)
        });
        let _ = handle.cmd.send(PeerCommand::Signal(payload));
    }

    pub(crate) async fn peer_command(
        self: &Arc<Self>,
        peer: &PeerId,
        command: PeerCommand,
    ) -> Result<()> {
        let peers = self.peers.lock().await;
        let handle = peers.get(peer).ok_or_else(|| Error::PeerNotFound(peer.clone()))?;
        handle
            .cmd
            .send(command)
            .map_err(|_| Error::PeerNotFound(peer.clone()))
    }

    /// Remove one peer and every trace of it: actor, transfers, timers and
    /// the shared secret.
    pub(crate) async fn drop_peer(self: &Arc<Self>, peer: &PeerId) {
        let handle = self.peers.lock().await.remove(peer);
        if let Some(handle) = handle {
            handle.shutdown();
        }
        self.keys.write().expect("keys lock").remove_peer(peer);
    }

    /// The hub socket died: discard all peers, fail what was in flight, and
    /// start a fresh crypto session for the rejoin.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>) {
        let peer_ids: Vec<PeerId> = self.peers.lock().await.keys().cloned().collect();
        for peer in peer_ids {
            self.drop_peer(&peer).await;
        }
        *self.local_id.write().expect("id lock") = None;

        let mut fresh = KeyManager::generate();
        if let (Some(password), Some(room)) = (&self.config.password, &self.config.room) {
            if let Ok(code) = RoomCode::parse(room) {
                let _ = fresh.set_room_password(password, &code);
            }
        }
        *self.keys.write().expect("keys lock") = fresh;

        let _ = self.events.send(Event::Disconnected);
    }

    /// The hub closed us with a password code: drop the in-memory password
    /// so the UI reopens the prompt.
    pub(crate) async fn handle_password_rejection(self: &Arc<Self>, close_code: u16) {
        warn!(close_code, "hub rejected the room password");
        self.keys.write().expect("keys lock").clear_room_password();
        let _ = self.events.send(Event::PasswordRejected {
            required: close_code == CLOSE_PASSWORD_REQUIRED,
        });
    }

    /// Bare shared state for unit tests that never touch the network.
    #[cfg(test)]
    pub(crate) fn for_tests(config: ClientConfig) -> Arc<Shared> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (hub_handle, outbound_rx) = hub::channel();
        let api_base = config.api_base();
        Arc::new(Shared {
            config,
            keys: std::sync::RwLock::new(KeyManager::generate()),
            events: event_tx,
            hub: hub_handle,
            ice: IceProvider::new(api_base),
            local_id: std::sync::RwLock::new(None),
            peers: Mutex::new(HashMap::new()),
            test_rx: Some(TestChannels {
                events: event_rx,
                outbound: outbound_rx,
            }),
        })
    }
}
