//! The per-peer connection actor.
//!
//! One task per remote peer owns every piece of that peer's state: the
//! peer connection and data channel, the negotiation machine, the quality
//! prediction, restart and recovery policies, and the registry of active
//! transfers. Everything reaches the actor as a [`PeerCommand`]; webrtc
//! callbacks are funneled in as generation-tagged [`RtcEvent`]s so events
//! from a torn-down connection cannot corrupt the current attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use clouddrop_core::constants::{
    CONNECTION_TIMEOUT, DISCONNECTED_TIMEOUT, FAST_FALLBACK_TIMEOUT, PREWARM_DELAY_MAX,
    PREWARM_DELAY_MIN, SLOW_THRESHOLD,
};
use clouddrop_core::engine::{
    CandidateKind, FallbackVerdict, IceRestartPolicy, Negotiation, OfferDisposition,
    QualityPrediction, RecoverySchedule, RestartDecision,
};
use clouddrop_core::protocol::{
    FileId, FramePayload, PeerId, PeerInfo, SignalFrame, TransferFrame, TransferMode,
};
use clouddrop_core::transfer::FileMeta;
use clouddrop_core::{Error, Result};

use crate::client::Shared;
use crate::engine::rtc::{self, RtcEvent};
use crate::events::{ConnectionStatus, Event};
use crate::transfer::{self, IncomingCtx, IncomingItem, OutgoingCtx, ResponseOutcome, TextCtx};

/// Connection mode as seen by transfers: unknown until the race settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnMode {
    Unknown,
    Direct,
    Relay,
}

/// Stages of the fallback ladder (and the silent-attempt timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FallbackStage {
    /// 3 s: notify the UI the direct attempt is slow.
    Slow,
    /// 5 s: consult the quality prediction.
    Decision,
    /// 10 s: unconditional relay commit.
    Hard,
    /// Silent (prewarm/recovery) attempt expired without connecting.
    SilentExpired,
}

/// Commands into the peer actor.
pub(crate) enum PeerCommand {
    /// A signaling frame forwarded from this peer via the hub.
    Signal(FramePayload),
    /// Start sending a file; `done` resolves when the transfer settles.
    SendFile {
        meta: FileMeta,
        bytes: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    /// Send an encrypted text message.
    SendText {
        text: String,
        done: oneshot::Sender<Result<()>>,
    },
    /// Local cancellation of a transfer in either direction.
    CancelTransfer { file_id: FileId, reason: String },
    /// A transfer needs a settled path; starts the race if necessary.
    EnsureConnection,
    /// Silent connection attempt on peer discovery.
    Prewarm,
    /// Event from the webrtc callbacks, tagged with its attempt generation.
    Rtc(u64, RtcEvent),
    /// Fallback-ladder tick for a given attempt generation.
    FallbackTick(u64, FallbackStage),
    /// Background recovery timer fired.
    RecoveryAttempt,
    /// The 3 s disconnected grace elapsed for a given generation.
    DisconnectedGraceElapsed(u64),
    /// The post-failure restart delay elapsed.
    IceRestartNow(u64),
    /// The local user answered an incoming file request.
    AcceptDecision {
        file_id: FileId,
        accepted: bool,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        mode: TransferMode,
    },
    /// A transfer task finished; drop its registrations.
    TransferClosed(FileId),
    /// Tear the peer down (peer-left or client shutdown).
    Close,
}

/// Handle held by the client for one remote peer. The actor task exits on
/// [`PeerCommand::Close`] or when the last command sender drops.
pub(crate) struct PeerHandle {
    pub info: PeerInfo,
    pub cmd: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    /// Spawn the actor for `info`. `prewarm` schedules a silent direct
    /// attempt after a short random delay.
    pub fn spawn(shared: Arc<Shared>, local_id: PeerId, info: PeerInfo, prewarm: bool) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = PeerActor::new(shared, local_id, info.id.clone(), cmd_tx.clone());
        tokio::spawn(actor.run(cmd_rx));

        if prewarm {
            let cmd = cmd_tx.clone();
            tokio::spawn(async move {
                let jitter = rand::Rng::gen_range(
                    &mut rand::thread_rng(),
                    PREWARM_DELAY_MIN.as_millis() as u64..=PREWARM_DELAY_MAX.as_millis() as u64,
                );
                sleep(std::time::Duration::from_millis(jitter)).await;
                let _ = cmd.send(PeerCommand::Prewarm);
            });
        }

        PeerHandle { info, cmd: cmd_tx }
    }

    /// Request an orderly teardown and stop the task.
    pub fn shutdown(&self) {
        let _ = self.cmd.send(PeerCommand::Close);
    }
}

struct PeerActor {
    shared: Arc<Shared>,
    peer_id: PeerId,
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,

    negotiation: Negotiation,
    prediction: QualityPrediction,
    restart: IceRestartPolicy,

    mode_tx: watch::Sender<ConnMode>,
    pc: Option<Arc<RTCPeerConnection>>,
    dc_slot: Arc<std::sync::RwLock<Option<Arc<RTCDataChannel>>>>,
    last_ice_state: RTCIceConnectionState,

    /// Single in-flight direct attempt slot; prewarm and real transfers
    /// serialize here.
    attempt_running: bool,
    /// True when a transfer is gated on the attempt (fallback ladder armed).
    gating: bool,
    /// Bumped on every teardown; stale callbacks are discarded by tag.
    attempt_gen: u64,

    fallback_task: Option<JoinHandle<()>>,
    recovery_task: Option<JoinHandle<()>>,
    grace_task: Option<JoinHandle<()>>,
    restart_task: Option<JoinHandle<()>>,

    key_ready: Arc<Notify>,
    key_sent: bool,
    last_status: Option<ConnectionStatus>,

    pending_requests: HashMap<FileId, oneshot::Sender<ResponseOutcome>>,
    outgoing_feeds: HashMap<FileId, mpsc::UnboundedSender<TransferFrame>>,
    incoming_feeds: HashMap<FileId, mpsc::UnboundedSender<IncomingItem>>,
    cancel_flags: HashMap<FileId, Arc<AtomicBool>>,
    /// Active direct-path incoming stream: file id and next chunk index.
    direct_incoming: Option<(FileId, u32)>,
}

impl PeerActor {
    fn new(
        shared: Arc<Shared>,
        local_id: PeerId,
        peer_id: PeerId,
        cmd_tx: mpsc::UnboundedSender<PeerCommand>,
    ) -> Self {
        let polite = local_id.is_polite_towards(&peer_id);
        let (mode_tx, _) = watch::channel(ConnMode::Unknown);
        PeerActor {
            shared,
            peer_id,
            cmd_tx,
            negotiation: Negotiation::new(polite),
            prediction: QualityPrediction::new(),
            restart: IceRestartPolicy::new(),
            mode_tx,
            pc: None,
            dc_slot: Arc::new(std::sync::RwLock::new(None)),
            last_ice_state: RTCIceConnectionState::New,
            attempt_running: false,
            gating: false,
            attempt_gen: 0,
            fallback_task: None,
            recovery_task: None,
            grace_task: None,
            restart_task: None,
            key_ready: Arc::new(Notify::new()),
            key_sent: false,
            last_status: None,
            pending_requests: HashMap::new(),
            outgoing_feeds: HashMap::new(),
            incoming_feeds: HashMap::new(),
            cancel_flags: HashMap::new(),
            direct_incoming: None,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            if !self.handle(cmd).await {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Returns false when the actor should stop.
    async fn handle(&mut self, cmd: PeerCommand) -> bool {
        match cmd {
            PeerCommand::Signal(payload) => self.handle_signal(payload).await,
            PeerCommand::SendFile { meta, bytes, done } => self.start_send_file(meta, bytes, done),
            PeerCommand::SendText { text, done } => self.start_send_text(text, done),
            PeerCommand::CancelTransfer { file_id, reason } => {
                self.cancel_local(file_id, reason).await
            }
            PeerCommand::EnsureConnection => self.ensure_connection().await,
            PeerCommand::Prewarm => {
                if self.mode() == ConnMode::Unknown && !self.attempt_running {
                    debug!(peer_id = %self.peer_id, "prewarming direct connection");
                    self.start_direct_attempt(false).await;
                }
            }
            PeerCommand::Rtc(gen, event) => {
                if gen == self.attempt_gen {
                    self.handle_rtc(event).await;
                }
            }
            PeerCommand::FallbackTick(gen, stage) => {
                if gen == self.attempt_gen {
                    self.handle_fallback(stage).await;
                }
            }
            PeerCommand::RecoveryAttempt => self.handle_recovery_attempt().await,
            PeerCommand::DisconnectedGraceElapsed(gen) => {
                if gen == self.attempt_gen
                    && self.last_ice_state == RTCIceConnectionState::Disconnected
                {
                    info!(peer_id = %self.peer_id, "still disconnected after grace, committing to relay");
                    self.commit_relay();
                }
            }
            PeerCommand::IceRestartNow(gen) => {
                if gen == self.attempt_gen {
                    self.issue_ice_restart().await;
                }
            }
            PeerCommand::AcceptDecision {
                file_id,
                accepted,
                name,
                size,
                mime_type,
                total_chunks,
                mode,
            } => {
                self.finish_accept_decision(file_id, accepted, name, size, mime_type, total_chunks, mode)
            }
            PeerCommand::TransferClosed(file_id) => {
                self.pending_requests.remove(&file_id);
                self.outgoing_feeds.remove(&file_id);
                self.incoming_feeds.remove(&file_id);
                self.cancel_flags.remove(&file_id);
            }
            PeerCommand::Close => return false,
        }
        true
    }

    fn mode(&self) -> ConnMode {
        *self.mode_tx.borrow()
    }

    fn emit(&mut self, status: ConnectionStatus, message: Option<String>) {
        if self.last_status == Some(status) {
            return;
        }
        self.last_status = Some(status);
        let _ = self.shared.events.send(Event::ConnectionState {
            peer_id: self.peer_id.clone(),
            status,
            message,
        });
    }

    // =========================================================================
    // Signaling
    // =========================================================================

    async fn handle_signal(&mut self, payload: FramePayload) {
        match payload {
            FramePayload::Offer {
                description,
                public_key,
            } => self.handle_offer(description, public_key).await,
            FramePayload::Answer {
                description,
                public_key,
            } => self.handle_answer(description, public_key).await,
            FramePayload::IceCandidate { candidate } => self.handle_candidate(candidate).await,
            FramePayload::KeyExchange { public_key } => {
                self.import_key(&public_key);
                if !self.key_sent {
                    if let Ok(ours) = self.export_key() {
                        let _ = self.shared.hub.send(SignalFrame::addressed(
                            self.peer_id.clone(),
                            FramePayload::KeyExchange { public_key: ours },
                        ));
                        self.key_sent = true;
                    }
                }
            }
            FramePayload::RelayData { data } => self.route_transfer_frame(data, TransferMode::Relay),
            FramePayload::FileRequest {
                file_id,
                name,
                size,
                mime_type,
                total_chunks,
                transfer_mode,
            } => self.handle_file_request(file_id, name, size, mime_type, total_chunks, transfer_mode),
            FramePayload::FileResponse { file_id, accepted } => {
                if let Some(waiter) = self.pending_requests.remove(&file_id) {
                    let outcome = if accepted {
                        ResponseOutcome::Accepted
                    } else {
                        ResponseOutcome::Declined
                    };
                    let _ = waiter.send(outcome);
                }
            }
            FramePayload::FileCancel { file_id, reason } => {
                self.cancel_remote(file_id, reason);
            }
            FramePayload::Text { data } => self.handle_text(&data),
            other => debug!(peer_id = %self.peer_id, "unexpected signal for peer task: {other:?}"),
        }
    }

    async fn handle_offer(&mut self, description: Value, public_key: Option<String>) {
        if let Some(key) = public_key {
            self.import_key(&key);
        }
        match self.negotiation.on_remote_offer() {
            OfferDisposition::Ignore => {
                debug!(peer_id = %self.peer_id, "offer collision: ignoring (impolite)");
                return;
            }
            OfferDisposition::AcceptWithRollback => {
                debug!(peer_id = %self.peer_id, "offer collision: rolling back (polite)");
                if let Some(pc) = &self.pc {
                    if let Err(e) = rtc::rollback_local_description(pc).await {
                        warn!(peer_id = %self.peer_id, "rollback failed: {e}");
                    }
                }
            }
            OfferDisposition::Accept => {}
        }

        if let Err(e) = self.answer_offer(description).await {
            warn!(peer_id = %self.peer_id, "answering offer failed: {e}");
            self.negotiation.reset();
        }
    }

    async fn answer_offer(&mut self, description: Value) -> Result<()> {
        if self.pc.is_none() {
            // Incoming-offer-driven connection: badge-only, no ladder.
            let servers = self.shared.ice.ranked_servers().await;
            let pc = rtc::new_peer_connection(
                rtc::to_rtc_ice_servers(&servers),
                self.rtc_sender(self.attempt_gen),
            )
            .await?;
            self.pc = Some(pc);
            self.attempt_running = true;
            self.emit(ConnectionStatus::Connecting, None);
        }
        let pc = self.pc.as_ref().expect("pc just ensured").clone();

        let offer: RTCSessionDescription = serde_json::from_value(description)?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::transport(format!("set remote offer: {e}")))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::transport(format!("create answer: {e}")))?;
        let answer_json = serde_json::to_value(&answer)?;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::transport(format!("set local answer: {e}")))?;
        self.negotiation.local_answer_sent()?;

        let public_key = self.export_key().ok();
        self.key_sent = true;
        self.shared.hub.send(SignalFrame::addressed(
            self.peer_id.clone(),
            FramePayload::Answer {
                description: answer_json,
                public_key,
            },
        ))
    }

    async fn handle_answer(&mut self, description: Value, public_key: Option<String>) {
        if let Some(key) = public_key {
            self.import_key(&key);
        }
        if let Err(e) = self.negotiation.on_remote_answer() {
            debug!(peer_id = %self.peer_id, "dropping stray answer: {e}");
            return;
        }
        let Some(pc) = self.pc.clone() else { return };
        match serde_json::from_value::<RTCSessionDescription>(description) {
            Ok(answer) => {
                if let Err(e) = pc.set_remote_description(answer).await {
                    warn!(peer_id = %self.peer_id, "set remote answer failed: {e}");
                }
            }
            Err(e) => warn!(peer_id = %self.peer_id, "malformed answer: {e}"),
        }
    }

    async fn handle_candidate(&mut self, candidate: Value) {
        if !self.negotiation.should_apply_candidate() {
            debug!(peer_id = %self.peer_id, "dropping candidate while ignoring offer");
            return;
        }
        let Some(pc) = self.pc.clone() else { return };
        match serde_json::from_value::<RTCIceCandidateInit>(candidate) {
            Ok(init) => {
                if let Err(e) = pc.add_ice_candidate(init).await {
                    debug!(peer_id = %self.peer_id, "add_ice_candidate failed: {e}");
                }
            }
            Err(e) => debug!(peer_id = %self.peer_id, "malformed candidate: {e}"),
        }
    }

    // =========================================================================
    // RTC events
    // =========================================================================

    async fn handle_rtc(&mut self, event: RtcEvent) {
        match event {
            RtcEvent::CandidateGathered(init) => {
                if let Some(kind) = CandidateKind::classify(&init.candidate) {
                    self.prediction.observe(kind);
                }
                match serde_json::to_value(&init) {
                    Ok(candidate) => {
                        let _ = self.shared.hub.send(SignalFrame::addressed(
                            self.peer_id.clone(),
                            FramePayload::IceCandidate { candidate },
                        ));
                    }
                    Err(e) => warn!("candidate serialization failed: {e}"),
                }
            }
            RtcEvent::GatheringComplete => {
                self.prediction.gathering_complete();
                if self.prediction.network_issue() {
                    warn!(peer_id = %self.peer_id, "ICE gathering produced no candidates");
                }
                // Relay-only candidate sets do not wait for the timer.
                if self.gating && self.prediction.relay_only() {
                    info!(peer_id = %self.peer_id, "relay-only candidates, committing early");
                    self.commit_relay();
                }
            }
            RtcEvent::ChannelOpen(dc) => {
                debug!(peer_id = %self.peer_id, "data channel open");
                *self.dc_slot.write().expect("dc lock") = Some(dc);
                self.maybe_connected();
            }
            RtcEvent::ChannelText(text) => match serde_json::from_str::<TransferFrame>(&text) {
                Ok(frame) => self.route_transfer_frame(frame, TransferMode::Direct),
                Err(e) => debug!(peer_id = %self.peer_id, "unparseable channel frame: {e}"),
            },
            RtcEvent::ChannelBinary(payload) => {
                if let Some((file_id, next_index)) = self.direct_incoming {
                    if let Some(feed) = self.incoming_feeds.get(&file_id) {
                        let _ = feed.send(IncomingItem::Chunk {
                            index: next_index,
                            payload,
                        });
                    }
                    self.direct_incoming = Some((file_id, next_index + 1));
                } else {
                    debug!(peer_id = %self.peer_id, "binary frame outside a stream");
                }
            }
            RtcEvent::ChannelClosed => {
                *self.dc_slot.write().expect("dc lock") = None;
                if self.mode() == ConnMode::Direct {
                    warn!(peer_id = %self.peer_id, "data channel closed, committing to relay");
                    self.mode_tx.send_replace(ConnMode::Unknown);
                    self.commit_relay();
                }
            }
            RtcEvent::IceState(state) => self.handle_ice_state(state).await,
        }
    }

    async fn handle_ice_state(&mut self, state: RTCIceConnectionState) {
        debug!(peer_id = %self.peer_id, ?state, "ICE state");
        self.last_ice_state = state;
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                if let Some(task) = self.grace_task.take() {
                    task.abort();
                }
                self.restart.on_connected();
                self.maybe_connected();
            }
            RTCIceConnectionState::Disconnected => {
                // Transient: give ICE DISCONNECTED_TIMEOUT to recover.
                let gen = self.attempt_gen;
                let cmd = self.cmd_tx.clone();
                if let Some(task) = self.grace_task.take() {
                    task.abort();
                }
                self.grace_task = Some(tokio::spawn(async move {
                    sleep(DISCONNECTED_TIMEOUT).await;
                    let _ = cmd.send(PeerCommand::DisconnectedGraceElapsed(gen));
                }));
            }
            RTCIceConnectionState::Failed => {
                match self.restart.on_failed(self.prediction.p2p_possible()) {
                    RestartDecision::Restart { delay } => {
                        info!(
                            peer_id = %self.peer_id,
                            restarts = self.restart.restarts(),
                            "ICE failed, scheduling restart"
                        );
                        let gen = self.attempt_gen;
                        let cmd = self.cmd_tx.clone();
                        if let Some(task) = self.restart_task.take() {
                            task.abort();
                        }
                        self.restart_task = Some(tokio::spawn(async move {
                            sleep(delay).await;
                            let _ = cmd.send(PeerCommand::IceRestartNow(gen));
                        }));
                    }
                    RestartDecision::CommitRelay => {
                        info!(peer_id = %self.peer_id, "ICE restarts exhausted, committing to relay");
                        if self.mode() == ConnMode::Direct {
                            self.mode_tx.send_replace(ConnMode::Unknown);
                        }
                        self.commit_relay();
                    }
                }
            }
            _ => {}
        }
    }

    /// Direct is usable once the channel is open and the peer key is in.
    fn maybe_connected(&mut self) {
        let channel_open = self.dc_slot.read().expect("dc lock").is_some();
        if !channel_open || !self.has_key() {
            return;
        }
        if self.mode() == ConnMode::Direct {
            return;
        }
        let was_relay = self.mode() == ConnMode::Relay;
        self.mode_tx.send_replace(ConnMode::Direct);
        self.attempt_running = false;
        self.gating = false;
        self.restart.on_connected();
        if let Some(task) = self.fallback_task.take() {
            task.abort();
        }
        if let Some(task) = self.recovery_task.take() {
            task.abort();
        }
        if was_relay {
            // Silent recovery: badge update only.
            info!(peer_id = %self.peer_id, "direct path recovered");
        } else {
            info!(peer_id = %self.peer_id, "direct connection established");
        }
        self.emit(ConnectionStatus::Connected, None);
    }

    // =========================================================================
    // Connection racing
    // =========================================================================

    async fn ensure_connection(&mut self) {
        match self.mode() {
            // Relay is the path; the recovery loop owns further attempts.
            ConnMode::Relay => {}
            ConnMode::Direct => {
                // Channel may have died without a mode change yet.
                if self.dc_slot.read().expect("dc lock").is_none() {
                    self.mode_tx.send_replace(ConnMode::Unknown);
                    self.start_direct_attempt(true).await;
                }
            }
            ConnMode::Unknown => self.start_direct_attempt(true).await,
        }
    }

    async fn start_direct_attempt(&mut self, gating: bool) {
        if self.attempt_running {
            // A silent attempt (prewarm) is already in flight; a real
            // transfer upgrades it and arms the ladder instead of racing a
            // second attempt.
            if gating && !self.gating {
                self.gating = true;
                self.spawn_fallback_ladder();
                self.emit(ConnectionStatus::Connecting, None);
            }
            return;
        }
        self.attempt_running = true;
        self.gating = gating;
        self.attempt_gen += 1;
        if gating {
            self.emit(ConnectionStatus::Connecting, None);
        }

        if let Err(e) = self.open_offer().await {
            warn!(peer_id = %self.peer_id, "direct attempt failed to start: {e}");
            self.teardown_direct().await;
            if gating {
                self.commit_relay();
            }
            return;
        }

        if gating {
            self.spawn_fallback_ladder();
        } else {
            // Silent attempts still expire; they just never commit relay.
            let gen = self.attempt_gen;
            let cmd = self.cmd_tx.clone();
            self.fallback_task = Some(tokio::spawn(async move {
                sleep(CONNECTION_TIMEOUT).await;
                let _ = cmd.send(PeerCommand::FallbackTick(gen, FallbackStage::SilentExpired));
            }));
        }
    }

    /// Create the connection, open the channel, send the offer.
    async fn open_offer(&mut self) -> Result<()> {
        let servers = self.shared.ice.ranked_servers().await;
        let rtc_tx = self.rtc_sender(self.attempt_gen);
        let pc = rtc::new_peer_connection(rtc::to_rtc_ice_servers(&servers), rtc_tx.clone()).await?;
        rtc::create_data_channel(&pc, rtc_tx).await?;
        self.pc = Some(pc.clone());

        self.negotiation.reset();
        self.prediction = QualityPrediction::new();
        self.negotiation.begin_offer()?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::transport(format!("create offer: {e}")))?;
        let offer_json = serde_json::to_value(&offer)?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::transport(format!("set local offer: {e}")))?;
        self.negotiation.local_offer_sent();

        let public_key = self.export_key().ok();
        self.key_sent = true;
        self.shared.hub.send(SignalFrame::addressed(
            self.peer_id.clone(),
            FramePayload::Offer {
                description: offer_json,
                public_key,
            },
        ))
    }

    fn spawn_fallback_ladder(&mut self) {
        if let Some(task) = self.fallback_task.take() {
            task.abort();
        }
        let gen = self.attempt_gen;
        let cmd = self.cmd_tx.clone();
        self.fallback_task = Some(tokio::spawn(async move {
            sleep(SLOW_THRESHOLD).await;
            let _ = cmd.send(PeerCommand::FallbackTick(gen, FallbackStage::Slow));
            sleep(FAST_FALLBACK_TIMEOUT - SLOW_THRESHOLD).await;
            let _ = cmd.send(PeerCommand::FallbackTick(gen, FallbackStage::Decision));
            sleep(CONNECTION_TIMEOUT - FAST_FALLBACK_TIMEOUT).await;
            let _ = cmd.send(PeerCommand::FallbackTick(gen, FallbackStage::Hard));
        }));
    }

    async fn handle_fallback(&mut self, stage: FallbackStage) {
        if self.mode() == ConnMode::Direct {
            return;
        }
        match stage {
            FallbackStage::Slow => {
                if self.gating && self.mode() == ConnMode::Unknown {
                    self.emit(
                        ConnectionStatus::Slow,
                        Some("direct connection is taking longer than usual".into()),
                    );
                }
            }
            FallbackStage::Decision => {
                if self.gating && self.mode() == ConnMode::Unknown {
                    match self.prediction.fast_fallback_verdict() {
                        FallbackVerdict::CommitRelay => {
                            info!(peer_id = %self.peer_id, "fast fallback: no direct candidates");
                            self.commit_relay();
                        }
                        FallbackVerdict::Extend => {
                            debug!(peer_id = %self.peer_id, "fast fallback: direct looks viable, extending");
                        }
                    }
                }
            }
            FallbackStage::Hard => {
                if self.gating && self.mode() == ConnMode::Unknown {
                    info!(peer_id = %self.peer_id, "direct connection timed out, committing to relay");
                    self.commit_relay();
                }
            }
            FallbackStage::SilentExpired => {
                if !self.gating && self.mode() != ConnMode::Direct {
                    // Prewarm/recovery attempts fail quietly and never
                    // commit the peer to relay.
                    debug!(peer_id = %self.peer_id, "silent direct attempt expired");
                    self.teardown_direct().await;
                }
            }
        }
    }

    /// Relay becomes the path. The direct attempt, if any, keeps running in
    /// the background and may silently flip the mode back later.
    fn commit_relay(&mut self) {
        if self.mode() == ConnMode::Relay {
            return;
        }
        self.mode_tx.send_replace(ConnMode::Relay);
        self.gating = false;
        if let Some(task) = self.fallback_task.take() {
            task.abort();
        }
        self.emit(ConnectionStatus::Relay, None);
        self.start_recovery();
    }

    fn start_recovery(&mut self) {
        if self.recovery_task.is_some() {
            return;
        }
        let cmd = self.cmd_tx.clone();
        self.recovery_task = Some(tokio::spawn(async move {
            let mut schedule = RecoverySchedule::new();
            while let Some(delay) = schedule.next_delay() {
                sleep(delay).await;
                if cmd.send(PeerCommand::RecoveryAttempt).is_err() {
                    return;
                }
            }
        }));
    }

    async fn handle_recovery_attempt(&mut self) {
        if self.mode() != ConnMode::Relay {
            return;
        }
        debug!(peer_id = %self.peer_id, "background direct retry");
        self.teardown_direct().await;
        self.start_direct_attempt(false).await;
    }

    async fn issue_ice_restart(&mut self) {
        let Some(pc) = self.pc.clone() else { return };
        info!(peer_id = %self.peer_id, "issuing ICE restart offer");
        self.negotiation.reset();
        if self.negotiation.begin_offer().is_err() {
            return;
        }
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = match pc.create_offer(Some(options)).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer_id = %self.peer_id, "restart offer failed: {e}");
                self.negotiation.abort_offer();
                return;
            }
        };
        let offer_json = match serde_json::to_value(&offer) {
            Ok(value) => value,
            Err(e) => {
                warn!("offer serialization failed: {e}");
                self.negotiation.abort_offer();
                return;
            }
        };
        if let Err(e) = pc.set_local_description(offer).await {
            warn!(peer_id = %self.peer_id, "restart set_local failed: {e}");
            self.negotiation.abort_offer();
            return;
        }
        self.negotiation.local_offer_sent();
        let public_key = self.export_key().ok();
        let _ = self.shared.hub.send(SignalFrame::addressed(
            self.peer_id.clone(),
            FramePayload::Offer {
                description: offer_json,
                public_key,
            },
        ));
    }

    /// Full teardown of the direct state; candidates are gathered anew on
    /// the next attempt.
    async fn teardown_direct(&mut self) {
        self.attempt_gen += 1;
        self.attempt_running = false;
        if let Some(task) = self.fallback_task.take() {
            task.abort();
        }
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
        if let Some(task) = self.restart_task.take() {
            task.abort();
        }
        *self.dc_slot.write().expect("dc lock") = None;
        self.direct_incoming = None;
        self.negotiation.reset();
        self.prediction = QualityPrediction::new();
        self.last_ice_state = RTCIceConnectionState::New;
        if let Some(pc) = self.pc.take() {
            let _ = pc.close().await;
        }
    }

    /// Forward rtc callback events into this actor, tagged with `gen`.
    fn rtc_sender(&self, gen: u64) -> mpsc::UnboundedSender<RtcEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cmd = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if cmd.send(PeerCommand::Rtc(gen, event)).is_err() {
                    break;
                }
            }
        });
        tx
    }

    // =========================================================================
    // Keys
    // =========================================================================

    fn has_key(&self) -> bool {
        self.shared
            .keys
            .read()
            .expect("keys lock")
            .has_peer_key(&self.peer_id)
    }

    fn export_key(&self) -> Result<String> {
        self.shared.keys.read().expect("keys lock").export_public_key()
    }

    fn import_key(&mut self, spki_b64: &str) {
        let result = self
            .shared
            .keys
            .write()
            .expect("keys lock")
            .import_peer_public_key(self.peer_id.clone(), spki_b64);
        match result {
            Ok(()) => {
                debug!(peer_id = %self.peer_id, "peer key installed");
                self.key_ready.notify_waiters();
                self.maybe_connected();
            }
            Err(e) => warn!(peer_id = %self.peer_id, "peer key import failed: {e}"),
        }
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    fn start_send_file(&mut self, meta: FileMeta, bytes: Bytes, done: oneshot::Sender<Result<()>>) {
        let file_id = meta.id;
        let (response_tx, response_rx) = oneshot::channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        self.pending_requests.insert(file_id, response_tx);
        self.outgoing_feeds.insert(file_id, feed_tx);
        self.cancel_flags.insert(file_id, cancelled.clone());

        let ctx = OutgoingCtx {
            shared: self.shared.clone(),
            peer_id: self.peer_id.clone(),
            meta,
            bytes,
            cmd: self.cmd_tx.clone(),
            mode_rx: self.mode_tx.subscribe(),
            feed: feed_rx,
            response: response_rx,
            cancelled,
            dc_slot: self.dc_slot.clone(),
            key_ready: self.key_ready.clone(),
            done,
        };
        tokio::spawn(transfer::outgoing::run(ctx));
    }

    fn start_send_text(&mut self, text: String, done: oneshot::Sender<Result<()>>) {
        let ctx = TextCtx {
            shared: self.shared.clone(),
            peer_id: self.peer_id.clone(),
            cmd: self.cmd_tx.clone(),
            mode_rx: self.mode_tx.subscribe(),
            key_ready: self.key_ready.clone(),
            dc_slot: self.dc_slot.clone(),
            text,
            done,
        };
        tokio::spawn(transfer::outgoing::run_text(ctx));
    }

    fn handle_file_request(
        &mut self,
        file_id: FileId,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        mode: TransferMode,
    ) {
        info!(
            peer_id = %self.peer_id,
            %file_id, %name, size, total_chunks, %mode,
            "incoming file request"
        );
        let (respond, decision) = oneshot::channel();
        let _ = self.shared.events.send(Event::FileRequest {
            peer_id: self.peer_id.clone(),
            file_id,
            file_name: name.clone(),
            file_size: size,
            mime_type: mime_type.clone(),
            total_chunks,
            mode,
            respond,
        });

        // Wait for the subscriber's decision off the actor loop; a dropped
        // responder declines.
        let cmd = self.cmd_tx.clone();
        tokio::spawn(async move {
            let accepted = decision.await.unwrap_or(false);
            let _ = cmd.send(PeerCommand::AcceptDecision {
                file_id,
                accepted,
                name,
                size,
                mime_type,
                total_chunks,
                mode,
            });
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_accept_decision(
        &mut self,
        file_id: FileId,
        accepted: bool,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        mode: TransferMode,
    ) {
        let _ = self.shared.hub.send(SignalFrame::addressed(
            self.peer_id.clone(),
            FramePayload::FileResponse { file_id, accepted },
        ));
        if !accepted {
            return;
        }

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.incoming_feeds.insert(file_id, feed_tx);
        self.cancel_flags.insert(file_id, cancelled.clone());

        let ctx = IncomingCtx {
            shared: self.shared.clone(),
            peer_id: self.peer_id.clone(),
            file_id,
            file_name: name,
            file_size: size,
            mime_type,
            total_chunks,
            mode,
            cmd: self.cmd_tx.clone(),
            feed: feed_rx,
            cancelled,
        };
        tokio::spawn(transfer::incoming::run(ctx));
    }

    /// Route one transfer-plane frame into the right task.
    fn route_transfer_frame(&mut self, frame: TransferFrame, path: TransferMode) {
        match frame {
            TransferFrame::FileStart { file_id, .. } => {
                // Metadata was already established in phase 1; the start
                // frame only opens the chunk stream on the direct path.
                if path == TransferMode::Direct {
                    self.direct_incoming = Some((file_id, 0));
                }
            }
            TransferFrame::Chunk {
                file_id,
                index,
                data,
                retry,
            } => {
                if retry {
                    debug!(%file_id, index, "retransmitted chunk received");
                }
                match base64_decode(&data) {
                    Ok(payload) => {
                        if let Some(feed) = self.incoming_feeds.get(&file_id) {
                            let _ = feed.send(IncomingItem::Chunk {
                                index,
                                payload: Bytes::from(payload),
                            });
                        } else {
                            debug!(%file_id, "chunk for unknown transfer");
                        }
                    }
                    Err(e) => warn!(%file_id, index, "chunk base64 decode failed: {e}"),
                }
            }
            TransferFrame::Ack { file_id, acks } => {
                if let Some(feed) = self.outgoing_feeds.get(&file_id) {
                    let _ = feed.send(TransferFrame::Ack { file_id, acks });
                }
            }
            TransferFrame::FileEnd { file_id, .. } => {
                if self
                    .direct_incoming
                    .is_some_and(|(active, _)| active == file_id)
                {
                    self.direct_incoming = None;
                }
                if let Some(feed) = self.incoming_feeds.get(&file_id) {
                    let _ = feed.send(IncomingItem::End);
                }
            }
            TransferFrame::Text { data } => self.handle_text(&data),
            TransferFrame::Cancel { file_id, reason } => self.cancel_remote(file_id, reason),
        }
    }

    fn handle_text(&mut self, data: &str) {
        let sealed = match base64_decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer_id = %self.peer_id, "text base64 decode failed: {e}");
                return;
            }
        };
        let opened = self
            .shared
            .keys
            .read()
            .expect("keys lock")
            .decrypt_chunk(&self.peer_id, &sealed);
        match opened.map(|bytes| String::from_utf8(bytes)) {
            Ok(Ok(text)) => {
                let _ = self.shared.events.send(Event::TextReceived {
                    peer_id: self.peer_id.clone(),
                    text,
                });
            }
            Ok(Err(_)) => warn!(peer_id = %self.peer_id, "text message is not UTF-8"),
            Err(e) => warn!(peer_id = %self.peer_id, "text decrypt failed: {e}"),
        }
    }

    /// A `file-cancel` arrived (hub or data channel).
    fn cancel_remote(&mut self, file_id: FileId, reason: String) {
        if let Some(flag) = self.cancel_flags.get(&file_id) {
            flag.store(true, Ordering::Relaxed);
        }
        if let Some(waiter) = self.pending_requests.remove(&file_id) {
            let _ = waiter.send(ResponseOutcome::Cancelled(reason.clone()));
        }
        if let Some(feed) = self.outgoing_feeds.get(&file_id) {
            let _ = feed.send(TransferFrame::Cancel {
                file_id,
                reason: reason.clone(),
            });
            // The outgoing task has no reason string of its own; notify here.
            let _ = self.shared.events.send(Event::TransferCancelled {
                peer_id: self.peer_id.clone(),
                file_id,
                reason: reason.clone(),
            });
        }
        if let Some(feed) = self.incoming_feeds.get(&file_id) {
            let _ = feed.send(IncomingItem::Cancel { reason });
        }
        if self
            .direct_incoming
            .is_some_and(|(active, _)| active == file_id)
        {
            self.direct_incoming = None;
        }
    }

    /// The local user cancelled; the message travels over both paths so a
    /// blocked one cannot delay it.
    async fn cancel_local(&mut self, file_id: FileId, reason: String) {
        info!(peer_id = %self.peer_id, %file_id, %reason, "cancelling transfer");
        if let Some(flag) = self.cancel_flags.get(&file_id) {
            flag.store(true, Ordering::Relaxed);
        }
        if let Some(waiter) = self.pending_requests.remove(&file_id) {
            let _ = waiter.send(ResponseOutcome::Cancelled(reason.clone()));
        }
        if let Some(feed) = self.incoming_feeds.get(&file_id) {
            let _ = feed.send(IncomingItem::Cancel {
                reason: reason.clone(),
            });
        }
        // Wake a sender blocked on the ACK window.
        if let Some(feed) = self.outgoing_feeds.get(&file_id) {
            let _ = feed.send(TransferFrame::Cancel {
                file_id,
                reason: reason.clone(),
            });
        }

        let _ = self.shared.hub.send(SignalFrame::addressed(
            self.peer_id.clone(),
            FramePayload::FileCancel {
                file_id,
                reason: reason.clone(),
            },
        ));
        let dc = self.dc_slot.read().expect("dc lock").clone();
        if let Some(dc) = dc {
            let frame = TransferFrame::Cancel {
                file_id,
                reason: reason.clone(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = dc.send_text(text).await;
            }
        }
        let _ = self.shared.events.send(Event::TransferCancelled {
            peer_id: self.peer_id.clone(),
            file_id,
            reason,
        });
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn shutdown(&mut self) {
        for (_, waiter) in self.pending_requests.drain() {
            let _ = waiter.send(ResponseOutcome::Cancelled("peer left".into()));
        }
        for (_, feed) in self.incoming_feeds.drain() {
            let _ = feed.send(IncomingItem::Cancel {
                reason: "peer left".into(),
            });
        }
        self.outgoing_feeds.clear();
        for flag in self.cancel_flags.values() {
            flag.store(true, Ordering::Relaxed);
        }
        self.cancel_flags.clear();
        if let Some(task) = self.recovery_task.take() {
            task.abort();
        }
        self.teardown_direct().await;
        debug!(peer_id = %self.peer_id, "peer actor stopped");
    }
}

fn base64_decode(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(data)
}
