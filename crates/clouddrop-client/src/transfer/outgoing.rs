//! Sending side of the transfer protocol.

use std::sync::atomic::Ordering;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use clouddrop_core::constants::{
    BUFFER_POLL_INTERVAL, CHUNK_INTERVAL, CHUNK_SIZE, CONNECTION_TIMEOUT, FILE_REQUEST_TIMEOUT,
    KEY_EXCHANGE_TIMEOUT, MAX_BUFFERED_AMOUNT,
};
use clouddrop_core::protocol::{FramePayload, PeerId, SignalFrame, TransferFrame, TransferMode};
use clouddrop_core::transfer::{ProgressTracker, SendWindow};
use clouddrop_core::{Error, Result};

use tokio::sync::{watch, Notify};

use crate::client::Shared;
use crate::engine::peer::{ConnMode, PeerCommand};
use crate::events::Event;

use super::{OutgoingCtx, ResponseOutcome, TextCtx};

/// Drive one outgoing transfer to completion. Spawned per `send_file`.
pub(crate) async fn run(mut ctx: OutgoingCtx) {
    let file_id = ctx.meta.id;
    let result = transfer(&mut ctx).await;

    match &result {
        Ok(()) => info!(%file_id, name = %ctx.meta.name, "transfer complete"),
        Err(Error::UserCancelled) | Err(Error::PeerCancelled) => {
            debug!(%file_id, "transfer cancelled")
        }
        Err(e) => {
            warn!(%file_id, "transfer failed: {e}");
            let _ = ctx.shared.events.send(Event::Error {
                message: format!("sending {} failed: {e}", ctx.meta.name),
            });
        }
    }

    let _ = ctx.cmd.send(PeerCommand::TransferClosed(file_id));
    let _ = ctx.done.send(result);
}

async fn transfer(ctx: &mut OutgoingCtx) -> Result<()> {
    // Phase 0: a usable path. The engine races direct against the fallback
    // timer; the hard timeout guarantees an answer.
    let _ = ctx.cmd.send(PeerCommand::EnsureConnection);
    let mode = await_mode(&mut ctx.mode_rx).await?;

    // The direct path installs keys during the offer/answer exchange; the
    // relay path may need the explicit key-exchange fallback.
    ensure_shared_key(&ctx.shared, &ctx.peer_id, &ctx.key_ready).await?;

    // Phase 1: file-request.
    let total_chunks = ctx.meta.total_chunks();
    ctx.shared.hub.send(SignalFrame::addressed(
        ctx.peer_id.clone(),
        FramePayload::FileRequest {
            file_id: ctx.meta.id,
            name: ctx.meta.name.clone(),
            size: ctx.meta.size,
            mime_type: ctx.meta.mime_type.clone(),
            total_chunks,
            transfer_mode: mode,
        },
    ))?;

    // Phase 2: the acceptance wait.
    let outcome = timeout(FILE_REQUEST_TIMEOUT, &mut ctx.response)
        .await
        .map_err(|_| Error::PeerDidNotRespond)?
        .map_err(|_| Error::PeerCancelled)?;
    match outcome {
        ResponseOutcome::Accepted => {}
        ResponseOutcome::Declined => return Err(Error::PeerDeclined),
        ResponseOutcome::Cancelled(_) => return Err(Error::PeerCancelled),
    }

    // Phase 3: streaming.
    match mode {
        TransferMode::Direct => stream_direct(ctx).await,
        TransferMode::Relay => stream_relay(ctx).await,
    }
}

async fn await_mode(mode_rx: &mut watch::Receiver<ConnMode>) -> Result<TransferMode> {
    // The engine commits one way or the other within CONNECTION_TIMEOUT;
    // the margin covers scheduling.
    let wait = CONNECTION_TIMEOUT + CONNECTION_TIMEOUT / 2;
    let settled = timeout(wait, mode_rx.wait_for(|m| *m != ConnMode::Unknown))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::ConnectionClosed)?;
    Ok(match *settled {
        ConnMode::Direct => TransferMode::Direct,
        ConnMode::Relay => TransferMode::Relay,
        ConnMode::Unknown => unreachable!("wait_for excludes Unknown"),
    })
}

/// Key-exchange fallback (relay before any direct channel has opened):
/// send our SPKI key, wait for the counterparty's, retry once.
async fn ensure_shared_key(shared: &Shared, peer_id: &PeerId, key_ready: &Notify) -> Result<()> {
    for attempt in 0..2 {
        if shared.keys.read().expect("keys lock").has_peer_key(peer_id) {
            return Ok(());
        }
        let public_key = shared.keys.read().expect("keys lock").export_public_key()?;
        shared.hub.send(SignalFrame::addressed(
            peer_id.clone(),
            FramePayload::KeyExchange { public_key },
        ))?;
        debug!(%peer_id, attempt, "key exchange sent, waiting for reply");
        let _ = timeout(KEY_EXCHANGE_TIMEOUT, key_ready.notified()).await;
    }
    if shared.keys.read().expect("keys lock").has_peer_key(peer_id) {
        Ok(())
    } else {
        Err(Error::NoSharedKey(peer_id.clone()))
    }
}

// =============================================================================
// Text messages
// =============================================================================

/// Send one encrypted text message over whichever path is available.
pub(crate) async fn run_text(mut ctx: TextCtx) {
    let result = send_text(&mut ctx).await;
    if let Err(e) = &result {
        warn!(peer_id = %ctx.peer_id, "text send failed: {e}");
    }
    let _ = ctx.done.send(result);
}

async fn send_text(ctx: &mut TextCtx) -> Result<()> {
    let _ = ctx.cmd.send(PeerCommand::EnsureConnection);
    let mode = await_mode(&mut ctx.mode_rx).await?;
    ensure_shared_key(&ctx.shared, &ctx.peer_id, &ctx.key_ready).await?;

    let sealed = ctx
        .shared
        .keys
        .read()
        .expect("keys lock")
        .encrypt_chunk(&ctx.peer_id, ctx.text.as_bytes())?;
    let data = BASE64.encode(sealed);

    match mode {
        TransferMode::Direct => {
            let dc = ctx
                .dc_slot
                .read()
                .expect("dc lock")
                .clone()
                .ok_or_else(|| Error::transport("direct mode without an open data channel"))?;
            let frame = TransferFrame::Text { data };
            dc.send_text(serde_json::to_string(&frame)?)
                .await
                .map_err(|e| Error::transport(format!("text send: {e}")))?;
        }
        TransferMode::Relay => {
            ctx.shared.hub.send(SignalFrame::addressed(
                ctx.peer_id.clone(),
                FramePayload::Text { data },
            ))?;
        }
    }
    Ok(())
}

fn check_cancelled(ctx: &OutgoingCtx) -> Result<()> {
    if ctx.cancelled.load(Ordering::Relaxed) {
        Err(Error::UserCancelled)
    } else {
        Ok(())
    }
}

fn emit_progress(ctx: &OutgoingCtx, tracker: &mut ProgressTracker, bytes: u64) {
    let progress = tracker.advance(bytes, Instant::now());
    let _ = ctx.shared.events.send(Event::TransferProgress {
        peer_id: ctx.peer_id.clone(),
        file_id: ctx.meta.id,
        file_name: ctx.meta.name.clone(),
        file_size: ctx.meta.size,
        progress,
    });
}

// =============================================================================
// Direct path
// =============================================================================

/// Chunk loop on the data channel: no per-chunk ACKs, the transport is
/// reliable and ordered; backpressure comes from `buffered_amount`.
async fn stream_direct(ctx: &mut OutgoingCtx) -> Result<()> {
    let dc = ctx
        .dc_slot
        .read()
        .expect("dc lock")
        .clone()
        .ok_or_else(|| Error::transport("direct mode without an open data channel"))?;

    let total_chunks = ctx.meta.total_chunks();
    let start = TransferFrame::FileStart {
        file_id: ctx.meta.id,
        name: ctx.meta.name.clone(),
        size: ctx.meta.size,
        mime_type: ctx.meta.mime_type.clone(),
        total_chunks,
    };
    dc.send_text(serde_json::to_string(&start)?)
        .await
        .map_err(|e| Error::transport(format!("file-start: {e}")))?;

    let mut tracker = ProgressTracker::new(ctx.meta.size, Instant::now());
    let mut offset = 0usize;
    while offset < ctx.bytes.len() {
        check_cancelled(ctx)?;
        let end = (offset + CHUNK_SIZE).min(ctx.bytes.len());
        let plaintext = &ctx.bytes[offset..end];
        let sealed = ctx
            .shared
            .keys
            .read()
            .expect("keys lock")
            .encrypt_chunk(&ctx.peer_id, plaintext)?;

        while dc.buffered_amount().await > MAX_BUFFERED_AMOUNT {
            check_cancelled(ctx)?;
            sleep(BUFFER_POLL_INTERVAL).await;
        }
        dc.send(&Bytes::from(sealed))
            .await
            .map_err(|e| Error::transport(format!("chunk send: {e}")))?;

        emit_progress(ctx, &mut tracker, (end - offset) as u64);
        offset = end;
    }

    let end_frame = TransferFrame::FileEnd {
        file_id: ctx.meta.id,
        total_chunks,
    };
    dc.send_text(serde_json::to_string(&end_frame)?)
        .await
        .map_err(|e| Error::transport(format!("file-end: {e}")))?;
    Ok(())
}

// =============================================================================
// Relay path
// =============================================================================

/// Windowed, acknowledged, retransmitting stream through the hub.
async fn stream_relay(ctx: &mut OutgoingCtx) -> Result<()> {
    let total_chunks = ctx.meta.total_chunks();
    let shared = ctx.shared.clone();
    let peer_id = ctx.peer_id.clone();
    let file_id = ctx.meta.id;

    relay_frame(
        &shared,
        &peer_id,
        TransferFrame::FileStart {
            file_id,
            name: ctx.meta.name.clone(),
            size: ctx.meta.size,
            mime_type: ctx.meta.mime_type.clone(),
            total_chunks,
        },
    )?;

    let mut tracker = ProgressTracker::new(ctx.meta.size, Instant::now());
    let mut window = SendWindow::new(Instant::now());
    let mut next_index: u32 = 0;

    while next_index < total_chunks || !window.is_empty() {
        check_cancelled(ctx)?;

        // Fill the window first; pacing keeps the hub breathing.
        if next_index < total_chunks && !window.is_full() {
            let offset = next_index as usize * CHUNK_SIZE;
            let end = (offset + CHUNK_SIZE).min(ctx.bytes.len());
            let sealed = shared
                .keys
                .read()
                .expect("keys lock")
                .encrypt_chunk(&peer_id, &ctx.bytes[offset..end])?;
            let payload = BASE64.encode(sealed);
            window.offer(next_index, payload.clone(), Instant::now());
            relay_frame(
                &shared,
                &peer_id,
                TransferFrame::Chunk {
                    file_id,
                    index: next_index,
                    data: payload,
                    retry: false,
                },
            )?;
            emit_progress(ctx, &mut tracker, (end - offset) as u64);
            next_index += 1;

            drain_acks(&mut ctx.feed, &mut window)?;
            sleep(CHUNK_INTERVAL).await;
            continue;
        }

        // Window full or all chunks offered: wait for ACK progress or the
        // oldest pending chunk's deadline.
        let deadline = window
            .next_deadline()
            .expect("non-empty window has a deadline");
        let feed = &mut ctx.feed;
        tokio::select! {
            maybe = feed.recv() => match maybe {
                Some(TransferFrame::Ack { acks, .. }) => {
                    window.ack(&acks, Instant::now());
                }
                Some(TransferFrame::Cancel { reason, .. }) => {
                    debug!(%reason, "peer cancelled mid-stream");
                    return Err(Error::PeerCancelled);
                }
                Some(other) => debug!("ignoring unexpected transfer frame: {other:?}"),
                None => return Err(Error::ConnectionClosed),
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                let now = Instant::now();
                if window.is_stalled(now) {
                    return Err(Error::RelayStalled);
                }
                if let Some((index, payload)) = window.take_expired(now)? {
                    debug!(index, "retransmitting chunk");
                    relay_frame(
                        &shared,
                        &peer_id,
                        TransferFrame::Chunk {
                            file_id,
                            index,
                            data: payload,
                            retry: true,
                        },
                    )?;
                }
            }
        }
    }

    relay_frame(
        &shared,
        &peer_id,
        TransferFrame::FileEnd {
            file_id,
            total_chunks,
        },
    )
}

/// Retire any ACKs that arrived while we were filling the window.
fn drain_acks(
    feed: &mut tokio::sync::mpsc::UnboundedReceiver<TransferFrame>,
    window: &mut SendWindow,
) -> Result<()> {
    while let Ok(frame) = feed.try_recv() {
        match frame {
            TransferFrame::Ack { acks, .. } => {
                window.ack(&acks, Instant::now());
            }
            TransferFrame::Cancel { .. } => return Err(Error::PeerCancelled),
            other => debug!("ignoring unexpected transfer frame: {other:?}"),
        }
    }
    Ok(())
}

fn relay_frame(shared: &Shared, peer_id: &PeerId, frame: TransferFrame) -> Result<()> {
    shared.hub.send(SignalFrame::addressed(
        peer_id.clone(),
        FramePayload::RelayData { data: frame },
    ))
}
