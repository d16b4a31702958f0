//! Receiving side of the transfer protocol.

use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use clouddrop_core::constants::LATE_CHUNK_GRACE;
use clouddrop_core::protocol::{FramePayload, SignalFrame, TransferFrame, TransferMode};
use clouddrop_core::transfer::{Assembly, IngestOutcome, ProgressTracker};
use clouddrop_core::{Error, Result};

use crate::engine::peer::PeerCommand;
use crate::events::Event;

use super::{IncomingCtx, IncomingItem};

/// Drive one accepted incoming transfer to completion.
pub(crate) async fn run(mut ctx: IncomingCtx) {
    let file_id = ctx.file_id;
    if let Err(e) = receive(&mut ctx).await {
        match e {
            Error::PeerCancelled | Error::UserCancelled => {
                debug!(%file_id, "incoming transfer cancelled")
            }
            e => {
                warn!(%file_id, "incoming transfer failed: {e}");
                let _ = ctx.shared.events.send(Event::Error {
                    message: format!("receiving {} failed: {e}", ctx.file_name),
                });
            }
        }
    }
    let _ = ctx.cmd.send(PeerCommand::TransferClosed(file_id));
}

async fn receive(ctx: &mut IncomingCtx) -> Result<()> {
    let mut assembly = Assembly::new(ctx.total_chunks, ctx.file_size);
    let mut tracker = ProgressTracker::new(ctx.file_size, Instant::now());

    loop {
        let Some(item) = ctx.feed.recv().await else {
            return Err(Error::ConnectionClosed);
        };
        if ctx.cancelled.load(Ordering::Relaxed) {
            return Err(Error::UserCancelled);
        }
        match item {
            IncomingItem::Chunk { index, payload } => {
                ingest_chunk(ctx, &mut assembly, &mut tracker, index, payload)?;
            }
            IncomingItem::End => {
                return finish(ctx, assembly).await;
            }
            IncomingItem::Cancel { reason } => {
                let _ = ctx.shared.events.send(Event::TransferCancelled {
                    peer_id: ctx.peer_id.clone(),
                    file_id: ctx.file_id,
                    reason,
                });
                return Err(Error::PeerCancelled);
            }
        }
    }
}

fn ingest_chunk(
    ctx: &IncomingCtx,
    assembly: &mut Assembly,
    tracker: &mut ProgressTracker,
    index: u32,
    payload: Bytes,
) -> Result<()> {
    // Decrypt failures abort the transfer: the AEAD rejected the chunk and
    // there is nothing to salvage from it.
    let plaintext = ctx
        .shared
        .keys
        .read()
        .expect("keys lock")
        .decrypt_chunk(&ctx.peer_id, &payload)?;
    let plaintext_len = plaintext.len() as u64;

    match assembly.ingest(index, Bytes::from(plaintext)) {
        IngestOutcome::Stored => {
            let progress = tracker.advance(plaintext_len, Instant::now());
            let _ = ctx.shared.events.send(Event::TransferProgress {
                peer_id: ctx.peer_id.clone(),
                file_id: ctx.file_id,
                file_name: ctx.file_name.clone(),
                file_size: ctx.file_size,
                progress,
            });
        }
        IngestOutcome::Duplicate => debug!(index, "duplicate chunk dropped (still ACKed)"),
        IngestOutcome::OutOfRange => {
            warn!(index, total = ctx.total_chunks, "chunk index out of range");
            return Ok(());
        }
    }

    // Relay ACK batching; the direct path has no chunk-level ACKs.
    if ctx.mode == TransferMode::Relay {
        if let Some(acks) = assembly.take_ack_batch() {
            send_acks(ctx, acks)?;
        }
    }
    Ok(())
}

/// `file-end` handling: flush ACKs, give late chunks a grace window, then
/// assemble and deliver.
async fn finish(ctx: &mut IncomingCtx, mut assembly: Assembly) -> Result<()> {
    if ctx.mode == TransferMode::Relay {
        let acks = assembly.flush_acks();
        if !acks.is_empty() {
            send_acks(ctx, acks)?;
        }

        // Missing chunks may still be in flight on the hub leg.
        let grace_deadline = Instant::now() + LATE_CHUNK_GRACE;
        while !assembly.is_complete() {
            let remaining = grace_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let late = timeout(remaining, ctx.feed.recv()).await;
            match late {
                Ok(Some(IncomingItem::Chunk { index, payload })) => {
                    let plaintext = ctx
                        .shared
                        .keys
                        .read()
                        .expect("keys lock")
                        .decrypt_chunk(&ctx.peer_id, &payload)?;
                    assembly.ingest(index, Bytes::from(plaintext));
                    let acks = assembly.flush_acks();
                    send_acks(ctx, acks)?;
                }
                Ok(Some(IncomingItem::Cancel { reason })) => {
                    let _ = ctx.shared.events.send(Event::TransferCancelled {
                        peer_id: ctx.peer_id.clone(),
                        file_id: ctx.file_id,
                        reason,
                    });
                    return Err(Error::PeerCancelled);
                }
                Ok(Some(IncomingItem::End)) | Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    let assembled = assembly.assemble();
    if !assembled.missing.is_empty() {
        warn!(
            file_id = %ctx.file_id,
            missing = ?assembled.missing,
            "transfer completed with missing chunks"
        );
        if ctx.shared.config.strict_integrity {
            return Err(Error::IntegrityFailed {
                missing: assembled.missing.len(),
            });
        }
    }
    if !assembled.size_matches {
        warn!(
            file_id = %ctx.file_id,
            declared = ctx.file_size,
            actual = assembled.bytes.len(),
            "assembled size differs from declared size"
        );
    }

    info!(
        file_id = %ctx.file_id,
        name = %ctx.file_name,
        bytes = assembled.bytes.len(),
        "file received"
    );
    let _ = ctx.shared.events.send(Event::FileReceived {
        peer_id: ctx.peer_id.clone(),
        file_id: ctx.file_id,
        file_name: ctx.file_name.clone(),
        mime_type: ctx.mime_type.clone(),
        bytes: assembled.bytes,
        missing: assembled.missing,
    });
    Ok(())
}

fn send_acks(ctx: &IncomingCtx, acks: Vec<u32>) -> Result<()> {
    if acks.is_empty() {
        return Ok(());
    }
    ctx.shared.hub.send(SignalFrame::addressed(
        ctx.peer_id.clone(),
        FramePayload::RelayData {
            data: TransferFrame::Ack {
                file_id: ctx.file_id,
                acks,
            },
        },
    ))
}
