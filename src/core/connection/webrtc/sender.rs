//! FileSender: the per-file outbound substream protocol.
//!
//! Framing on a `file-<id>` channel: one `file-start` text frame, binary
//! chunks (plaintext or `IV ‖ AEAD`), one `file-end` text frame. Flow
//! control suspends on `buffered_amount` above the 64 KiB low-water mark
//! and resumes on the buffered-amount-low callback — chunks are never
//! dropped and never batched.

use anyhow::Result;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use super::{TransportContext, TransportSession};
use crate::core::config::{
    BUFFERED_AMOUNT_LOW_THRESHOLD, BUFFER_DRAIN_TIMEOUT, CHANNEL_OPEN_TIMEOUT, CHUNK_SIZE,
    SUBSTREAM_LINGER,
};
use crate::core::connection::webrtc::receiver::FileFrame;
use crate::core::security::crypto::ChunkCipher;
use crate::core::transfer::{chunk_count, progress_pct, ErrorKind};

/// Run one outbound transfer to completion, mapping every failure onto the
/// transfer record. The transfer record must already exist in the hub.
pub(crate) async fn send_file(
    transport: Arc<TransportSession>,
    ctx: TransportContext,
    id: Uuid,
    name: String,
    size: u64,
    path: PathBuf,
    cancel: watch::Receiver<bool>,
) {
    info!(event = "file_send_start", transfer_id = %id, name = %name, size, "Starting file send");

    match run(&transport, &ctx, id, &name, size, &path, cancel).await {
        Ok(dc) => {
            ctx.hub.complete(id).await;
            info!(event = "file_send_complete", transfer_id = %id, name = %name, "File sent");

            // Let the receiver drain in-flight chunks before closing.
            tokio::time::sleep(SUBSTREAM_LINGER).await;
            let _ = dc.close().await;
        }
        Err(kind) => {
            // A locally cancelled transfer was already transitioned by
            // `cancel_transfer`; `fail` is a no-op on terminal states.
            ctx.hub.fail(id, kind).await;
            if let Some(dc) = transport.file_channel(id).await {
                let _ = dc.close().await;
            }
        }
    }

    transport.remove_file_channel(id).await;
    ctx.hub.clear_cancel(id).await;
}

async fn run(
    transport: &Arc<TransportSession>,
    ctx: &TransportContext,
    id: Uuid,
    name: &str,
    size: u64,
    path: &PathBuf,
    mut cancel: watch::Receiver<bool>,
) -> Result<Arc<RTCDataChannel>, ErrorKind> {
    let dc = transport
        .open_file_stream(id)
        .await
        .map_err(|_| ErrorKind::ConnectionClosed)?;

    wait_channel_open(&dc).await?;

    // Arm the drain wakeup before any send so no low-water edge is missed.
    let drained = Arc::new(Notify::new());
    {
        let drained = Arc::clone(&drained);
        dc.on_buffered_amount_low(Box::new(move || {
            let drained = Arc::clone(&drained);
            Box::pin(async move {
                drained.notify_one();
            })
        }))
        .await;
    }

    send_text(&dc, &FileFrame::FileStart { name: name.to_owned(), size }).await?;

    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        warn!(event = "source_open_failed", transfer_id = %id, error = %e, "Cannot open source file");
        ErrorKind::ConnectionLost
    })?;

    let total_chunks = chunk_count(size, CHUNK_SIZE);
    let mut cipher: Option<ChunkCipher> = None;
    let mut bytes_sent: u64 = 0;

    for seq in 0..total_chunks {
        if *cancel.borrow() {
            debug!(event = "send_cancelled", transfer_id = %id, seq, "Cancellation flag set; aborting send");
            return Err(ErrorKind::Cancelled);
        }

        let len = (CHUNK_SIZE as u64).min(size - bytes_sent) as usize;
        let mut chunk = vec![0u8; len];
        file.read_exact(&mut chunk).await.map_err(|e| {
            warn!(event = "source_read_failed", transfer_id = %id, seq, error = %e, "Source read failed");
            ErrorKind::ConnectionLost
        })?;

        // The password is read fresh every chunk; the cipher is re-derived
        // only when the cell actually changed.
        let payload = match ctx.password.read().await.as_deref() {
            Some(pw) => {
                if !cipher.as_ref().is_some_and(|c| c.matches(pw)) {
                    cipher =
                        Some(ChunkCipher::new(pw).map_err(|_| ErrorKind::ConnectionClosed)?);
                }
                cipher
                    .as_ref()
                    .expect("cipher initialized above")
                    .encrypt(&chunk)
                    .map_err(|_| ErrorKind::ConnectionClosed)?
            }
            None => chunk,
        };

        wait_for_drain(&dc, &drained, &mut cancel).await?;

        if *cancel.borrow() {
            return Err(ErrorKind::Cancelled);
        }
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(ErrorKind::ConnectionClosed);
        }
        dc.send(&Bytes::from(payload))
            .await
            .map_err(|_| ErrorKind::ConnectionClosed)?;

        bytes_sent += len as u64;
        ctx.hub.set_progress(id, progress_pct(bytes_sent, size)).await;
    }

    send_text(&dc, &FileFrame::FileEnd).await?;
    Ok(dc)
}

/// Wait for the channel to reach `Open`, failing with
/// `channel-open-timeout` after the configured deadline.
async fn wait_channel_open(dc: &Arc<RTCDataChannel>) -> Result<(), ErrorKind> {
    if dc.ready_state() == RTCDataChannelState::Open {
        return Ok(());
    }

    let opened = Arc::new(Notify::new());
    {
        let opened = Arc::clone(&opened);
        dc.on_open(Box::new(move || {
            let opened = Arc::clone(&opened);
            Box::pin(async move {
                opened.notify_one();
            })
        }));
    }

    // Re-check after registering to close the TOCTOU window.
    if dc.ready_state() == RTCDataChannelState::Open {
        return Ok(());
    }

    match timeout(CHANNEL_OPEN_TIMEOUT, opened.notified()).await {
        Ok(()) => Ok(()),
        Err(_) if dc.ready_state() == RTCDataChannelState::Open => Ok(()),
        Err(_) => {
            warn!(event = "channel_open_timeout", channel = %dc.label(), "File channel failed to open in time");
            Err(ErrorKind::ChannelOpenTimeout)
        }
    }
}

/// Suspend while the send buffer sits above the low-water mark. Fails with
/// `buffer-timeout` after 30 s without progress; a flipped cancellation
/// flag unblocks the wait immediately.
async fn wait_for_drain(
    dc: &Arc<RTCDataChannel>,
    drained: &Arc<Notify>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), ErrorKind> {
    while dc.buffered_amount().await > BUFFERED_AMOUNT_LOW_THRESHOLD {
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(ErrorKind::ConnectionClosed);
        }
        tokio::select! {
            notified = timeout(BUFFER_DRAIN_TIMEOUT, drained.notified()) => {
                if notified.is_err() {
                    warn!(event = "buffer_timeout", channel = %dc.label(), "Send buffer failed to drain in time");
                    return Err(ErrorKind::BufferTimeout);
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(ErrorKind::Cancelled);
                }
            }
        }
    }
    Ok(())
}

/// Serialize and send one JSON framing message.
pub(crate) async fn send_text(
    dc: &Arc<RTCDataChannel>,
    frame: &FileFrame,
) -> Result<(), ErrorKind> {
    if dc.ready_state() != RTCDataChannelState::Open {
        return Err(ErrorKind::ConnectionClosed);
    }
    let json = serde_json::to_string(frame).map_err(|_| ErrorKind::ConnectionClosed)?;
    dc.send_text(json)
        .await
        .map(|_| ())
        .map_err(|_| ErrorKind::ConnectionClosed)
}
