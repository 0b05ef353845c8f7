//! FileReceiver: the per-file inbound substream protocol.
//!
//! Bound to an incoming `file-<id>` channel. Chunks accumulate in memory
//! until `file-end`, then the assembled payload is published for the
//! receiver's explicit accept/decline — unsolicited downloads never touch
//! the sink.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use super::TransportContext;
use crate::core::security::crypto::ChunkCipher;
use crate::core::transfer::{progress_pct, ErrorKind};

// ── Wire frames ──────────────────────────────────────────────────────────────

/// JSON framing messages on a file substream; everything else on the
/// channel is an opaque binary chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FileFrame {
    FileStart { name: String, size: u64 },
    FileEnd,
    TransferCancelled,
}

// ── Chunk accumulation ───────────────────────────────────────────────────────

/// Ordered in-memory chunk list for one inbound transfer. Released as soon
/// as the payload is assembled.
#[derive(Default)]
pub(crate) struct ChunkAccumulator {
    chunks: Vec<Vec<u8>>,
    received: u64,
}

impl ChunkAccumulator {
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.received += chunk.len() as u64;
        self.chunks.push(chunk);
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    /// Concatenate all chunks into the final payload, releasing the list.
    pub fn assemble(&mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.received as usize);
        for chunk in self.chunks.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        self.received = 0;
        payload
    }

    pub fn release(&mut self) {
        self.chunks = Vec::new();
        self.received = 0;
    }
}

// ── Per-transfer receive state ───────────────────────────────────────────────

struct RecvState {
    name: String,
    size: u64,
    started: bool,
    /// Set on any terminal outcome; gates the close handler and late frames.
    finished: bool,
    chunks: ChunkAccumulator,
    cipher: Option<ChunkCipher>,
}

impl RecvState {
    fn new() -> Self {
        Self {
            name: String::new(),
            size: 0,
            started: false,
            finished: false,
            chunks: ChunkAccumulator::default(),
            cipher: None,
        }
    }
}

// ── Handler wiring ───────────────────────────────────────────────────────────

/// Attach message/close handlers for one inbound file substream.
pub(crate) fn attach_file_receiver(
    dc: Arc<RTCDataChannel>,
    id: Uuid,
    ctx: TransportContext,
    channels: Arc<RwLock<HashMap<Uuid, Arc<RTCDataChannel>>>>,
) {
    let state = Arc::new(Mutex::new(RecvState::new()));

    {
        let dc_msg = Arc::clone(&dc);
        let state = Arc::clone(&state);
        let ctx_msg = ctx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let dc = Arc::clone(&dc_msg);
            let state = Arc::clone(&state);
            let ctx = ctx_msg.clone();
            Box::pin(async move {
                handle_message(&dc, id, &ctx, &state, msg).await;
            })
        }));
    }

    {
        let state = Arc::clone(&state);
        let ctx_close = ctx;
        dc.on_close(Box::new(move || {
            let state = Arc::clone(&state);
            let ctx = ctx_close.clone();
            let channels = Arc::clone(&channels);
            Box::pin(async move {
                let mut st = state.lock().await;
                if st.started && !st.finished {
                    st.finished = true;
                    st.chunks.release();
                    drop(st);
                    warn!(event = "file_stream_lost", transfer_id = %id, "Substream closed mid-receive");
                    ctx.hub.fail(id, ErrorKind::ConnectionLost).await;
                }
                channels.write().await.remove(&id);
            })
        }));
    }
}

async fn handle_message(
    dc: &Arc<RTCDataChannel>,
    id: Uuid,
    ctx: &TransportContext,
    state: &Arc<Mutex<RecvState>>,
    msg: DataChannelMessage,
) {
    if msg.is_string {
        let frame: FileFrame = match serde_json::from_slice(&msg.data) {
            Ok(f) => f,
            Err(e) => {
                warn!(event = "file_frame_invalid", transfer_id = %id, error = %e, "Undecodable file frame; discarding");
                return;
            }
        };
        match frame {
            FileFrame::FileStart { name, size } => {
                let mut st = state.lock().await;
                if st.started || st.finished {
                    return;
                }
                st.started = true;
                st.name = name.clone();
                st.size = size;
                drop(st);
                info!(event = "file_recv_start", transfer_id = %id, name = %name, size, "Incoming file announced");
                ctx.hub.insert_receive(id, &name, size).await;
            }
            FileFrame::FileEnd => {
                let mut st = state.lock().await;
                if !st.started || st.finished {
                    return;
                }
                st.finished = true;
                let name = st.name.clone();
                let payload = st.chunks.assemble();
                drop(st);
                info!(event = "file_recv_complete", transfer_id = %id, bytes = payload.len(), "File assembled, awaiting accept");
                ctx.hub.publish_pending(id, name, payload).await;
                close_later(dc);
            }
            FileFrame::TransferCancelled => {
                let mut st = state.lock().await;
                if st.finished {
                    return;
                }
                st.finished = true;
                st.chunks.release();
                drop(st);
                info!(event = "file_recv_cancelled", transfer_id = %id, "Transfer cancelled by sender");
                ctx.hub.cancel(id, ErrorKind::Cancelled).await;
                close_later(dc);
            }
        }
        return;
    }

    // Binary chunk.
    let mut st = state.lock().await;
    if !st.started || st.finished {
        debug!(event = "chunk_out_of_band", transfer_id = %id, "Chunk outside an active transfer; discarding");
        return;
    }

    // Decrypt-or-not is decided solely by the local password cell, read
    // fresh for every chunk.
    let plaintext = match ctx.password.read().await.as_deref() {
        Some(pw) => {
            if !st.cipher.as_ref().is_some_and(|c| c.matches(pw)) {
                match ChunkCipher::new(pw) {
                    Ok(c) => st.cipher = Some(c),
                    Err(_) => {
                        st.finished = true;
                        st.chunks.release();
                        drop(st);
                        ctx.hub.fail(id, ErrorKind::DecryptionFailed).await;
                        close_later(dc);
                        return;
                    }
                }
            }
            match st.cipher.as_ref().expect("cipher initialized above").decrypt(&msg.data) {
                Ok(p) => p,
                Err(e) => {
                    st.finished = true;
                    st.chunks.release();
                    drop(st);
                    warn!(event = "chunk_decrypt_failed", transfer_id = %id, error = %e, "Chunk failed authentication");
                    ctx.hub.fail(id, ErrorKind::DecryptionFailed).await;
                    close_later(dc);
                    return;
                }
            }
        }
        None => msg.data.to_vec(),
    };

    st.chunks.push(plaintext);
    let progress = progress_pct(st.chunks.received_bytes(), st.size);
    drop(st);
    ctx.hub.set_progress(id, progress).await;
}

/// Close the substream from outside the handler callback.
fn close_later(dc: &Arc<RTCDataChannel>) {
    let dc = Arc::clone(dc);
    tokio::spawn(async move {
        let _ = dc.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_assembles_in_order() {
        let mut acc = ChunkAccumulator::default();
        acc.push(b"hel".to_vec());
        acc.push(b"lo ".to_vec());
        acc.push(b"world".to_vec());
        assert_eq!(acc.received_bytes(), 11);
        assert_eq!(acc.assemble(), b"hello world".to_vec());
        // Assembly releases the list.
        assert_eq!(acc.received_bytes(), 0);
        assert!(acc.assemble().is_empty());
    }

    #[test]
    fn accumulator_empty_payload() {
        let mut acc = ChunkAccumulator::default();
        assert_eq!(acc.assemble(), Vec::<u8>::new());
    }

    #[test]
    fn file_frame_wire_names() {
        let json = serde_json::to_value(FileFrame::FileStart {
            name: "a.txt".into(),
            size: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "file-start");
        assert_eq!(json["name"], "a.txt");
        assert_eq!(json["size"], 3);

        assert_eq!(
            serde_json::to_value(FileFrame::FileEnd).unwrap()["type"],
            "file-end"
        );
        assert_eq!(
            serde_json::to_value(FileFrame::TransferCancelled).unwrap()["type"],
            "transfer-cancelled"
        );
    }

    #[test]
    fn file_frame_roundtrip() {
        let frame = FileFrame::FileStart {
            name: "blob.bin".into(),
            size: 1024,
        };
        let back: FileFrame =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(back, frame);
    }
}
