//! Transfer bookkeeping: the session-owned record of every file transfer,
//! pending payloads awaiting accept/decline, and the chat log.
//!
//! Substreams never hold the session; they mutate these collections through
//! a cloneable [`TransferHub`] and reference transfers by id only. That
//! breaks the session↔substream cycle: closing a substream removes its
//! entry, and the substream never retains the session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::event::SessionEvent;

// ── Error taxonomy ───────────────────────────────────────────────────────────

/// User-visible error kinds, exposed verbatim on transfer records and in
/// events. Kebab-case on the wire and in `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PasswordRequired,
    PasswordMismatchPeerHasNone,
    PasswordMismatchPeerHasPassword,
    WrongPassword,
    DecryptionFailed,
    ConnectionLost,
    ChannelOpenTimeout,
    BufferTimeout,
    ConnectionClosed,
    Cancelled,
    Declined,
    NotConnected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PasswordRequired => "password-required",
            ErrorKind::PasswordMismatchPeerHasNone => "password-mismatch-peer-has-none",
            ErrorKind::PasswordMismatchPeerHasPassword => "password-mismatch-peer-has-password",
            ErrorKind::WrongPassword => "wrong-password",
            ErrorKind::DecryptionFailed => "decryption-failed",
            ErrorKind::ConnectionLost => "connection-lost",
            ErrorKind::ChannelOpenTimeout => "channel-open-timeout",
            ErrorKind::BufferTimeout => "buffer-timeout",
            ErrorKind::ConnectionClosed => "connection-closed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Declined => "declined",
            ErrorKind::NotConnected => "not-connected",
        }
    }

    /// Auth failures tear down the whole session; transfer failures stay
    /// local to their transfer.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ErrorKind::PasswordRequired
                | ErrorKind::PasswordMismatchPeerHasNone
                | ErrorKind::PasswordMismatchPeerHasPassword
                | ErrorKind::WrongPassword
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Transfer records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Sending,
    Receiving,
    PendingAccept,
    Completed,
    Error,
    Cancelled,
}

impl TransferStatus {
    /// Terminal statuses never transition again, except `Error`, which a
    /// retry may reset onto a fresh substream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Error | TransferStatus::Cancelled
        )
    }
}

/// One file transfer, retained for the life of the session.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub name: String,
    /// The sender's declared size in bytes.
    pub size: u64,
    /// 0..=100, monotonic non-decreasing.
    pub progress: u8,
    pub status: TransferStatus,
    pub error: Option<ErrorKind>,
    /// Source path, retained on the send side so `retry` can reopen a
    /// fresh substream with the same id.
    pub source_path: Option<PathBuf>,
}

/// A fully received payload awaiting the receiver's accept or decline.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub payload: Vec<u8>,
}

// ── Chat ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    pub origin: ChatOrigin,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

// ── Output sink ──────────────────────────────────────────────────────────────

/// Destination for accepted payloads. The demo binary writes to a
/// directory; tests capture in memory.
pub trait FileSink: Send + Sync {
    fn deliver(&self, name: &str, payload: &[u8]) -> anyhow::Result<()>;
}

/// Writes accepted files into a fixed directory, sanitizing the name down
/// to a single path component.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn safe_name(name: &str) -> String {
        let base = name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or("file")
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect::<String>();
        if base.is_empty() || base.chars().all(|c| c == '.') {
            "file".to_string()
        } else {
            base
        }
    }
}

impl FileSink for DirectorySink {
    fn deliver(&self, name: &str, payload: &[u8]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::safe_name(name));
        std::fs::write(&path, payload)?;
        Ok(())
    }
}

// ── Progress ─────────────────────────────────────────────────────────────────

/// Percentage progress as `floor(bytes * 100 / size)`, clamped to 100.
/// A declared size of zero reports 100 immediately.
pub fn progress_pct(bytes: u64, size: u64) -> u8 {
    if size == 0 {
        return 100;
    }
    (bytes.saturating_mul(100) / size).min(100) as u8
}

/// Number of chunks covering `size` bytes at `chunk_size` each.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

// ── TransferHub ──────────────────────────────────────────────────────────────

/// Shared transfer/pending/chat state plus the session event channel.
///
/// Cheap to clone; each substream task gets its own copy. All mutation
/// goes through these methods so status monotonicity is enforced in one
/// place.
#[derive(Clone)]
pub struct TransferHub {
    transfers: Arc<RwLock<HashMap<Uuid, FileTransfer>>>,
    pending: Arc<RwLock<HashMap<Uuid, PendingFile>>>,
    chat: Arc<RwLock<Vec<ChatMessage>>>,
    cancel_flags: Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl TransferHub {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            transfers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            chat: Arc::new(RwLock::new(Vec::new())),
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Record a new outbound transfer and hand back its cancellation watch.
    pub async fn insert_send(
        &self,
        id: Uuid,
        name: &str,
        size: u64,
        source_path: PathBuf,
    ) -> watch::Receiver<bool> {
        let transfer = FileTransfer {
            id,
            direction: TransferDirection::Send,
            name: name.to_owned(),
            size,
            progress: 0,
            status: TransferStatus::Sending,
            error: None,
            source_path: Some(source_path),
        };
        self.transfers.write().await.insert(id, transfer.clone());
        self.emit(SessionEvent::TransferStarted { transfer });
        self.register_cancel(id).await
    }

    /// Record a new inbound transfer announced by a `file-start` frame.
    pub async fn insert_receive(&self, id: Uuid, name: &str, size: u64) {
        let transfer = FileTransfer {
            id,
            direction: TransferDirection::Receive,
            name: name.to_owned(),
            size,
            progress: 0,
            status: TransferStatus::Receiving,
            error: None,
            source_path: None,
        };
        self.transfers.write().await.insert(id, transfer.clone());
        self.emit(SessionEvent::TransferStarted { transfer });
    }

    /// Record an immediately failed outbound transfer (e.g. `send` with no
    /// live transport) so the failure is visible and retryable.
    pub async fn insert_failed_send(&self, id: Uuid, name: &str, size: u64, path: PathBuf, kind: ErrorKind) {
        let transfer = FileTransfer {
            id,
            direction: TransferDirection::Send,
            name: name.to_owned(),
            size,
            progress: 0,
            status: TransferStatus::Error,
            error: Some(kind),
            source_path: Some(path),
        };
        self.transfers.write().await.insert(id, transfer.clone());
        self.emit(SessionEvent::TransferStarted { transfer });
        self.emit(SessionEvent::TransferFailed { id, kind });
    }

    // ── Status transitions ───────────────────────────────────────────────

    /// Monotonic progress update; emits only on change.
    pub async fn set_progress(&self, id: Uuid, progress: u8) {
        let mut transfers = self.transfers.write().await;
        if let Some(t) = transfers.get_mut(&id) {
            let clamped = progress.min(100);
            if clamped > t.progress && !t.status.is_terminal() {
                t.progress = clamped;
                let progress = t.progress;
                drop(transfers);
                self.emit(SessionEvent::TransferProgress { id, progress });
            }
        }
    }

    /// Transition to `Completed` with progress 100. No-op on terminal.
    pub async fn complete(&self, id: Uuid) {
        let mut transfers = self.transfers.write().await;
        if let Some(t) = transfers.get_mut(&id) {
            if t.status.is_terminal() {
                return;
            }
            t.status = TransferStatus::Completed;
            t.progress = 100;
            drop(transfers);
            self.emit(SessionEvent::TransferCompleted { id });
        }
    }

    /// Transition to `Error` with a kind. No-op on terminal.
    pub async fn fail(&self, id: Uuid, kind: ErrorKind) {
        let mut transfers = self.transfers.write().await;
        if let Some(t) = transfers.get_mut(&id) {
            if t.status.is_terminal() {
                return;
            }
            warn!(event = "transfer_failed", transfer_id = %id, kind = %kind, "Transfer failed");
            t.status = TransferStatus::Error;
            t.error = Some(kind);
            drop(transfers);
            self.emit(SessionEvent::TransferFailed { id, kind });
        }
    }

    /// Transition to `Cancelled` (kind `cancelled` or `declined`).
    /// Idempotent: a second cancel is a no-op.
    pub async fn cancel(&self, id: Uuid, kind: ErrorKind) {
        let mut transfers = self.transfers.write().await;
        if let Some(t) = transfers.get_mut(&id) {
            if t.status.is_terminal() {
                return;
            }
            t.status = TransferStatus::Cancelled;
            t.error = Some(kind);
            drop(transfers);
            self.pending.write().await.remove(&id);
            self.emit(SessionEvent::TransferCancelled { id, kind });
        }
    }

    /// Reset an errored send back to `Sending` for a retry on a fresh
    /// substream. Returns the retained source path, or `None` if the
    /// transfer is not retryable.
    pub async fn reset_for_retry(&self, id: Uuid) -> Option<(String, u64, PathBuf)> {
        let mut transfers = self.transfers.write().await;
        let t = transfers.get_mut(&id)?;
        if t.status != TransferStatus::Error || t.direction != TransferDirection::Send {
            return None;
        }
        let path = t.source_path.clone()?;
        t.status = TransferStatus::Sending;
        t.error = None;
        t.progress = 0;
        debug!(event = "transfer_retry", transfer_id = %id, "Retrying errored transfer");
        Some((t.name.clone(), t.size, path))
    }

    // ── Pending files ────────────────────────────────────────────────────

    /// Publish an assembled payload for accept/decline and transition the
    /// transfer to `PendingAccept`.
    pub async fn publish_pending(&self, id: Uuid, name: String, payload: Vec<u8>) {
        let size = payload.len() as u64;
        {
            let mut transfers = self.transfers.write().await;
            match transfers.get_mut(&id) {
                Some(t) if !t.status.is_terminal() => {
                    t.status = TransferStatus::PendingAccept;
                    t.progress = 100;
                }
                _ => return,
            }
        }
        self.pending.write().await.insert(
            id,
            PendingFile {
                id,
                name: name.clone(),
                size,
                payload,
            },
        );
        self.emit(SessionEvent::FilePending { id, name, size });
    }

    /// Remove and return a pending payload (accept or decline path).
    pub async fn take_pending(&self, id: Uuid) -> Option<PendingFile> {
        self.pending.write().await.remove(&id)
    }

    // ── Cancellation flags ───────────────────────────────────────────────

    pub async fn register_cancel(&self, id: Uuid) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancel_flags.write().await.insert(id, tx);
        rx
    }

    /// Flip the cancellation flag. Returns false if no flag is registered
    /// (receiver-side transfers have none).
    pub async fn trigger_cancel(&self, id: Uuid) -> bool {
        match self.cancel_flags.read().await.get(&id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    pub async fn clear_cancel(&self, id: Uuid) {
        self.cancel_flags.write().await.remove(&id);
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    pub async fn push_chat(&self, message: ChatMessage) {
        self.chat.write().await.push(message.clone());
        self.emit(SessionEvent::Chat { message });
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn transfer(&self, id: Uuid) -> Option<FileTransfer> {
        self.transfers.read().await.get(&id).cloned()
    }

    pub async fn transfers(&self) -> Vec<FileTransfer> {
        self.transfers.read().await.values().cloned().collect()
    }

    pub async fn status(&self, id: Uuid) -> Option<TransferStatus> {
        self.transfers.read().await.get(&id).map(|t| t.status)
    }

    pub async fn chat_log(&self) -> Vec<ChatMessage> {
        self.chat.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;

    fn hub() -> (TransferHub, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransferHub::new(tx), rx)
    }

    #[test]
    fn progress_floor_and_boundaries() {
        // 0-byte file completes at 100.
        assert_eq!(progress_pct(0, 0), 100);
        // floor semantics
        assert_eq!(progress_pct(1, 3), 33);
        assert_eq!(progress_pct(2, 3), 66);
        assert_eq!(progress_pct(3, 3), 100);
        // never exceeds 100
        assert_eq!(progress_pct(10, 3), 100);
    }

    #[test]
    fn chunk_count_boundaries() {
        let cs = CHUNK_SIZE as u64;
        // exact multiple: no short final chunk
        assert_eq!(chunk_count(cs * 4, CHUNK_SIZE), 4);
        // one byte larger: a 1-byte final chunk
        assert_eq!(chunk_count(cs * 4 + 1, CHUNK_SIZE), 5);
        assert_eq!(chunk_count(0, CHUNK_SIZE), 0);
        assert_eq!(chunk_count(1, CHUNK_SIZE), 1);
    }

    #[tokio::test]
    async fn status_transitions_are_monotonic() {
        let (hub, _rx) = hub();
        let id = Uuid::new_v4();
        hub.insert_receive(id, "a.txt", 3).await;

        hub.complete(id).await;
        assert_eq!(hub.status(id).await, Some(TransferStatus::Completed));

        // Terminal: neither fail nor cancel may override.
        hub.fail(id, ErrorKind::ConnectionLost).await;
        assert_eq!(hub.status(id).await, Some(TransferStatus::Completed));
        hub.cancel(id, ErrorKind::Cancelled).await;
        assert_eq!(hub.status(id).await, Some(TransferStatus::Completed));
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let (hub, _rx) = hub();
        let id = Uuid::new_v4();
        hub.insert_receive(id, "a.txt", 100).await;

        hub.set_progress(id, 40).await;
        hub.set_progress(id, 20).await;
        assert_eq!(hub.transfer(id).await.unwrap().progress, 40);
        hub.set_progress(id, 100).await;
        assert_eq!(hub.transfer(id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (hub, _rx) = hub();
        let id = Uuid::new_v4();
        hub.insert_send(id, "a.bin", 10, PathBuf::from("/tmp/a.bin"))
            .await;

        hub.cancel(id, ErrorKind::Cancelled).await;
        let first = hub.transfer(id).await.unwrap();
        hub.cancel(id, ErrorKind::Cancelled).await;
        let second = hub.transfer(id).await.unwrap();

        assert_eq!(first.status, TransferStatus::Cancelled);
        assert_eq!(second.status, first.status);
        assert_eq!(second.error, first.error);
    }

    #[tokio::test]
    async fn retry_resets_only_errored_sends() {
        let (hub, _rx) = hub();
        let id = Uuid::new_v4();
        hub.insert_send(id, "a.bin", 10, PathBuf::from("/tmp/a.bin"))
            .await;

        // Not errored yet: retry refused.
        assert!(hub.reset_for_retry(id).await.is_none());

        hub.fail(id, ErrorKind::BufferTimeout).await;
        let (name, size, path) = hub.reset_for_retry(id).await.expect("retryable");
        assert_eq!(name, "a.bin");
        assert_eq!(size, 10);
        assert_eq!(path, PathBuf::from("/tmp/a.bin"));
        assert_eq!(hub.status(id).await, Some(TransferStatus::Sending));
    }

    #[tokio::test]
    async fn pending_publish_and_take() {
        let (hub, _rx) = hub();
        let id = Uuid::new_v4();
        hub.insert_receive(id, "a.txt", 2).await;

        hub.publish_pending(id, "a.txt".into(), vec![1, 2]).await;
        assert_eq!(hub.status(id).await, Some(TransferStatus::PendingAccept));

        let pending = hub.take_pending(id).await.expect("pending file");
        assert_eq!(pending.payload, vec![1, 2]);
        assert!(hub.take_pending(id).await.is_none());
    }

    #[test]
    fn error_kind_wire_names() {
        assert_eq!(ErrorKind::WrongPassword.to_string(), "wrong-password");
        assert_eq!(
            serde_json::to_string(&ErrorKind::DecryptionFailed).unwrap(),
            "\"decryption-failed\""
        );
        assert_eq!(
            ErrorKind::PasswordMismatchPeerHasPassword.as_str(),
            "password-mismatch-peer-has-password"
        );
        assert!(ErrorKind::WrongPassword.is_auth());
        assert!(!ErrorKind::BufferTimeout.is_auth());
    }

    #[test]
    fn directory_sink_sanitizes_names() {
        assert_eq!(DirectorySink::safe_name("a.txt"), "a.txt");
        assert_eq!(DirectorySink::safe_name("../../etc/passwd"), "passwd");
        assert_eq!(DirectorySink::safe_name("dir\\b.bin"), "b.bin");
        assert_eq!(DirectorySink::safe_name("..."), "file");
        assert_eq!(DirectorySink::safe_name(""), "file");
    }
}
