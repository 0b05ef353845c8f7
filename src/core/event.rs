//! Session-level events fanned out to the embedding application.

use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::core::security::auth::AuthState;
use crate::core::transfer::{ChatMessage, ErrorKind, FileTransfer};
use uuid::Uuid;

/// Everything the application can observe about a session, delivered over
/// an unbounded channel in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote endpoint entered the room; we are now the initiator.
    PeerJoined { peer_id: String },
    /// The remote endpoint left the room or its transport died.
    PeerLeft { peer_id: String },
    /// Peer-connection state mirror (connected, disconnected, failed, ...).
    ConnectionState { state: RTCPeerConnectionState },
    /// Liveness sample from the nominated ICE candidate pair.
    PeerStats {
        latency_ms: Option<f64>,
        remote_ip: Option<String>,
    },
    /// Auth handshake progress on the control stream.
    AuthState { state: AuthState },
    /// Auth handshake failure; the transport is torn down.
    AuthFailed { kind: ErrorKind },
    TransferStarted { transfer: FileTransfer },
    TransferProgress { id: Uuid, progress: u8 },
    TransferCompleted { id: Uuid },
    TransferFailed { id: Uuid, kind: ErrorKind },
    TransferCancelled { id: Uuid, kind: ErrorKind },
    /// A fully received payload awaits accept or decline.
    FilePending { id: Uuid, name: String, size: u64 },
    /// An accepted payload was handed to the output sink.
    FileAccepted { id: Uuid },
    Chat { message: ChatMessage },
    /// The signaling carrier re-established its transport and re-joined
    /// the room; any in-flight peer transport was torn down.
    Reconnected,
    /// The session left the room on user request.
    LeftRoom,
    Error { message: String },
}
