//! TransportSession: the per-peer WebRTC connection and its multiplexed
//! data channels.
//!
//! - Control channel (`signaling`) — reliable ordered JSON frames for the
//!   auth handshake and chat.
//! - File channels (`file-<uuid>`) — one per transfer, JSON framing around
//!   opaque binary chunks, flow-controlled by `buffered_amount`.
//!
//! Offer/answer and trickled ICE candidates travel through the signaling
//! relay; everything else is peer-to-peer.

pub mod control;
mod initializer;
pub mod receiver;
pub mod sender;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::core::config::{BUFFERED_AMOUNT_LOW_THRESHOLD, FILE_CHANNEL_PREFIX};
use crate::core::event::SessionEvent;
use crate::core::security::auth::{AuthMachine, AuthState};
use crate::core::transfer::{ErrorKind, TransferHub};

// ── Signaling payloads (relayed, never on data channels) ─────────────────────

/// The opaque `signal` payload forwarded through the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { offer: RTCSessionDescription },
    Answer { answer: RTCSessionDescription },
    Candidate { candidate: RTCIceCandidateInit },
}

// ── Engine signals ───────────────────────────────────────────────────────────

/// Messages from the transport/control layers back to the session engine.
#[derive(Debug)]
pub(crate) enum EngineSignal {
    /// The auth handshake resolved to `Admitted` or `Skipped`.
    AuthResolved { state: AuthState },
    /// The auth handshake rejected the peer; the engine must tear down.
    AuthFailed { kind: ErrorKind },
    /// The peer connection reached a terminal state (`Failed`/`Closed`).
    Terminal { state: RTCPeerConnectionState },
}

// ── Shared handler context ───────────────────────────────────────────────────

/// Everything the channel handlers need, cloneable per closure.
#[derive(Clone)]
pub(crate) struct TransportContext {
    pub hub: TransferHub,
    /// Single-cell mutable password reference: long-lived handlers read it
    /// fresh at every use.
    pub password: Arc<RwLock<Option<String>>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub engine_tx: mpsc::UnboundedSender<EngineSignal>,
    /// Outbound trickle: `(remote_id, payload)` routed through the relay.
    pub signal_tx: mpsc::UnboundedSender<(String, SignalPayload)>,
    /// Auth machine shared between the control handlers and chat gate.
    pub auth: Arc<StdMutex<AuthMachine>>,
}

impl TransportContext {
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

// ── Diagnostics snapshot ─────────────────────────────────────────────────────

/// Per-channel diagnostics for [`TransportSession::inspect`].
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub label: String,
    pub ready_state: String,
    pub buffered_amount: usize,
    pub threshold: usize,
}

/// Structured transport diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TransportSnapshot {
    pub remote_id: String,
    pub role: String,
    pub connection_state: String,
    pub signaling_state: String,
    pub ice_state: String,
    pub channels: Vec<ChannelSnapshot>,
}

// ── TransportSession ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Initiator,
    Responder,
}

impl TransportRole {
    fn as_str(&self) -> &'static str {
        match self {
            TransportRole::Initiator => "initiator",
            TransportRole::Responder => "responder",
        }
    }
}

/// One WebRTC peer connection; at most one per session at a time.
pub struct TransportSession {
    pub(crate) peer_connection: Arc<RTCPeerConnection>,
    pub(crate) control_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    /// Active file substreams by transfer id; entries are removed on close.
    pub(crate) file_channels: Arc<RwLock<HashMap<Uuid, Arc<RTCDataChannel>>>>,
    pub(crate) remote_id: String,
    pub(crate) role: TransportRole,
}

/// Reliable ordered init shared by every channel this protocol opens.
pub(crate) fn ordered_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    }
}

/// Parse a transfer id out of a `file-<uuid>` channel label.
pub(crate) fn file_id_from_label(label: &str) -> Option<Uuid> {
    label
        .strip_prefix(FILE_CHANNEL_PREFIX)
        .and_then(|s| Uuid::parse_str(s).ok())
}

impl TransportSession {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> TransportRole {
        self.role
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    // ── Late signaling input ─────────────────────────────────────────────

    /// Apply the remote answer. Late answers arriving when we are not in
    /// `have-local-offer` are ignored (a known race after tear-down).
    pub async fn set_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer => {
                self.peer_connection.set_remote_description(answer).await?;
                Ok(())
            }
            state => {
                debug!(
                    event = "late_answer_ignored",
                    ?state,
                    "Answer arrived outside have-local-offer; ignoring"
                );
                Ok(())
            }
        }
    }

    /// Add a trickled remote candidate. Candidates received while the
    /// connection is closed are dropped with a warning.
    pub async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.peer_connection.signaling_state() == RTCSignalingState::Closed {
            warn!(
                event = "candidate_dropped_closed",
                "ICE candidate received on closed connection; dropping"
            );
            return Ok(());
        }
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    // ── Substream factory ────────────────────────────────────────────────

    /// Open a fresh outbound file substream labeled `file-<id>` with the
    /// low-water threshold armed for backpressure.
    pub async fn open_file_stream(&self, id: Uuid) -> Result<Arc<RTCDataChannel>> {
        let label = format!("{}{}", FILE_CHANNEL_PREFIX, id);
        let dc = self
            .peer_connection
            .create_data_channel(&label, Some(ordered_channel_init()))
            .await?;
        dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;
        self.file_channels.write().await.insert(id, Arc::clone(&dc));
        Ok(dc)
    }

    /// Look up the live substream for a transfer, if any.
    pub async fn file_channel(&self, id: Uuid) -> Option<Arc<RTCDataChannel>> {
        self.file_channels.read().await.get(&id).cloned()
    }

    pub async fn remove_file_channel(&self, id: Uuid) {
        self.file_channels.write().await.remove(&id);
    }

    pub async fn control_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.control_channel.read().await.clone()
    }

    // ── Stats ────────────────────────────────────────────────────────────

    /// Sample the nominated candidate pair: round-trip time in
    /// milliseconds and the remote candidate's IP, when available.
    pub async fn sample_stats(&self) -> (Option<f64>, Option<String>) {
        if self.peer_connection.connection_state() != RTCPeerConnectionState::Connected {
            return (None, None);
        }

        let report = self.peer_connection.get_stats().await;

        let nominated_pair = report.reports.values().find_map(|entry| match entry {
            StatsReportType::CandidatePair(pair) if pair.nominated => Some(pair),
            _ => None,
        });

        let latency_ms = nominated_pair.and_then(|pair| {
            let rtt = pair.current_round_trip_time;
            (rtt > 0.0).then_some(rtt * 1000.0)
        });

        let remote_ip = nominated_pair.and_then(|pair| {
            report.reports.values().find_map(|entry| match entry {
                StatsReportType::RemoteCandidate(candidate)
                    if candidate.id == pair.remote_candidate_id =>
                {
                    (!candidate.ip.is_empty()).then_some(candidate.ip.clone())
                }
                _ => None,
            })
        });

        (latency_ms, remote_ip)
    }

    // ── Diagnostics ──────────────────────────────────────────────────────

    pub async fn inspect(&self) -> TransportSnapshot {
        let mut channels = Vec::new();
        if let Some(dc) = self.control_channel.read().await.as_ref() {
            channels.push(Self::snapshot_channel(dc).await);
        }
        for dc in self.file_channels.read().await.values() {
            channels.push(Self::snapshot_channel(dc).await);
        }

        TransportSnapshot {
            remote_id: self.remote_id.clone(),
            role: self.role.as_str().to_string(),
            connection_state: self.peer_connection.connection_state().to_string(),
            signaling_state: self.peer_connection.signaling_state().to_string(),
            ice_state: self.peer_connection.ice_connection_state().to_string(),
            channels,
        }
    }

    async fn snapshot_channel(dc: &Arc<RTCDataChannel>) -> ChannelSnapshot {
        ChannelSnapshot {
            label: dc.label().to_string(),
            ready_state: format!("{:?}", dc.ready_state()),
            buffered_amount: dc.buffered_amount().await,
            threshold: dc.buffered_amount_low_threshold().await,
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    pub async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| anyhow!("failed to close peer connection: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_label_roundtrip() {
        let id = Uuid::new_v4();
        let label = format!("{}{}", FILE_CHANNEL_PREFIX, id);
        assert_eq!(file_id_from_label(&label), Some(id));
        assert_eq!(file_id_from_label("signaling"), None);
        assert_eq!(file_id_from_label("file-not-a-uuid"), None);
    }

    #[test]
    fn signal_payload_wire_format() {
        let candidate = RTCIceCandidateInit {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(SignalPayload::Candidate { candidate }).unwrap();
        assert_eq!(json["type"], "candidate");
        assert!(json["candidate"]["candidate"]
            .as_str()
            .unwrap()
            .contains("192.0.2.1"));
    }
}
