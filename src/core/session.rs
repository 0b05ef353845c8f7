//! SessionEngine: the top-level coordinator.
//!
//! Joins the room on start, creates a TransportSession as initiator when a
//! peer joins (or as responder on an inbound offer), runs the auth
//! handshake through the control stream, and fans every observable change
//! out as [`SessionEvent`]s. Role assignment is deterministic: whichever
//! endpoint receives `peer-joined` first becomes the initiator, and after
//! a signaling reconnect the relay's re-announcement re-elects a single
//! initiator.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::core::config::{default_ice_servers, STATS_INTERVAL};
use crate::core::connection::signaling::{SignalingClient, SignalingEvent};
use crate::core::connection::webrtc::control::{send_frame, ControlFrame};
use crate::core::connection::webrtc::receiver::FileFrame;
use crate::core::connection::webrtc::{
    sender, EngineSignal, SignalPayload, TransportContext, TransportSession, TransportSnapshot,
};
use crate::core::event::SessionEvent;
use crate::core::security::auth::{AuthMachine, AuthRole, AuthState};
use crate::core::transfer::{
    ChatMessage, ChatOrigin, ErrorKind, FileSink, FileTransfer, TransferHub,
};
use crate::utils::now_millis;

// ── Configuration ────────────────────────────────────────────────────────────

pub struct SessionConfig {
    pub signaling_url: String,
    pub room_id: String,
    pub password: Option<String>,
    pub ice_servers: Vec<RTCIceServer>,
    /// Destination for accepted payloads.
    pub sink: Arc<dyn FileSink>,
}

impl SessionConfig {
    pub fn new(signaling_url: impl Into<String>, room_id: impl Into<String>, sink: Arc<dyn FileSink>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            room_id: room_id.into(),
            password: None,
            ice_servers: default_ice_servers(),
            sink,
        }
    }
}

// ── Peer bookkeeping ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub remote_id: String,
    pub connection_state: String,
    pub latency_ms: Option<f64>,
    pub remote_ip: Option<String>,
}

#[derive(Debug, Clone)]
struct PeerState {
    remote_id: String,
    latency_ms: Option<f64>,
    remote_ip: Option<String>,
}

/// Structured diagnostics snapshot for the inspect operation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub room_id: String,
    pub local_id: String,
    pub auth_state: String,
    pub peer: Option<PeerSnapshot>,
    pub transport: Option<TransportSnapshot>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SessionEngine {
    local_id: String,
    room_id: String,
    /// Single-cell mutable password reference; handlers read it fresh.
    password: Arc<RwLock<Option<String>>>,
    ice_servers: Vec<RTCIceServer>,
    sink: Arc<dyn FileSink>,

    signaling: Arc<SignalingClient>,
    transport: RwLock<Option<Arc<TransportSession>>>,
    /// Context of the live transport (shared auth machine included).
    transport_ctx: RwLock<Option<TransportContext>>,
    peer: RwLock<Option<PeerState>>,
    /// Candidates trickled ahead of the transport they belong to.
    pending_candidates: RwLock<Vec<webrtc::ice_transport::ice_candidate::RTCIceCandidateInit>>,

    hub: TransferHub,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    engine_tx: mpsc::UnboundedSender<EngineSignal>,
    signal_out_tx: mpsc::UnboundedSender<(String, SignalPayload)>,
}

impl SessionEngine {
    /// Connect to the relay, join the room, and spawn the coordinator.
    pub async fn start(
        config: SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>)> {
        let local_id = Uuid::new_v4().to_string();
        let (signaling, signaling_rx) =
            SignalingClient::connect(&config.signaling_url, local_id.clone())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (signal_out_tx, signal_out_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            local_id,
            room_id: config.room_id.clone(),
            password: Arc::new(RwLock::new(config.password)),
            ice_servers: config.ice_servers,
            sink: config.sink,
            signaling,
            transport: RwLock::new(None),
            transport_ctx: RwLock::new(None),
            peer: RwLock::new(None),
            pending_candidates: RwLock::new(Vec::new()),
            hub: TransferHub::new(events_tx.clone()),
            events_tx,
            engine_tx,
            signal_out_tx,
        });

        engine.signaling.join(&config.room_id).await;
        info!(event = "session_started", room = %config.room_id, local_id = %engine.local_id, "Joined room");

        tokio::spawn(Arc::clone(&engine).run(signaling_rx, engine_rx, signal_out_rx));

        Ok((engine, events_rx))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    // ── Coordinator loop ─────────────────────────────────────────────────

    async fn run(
        self: Arc<Self>,
        mut signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineSignal>,
        mut signal_out_rx: mpsc::UnboundedReceiver<(String, SignalPayload)>,
    ) {
        loop {
            tokio::select! {
                Some((to, payload)) = signal_out_rx.recv() => {
                    match serde_json::to_value(&payload) {
                        Ok(value) => self.signaling.send_signal(&to, value),
                        Err(e) => warn!(event = "signal_encode_failed", error = %e, "Failed to encode signal payload"),
                    }
                }
                Some(event) = signaling_rx.recv() => {
                    Arc::clone(&self).handle_signaling_event(event).await;
                }
                Some(signal) = engine_rx.recv() => {
                    self.handle_engine_signal(signal).await;
                }
                else => break,
            }
        }
        debug!(event = "session_loop_exit", "Coordinator loop finished");
    }

    async fn handle_signaling_event(self: Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::PeerJoined { remote_id } => {
                if self.transport.read().await.is_some() {
                    debug!(event = "peer_joined_ignored", remote = %remote_id, "Transport already live; ignoring join");
                    return;
                }
                info!(event = "peer_joined", remote = %remote_id, "Peer joined, taking initiator role");
                if let Err(e) = Arc::clone(&self).create_transport(remote_id.clone(), None).await {
                    warn!(event = "initiator_setup_failed", error = %e, "Failed to create initiator transport");
                }
            }
            SignalingEvent::PeerLeft { remote_id } => {
                info!(event = "peer_left", remote = %remote_id, "Peer left the room");
                self.teardown_transport().await;
            }
            SignalingEvent::Signal { from, payload } => {
                let payload: SignalPayload = match serde_json::from_value(payload) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(event = "signal_invalid", error = %e, "Undecodable signal payload; dropping");
                        return;
                    }
                };
                self.handle_signal(from, payload).await;
            }
            SignalingEvent::Reconnected => {
                // The relay will re-announce peer-joined to whichever side
                // stayed; any in-flight transport is stale now.
                info!(event = "signaling_reconnected", "Carrier reconnected; clearing stale transport");
                self.teardown_transport().await;
                let _ = self.events_tx.send(SessionEvent::Reconnected);
            }
        }
    }

    async fn handle_signal(self: Arc<Self>, from: String, payload: SignalPayload) {
        match payload {
            SignalPayload::Offer { offer } => {
                if self.transport.read().await.is_some() {
                    debug!(event = "offer_ignored", from = %from, "Transport already live; ignoring offer");
                    return;
                }
                info!(event = "offer_received", from = %from, "Inbound offer, taking responder role");
                if let Err(e) = Arc::clone(&self).create_transport(from, Some(offer)).await {
                    warn!(event = "responder_setup_failed", error = %e, "Failed to create responder transport");
                }
            }
            SignalPayload::Answer { answer } => {
                let transport = self.transport.read().await.clone();
                if let Some(transport) = transport {
                    if let Err(e) = transport.set_answer(answer).await {
                        warn!(event = "answer_apply_failed", error = %e, "Failed to apply answer");
                    }
                }
            }
            SignalPayload::Candidate { candidate } => {
                let transport = self.transport.read().await.clone();
                match transport {
                    Some(transport) => {
                        if let Err(e) = transport.add_candidate(candidate).await {
                            debug!(event = "candidate_apply_failed", error = %e, "Failed to add candidate");
                        }
                    }
                    None => {
                        // Trickled ahead of the offer; applied once the
                        // responder transport exists.
                        self.pending_candidates.write().await.push(candidate);
                    }
                }
            }
        }
    }

    async fn handle_engine_signal(&self, signal: EngineSignal) {
        match signal {
            EngineSignal::AuthResolved { state } => {
                debug!(event = "auth_state", ?state, "Auth handshake resolved");
            }
            EngineSignal::AuthFailed { kind } => {
                let _ = self.events_tx.send(SessionEvent::AuthFailed { kind });
                self.teardown_transport().await;
            }
            EngineSignal::Terminal { state } => {
                debug!(event = "transport_terminal_signal", ?state, "Clearing terminal transport");
                self.teardown_transport().await;
            }
        }
    }

    // ── Transport lifecycle ──────────────────────────────────────────────

    /// Create the single TransportSession; `offer` selects responder role.
    async fn create_transport(
        self: Arc<Self>,
        remote_id: String,
        offer: Option<webrtc::peer_connection::sdp::session_description::RTCSessionDescription>,
    ) -> Result<()> {
        let role = if offer.is_some() {
            AuthRole::Responder
        } else {
            AuthRole::Initiator
        };
        let ctx = TransportContext {
            hub: self.hub.clone(),
            password: Arc::clone(&self.password),
            events: self.events_tx.clone(),
            engine_tx: self.engine_tx.clone(),
            signal_tx: self.signal_out_tx.clone(),
            auth: Arc::new(StdMutex::new(AuthMachine::new(role))),
        };

        let (transport, reply) = match offer {
            None => {
                TransportSession::connect_initiator(
                    ctx.clone(),
                    remote_id.clone(),
                    self.ice_servers.clone(),
                )
                .await?
            }
            Some(offer) => {
                TransportSession::connect_responder(
                    ctx.clone(),
                    remote_id.clone(),
                    self.ice_servers.clone(),
                    offer,
                )
                .await?
            }
        };

        *self.transport.write().await = Some(Arc::clone(&transport));
        *self.transport_ctx.write().await = Some(ctx);
        *self.peer.write().await = Some(PeerState {
            remote_id: remote_id.clone(),
            latency_ms: None,
            remote_ip: None,
        });
        let _ = self.events_tx.send(SessionEvent::PeerJoined {
            peer_id: remote_id.clone(),
        });

        match serde_json::to_value(&reply) {
            Ok(value) => self.signaling.send_signal(&remote_id, value),
            Err(e) => warn!(event = "signal_encode_failed", error = %e, "Failed to encode offer/answer"),
        }

        for candidate in self.pending_candidates.write().await.drain(..) {
            if let Err(e) = transport.add_candidate(candidate).await {
                debug!(event = "candidate_apply_failed", error = %e, "Failed to add buffered candidate");
            }
        }

        self.spawn_stats_loop(transport);
        Ok(())
    }

    /// Sample the nominated candidate pair every 2 s while this transport
    /// is the live one.
    fn spawn_stats_loop(self: Arc<Self>, transport: Arc<TransportSession>) {
        let engine = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                ticker.tick().await;
                let current = engine.transport.read().await.clone();
                match current {
                    Some(live) if Arc::ptr_eq(&live, &transport) => {
                        if live.connection_state() != RTCPeerConnectionState::Connected {
                            continue;
                        }
                        let (latency_ms, remote_ip) = live.sample_stats().await;
                        if let Some(peer) = engine.peer.write().await.as_mut() {
                            peer.latency_ms = latency_ms;
                            peer.remote_ip = remote_ip.clone();
                        }
                        let _ = engine.events_tx.send(SessionEvent::PeerStats {
                            latency_ms,
                            remote_ip,
                        });
                    }
                    _ => break,
                }
            }
        });
    }

    /// Clear the transport and peer state. In-flight substreams observe
    /// the close and fail their transfers themselves.
    async fn teardown_transport(&self) {
        let transport = self.transport.write().await.take();
        *self.transport_ctx.write().await = None;
        self.pending_candidates.write().await.clear();
        let peer = self.peer.write().await.take();

        if let Some(transport) = transport {
            let _ = transport.close().await;
        }
        if let Some(peer) = peer {
            let _ = self.events_tx.send(SessionEvent::PeerLeft {
                peer_id: peer.remote_id,
            });
        }
    }

    // ── Admission helpers ────────────────────────────────────────────────

    async fn auth_state(&self) -> AuthState {
        match self.transport_ctx.read().await.as_ref() {
            Some(ctx) => ctx.auth.lock().expect("auth machine lock").state(),
            None => AuthState::PendingOpen,
        }
    }

    async fn admitted_transport(&self) -> Option<(Arc<TransportSession>, TransportContext)> {
        let transport = self.transport.read().await.clone()?;
        let ctx = self.transport_ctx.read().await.clone()?;
        let admitted = ctx.auth.lock().expect("auth machine lock").is_admitted();
        admitted.then_some((transport, ctx))
    }

    // ── Password ─────────────────────────────────────────────────────────

    /// Update the shared password cell. Long-lived handlers observe the
    /// new value on their next use without re-binding.
    pub async fn set_password(&self, password: Option<String>) {
        *self.password.write().await = password;
    }

    // ── File transfer operations ─────────────────────────────────────────

    /// Begin sending a file on its own substream. Without an admitted
    /// transport this records an immediate `not-connected` error transfer
    /// for visibility and retry.
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> Result<Uuid> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("source path has no file name"))?;
        let size = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();

        let id = Uuid::new_v4();
        match self.admitted_transport().await {
            Some((transport, ctx)) => {
                let cancel = self.hub.insert_send(id, &name, size, path.clone()).await;
                tokio::spawn(sender::send_file(transport, ctx, id, name, size, path, cancel));
            }
            None => {
                warn!(event = "send_without_transport", name = %name, "Send requested without an admitted transport");
                self.hub
                    .insert_failed_send(id, &name, size, path, ErrorKind::NotConnected)
                    .await;
            }
        }
        Ok(id)
    }

    /// Re-send an errored outbound transfer on a fresh substream under the
    /// same id.
    pub async fn retry_transfer(&self, id: Uuid) -> Result<()> {
        let (name, size, path) = self
            .hub
            .reset_for_retry(id)
            .await
            .ok_or_else(|| anyhow!("transfer {} is not retryable", id))?;

        match self.admitted_transport().await {
            Some((transport, ctx)) => {
                let cancel = self.hub.register_cancel(id).await;
                tokio::spawn(sender::send_file(transport, ctx, id, name, size, path, cancel));
                Ok(())
            }
            None => {
                self.hub.fail(id, ErrorKind::NotConnected).await;
                Err(anyhow!("no admitted transport"))
            }
        }
    }

    /// Cancel a transfer. Idempotent: cancelling a terminal transfer is a
    /// no-op. Flips the sender's flag, tells the peer, and transitions.
    pub async fn cancel_transfer(&self, id: Uuid) {
        match self.hub.status(id).await {
            None => return,
            Some(status) if status.is_terminal() => return,
            Some(_) => {}
        }

        self.hub.trigger_cancel(id).await;

        if let Some(transport) = self.transport.read().await.clone() {
            if let Some(dc) = transport.file_channel(id).await {
                if let Err(kind) = sender::send_text(&dc, &FileFrame::TransferCancelled).await {
                    debug!(event = "cancel_notify_failed", transfer_id = %id, kind = %kind, "Could not notify peer of cancellation");
                }
                let dc_close = dc;
                tokio::spawn(async move {
                    let _ = dc_close.close().await;
                });
            }
            transport.remove_file_channel(id).await;
        }

        self.hub.cancel(id, ErrorKind::Cancelled).await;
    }

    /// Hand an assembled payload to the output sink and complete the
    /// transfer. On sink failure the payload stays pending.
    pub async fn accept_file(&self, id: Uuid) -> Result<()> {
        let pending = self
            .hub
            .take_pending(id)
            .await
            .ok_or_else(|| anyhow!("no pending file {}", id))?;

        if let Err(e) = self.sink.deliver(&pending.name, &pending.payload) {
            warn!(event = "sink_deliver_failed", transfer_id = %id, error = %e, "Sink rejected payload; keeping it pending");
            self.hub
                .publish_pending(id, pending.name.clone(), pending.payload)
                .await;
            return Err(e);
        }

        info!(event = "file_accepted", transfer_id = %id, name = %pending.name, "Payload delivered to sink");
        self.hub.complete(id).await;
        let _ = self.events_tx.send(SessionEvent::FileAccepted { id });
        Ok(())
    }

    /// Discard a pending payload; the transfer ends `cancelled/declined`.
    pub async fn decline_file(&self, id: Uuid) -> Result<()> {
        self.hub
            .take_pending(id)
            .await
            .ok_or_else(|| anyhow!("no pending file {}", id))?;
        info!(event = "file_declined", transfer_id = %id, "Pending payload declined");
        self.hub.cancel(id, ErrorKind::Declined).await;
        Ok(())
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    /// Send a chat message on the control stream. Requires admission.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<Uuid> {
        let (transport, _ctx) = self
            .admitted_transport()
            .await
            .ok_or_else(|| anyhow!("no admitted peer"))?;
        let control = transport
            .control_channel()
            .await
            .ok_or_else(|| anyhow!("control stream not open"))?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            text: text.into(),
            origin: ChatOrigin::Local,
            timestamp: now_millis(),
        };
        send_frame(
            &control,
            &ControlFrame::Chat {
                id: message.id,
                text: message.text.clone(),
                timestamp: message.timestamp,
            },
        )
        .await?;
        let id = message.id;
        self.hub.push_chat(message).await;
        Ok(id)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn transfers(&self) -> Vec<FileTransfer> {
        self.hub.transfers().await
    }

    pub async fn chat_log(&self) -> Vec<ChatMessage> {
        self.hub.chat_log().await
    }

    /// Structured diagnostics: transport, signaling, and ICE states plus
    /// per-substream buffering.
    pub async fn inspect(&self) -> SessionSnapshot {
        let auth_state = format!("{:?}", self.auth_state().await);
        let transport = match self.transport.read().await.clone() {
            Some(t) => Some(t.inspect().await),
            None => None,
        };
        let peer = match (self.peer.read().await.clone(), &transport) {
            (Some(peer), transport) => Some(PeerSnapshot {
                remote_id: peer.remote_id,
                connection_state: transport
                    .as_ref()
                    .map(|t| t.connection_state.clone())
                    .unwrap_or_else(|| "new".to_string()),
                latency_ms: peer.latency_ms,
                remote_ip: peer.remote_ip,
            }),
            (None, _) => None,
        };

        SessionSnapshot {
            room_id: self.room_id.clone(),
            local_id: self.local_id.clone(),
            auth_state,
            peer,
            transport,
        }
    }

    // ── Leave ────────────────────────────────────────────────────────────

    /// Tear down the transport and leave the room.
    pub async fn leave(&self) {
        self.teardown_transport().await;
        self.signaling.leave().await;
        let _ = self.events_tx.send(SessionEvent::LeftRoom);
        info!(event = "session_left", room = %self.room_id, "Left room");
    }
}
