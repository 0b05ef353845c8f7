//! Transport construction: offer/answer exchange, trickled ICE, channel
//! dispatch, and connection-state monitoring.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::control::attach_control_handlers;
use super::receiver::attach_file_receiver;
use super::{
    file_id_from_label, ordered_channel_init, EngineSignal, SignalPayload, TransportContext,
    TransportRole, TransportSession,
};
use crate::core::config::CONTROL_CHANNEL_LABEL;
use crate::core::event::SessionEvent;

impl TransportSession {
    /// Create the transport as initiator: the control stream and the offer
    /// are created in the same step, so the responder sees the stream via
    /// its incoming-channel event.
    pub(crate) async fn connect_initiator(
        ctx: TransportContext,
        remote_id: String,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<(Arc<Self>, SignalPayload)> {
        let session = Self::build(ctx.clone(), remote_id.clone(), TransportRole::Initiator, ice_servers).await?;

        let control = session
            .peer_connection
            .create_data_channel(CONTROL_CHANNEL_LABEL, Some(ordered_channel_init()))
            .await?;
        attach_control_handlers(&control, ctx).await;
        *session.control_channel.write().await = Some(control);

        let offer = session.peer_connection.create_offer(None).await?;
        session
            .peer_connection
            .set_local_description(offer.clone())
            .await?;

        info!(event = "offer_created", remote = %remote_id, "Created offer, trickling candidates");
        Ok((session, SignalPayload::Offer { offer }))
    }

    /// Create the transport as responder from the initiator's offer:
    /// set remote description, create the answer, set it locally.
    pub(crate) async fn connect_responder(
        ctx: TransportContext,
        remote_id: String,
        ice_servers: Vec<RTCIceServer>,
        offer: RTCSessionDescription,
    ) -> Result<(Arc<Self>, SignalPayload)> {
        let session = Self::build(ctx, remote_id.clone(), TransportRole::Responder, ice_servers).await?;

        session.peer_connection.set_remote_description(offer).await?;
        let answer = session.peer_connection.create_answer(None).await?;
        session
            .peer_connection
            .set_local_description(answer.clone())
            .await?;

        info!(event = "answer_created", remote = %remote_id, "Created answer, trickling candidates");
        Ok((session, SignalPayload::Answer { answer }))
    }

    // ── Shared construction ──────────────────────────────────────────────

    async fn build(
        ctx: TransportContext,
        remote_id: String,
        role: TransportRole,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<Arc<Self>> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let session = Arc::new(TransportSession {
            peer_connection: Arc::clone(&pc),
            control_channel: Arc::new(RwLock::new(None)),
            file_channels: Arc::new(RwLock::new(HashMap::new())),
            remote_id: remote_id.clone(),
            role,
        });

        monitor_connection_state(&pc, &ctx, role);
        trickle_candidates(&pc, &ctx, remote_id);
        dispatch_incoming_channels(&pc, &ctx, &session);

        Ok(session)
    }
}

/// Mirror peer-connection state to the application; terminal states are
/// forwarded to the engine so it can clear the peer. `Disconnected` is
/// transient and never tears down.
fn monitor_connection_state(
    pc: &Arc<RTCPeerConnection>,
    ctx: &TransportContext,
    role: TransportRole,
) {
    let events = ctx.events.clone();
    let engine_tx = ctx.engine_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let events = events.clone();
        let engine_tx = engine_tx.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::ConnectionState { state });
            match state {
                RTCPeerConnectionState::Connected => {
                    info!(event = "transport_connected", ?role, "Peer transport established");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "transport_disconnected",
                        ?role,
                        "Transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    error!(event = "transport_terminal", ?role, ?state, "Peer transport terminal");
                    let _ = engine_tx.send(EngineSignal::Terminal { state });
                }
                _ => {}
            }
        })
    }));
}

/// Forward each locally gathered candidate through the relay as it appears.
fn trickle_candidates(pc: &Arc<RTCPeerConnection>, ctx: &TransportContext, remote_id: String) {
    let signal_tx: mpsc::UnboundedSender<(String, SignalPayload)> = ctx.signal_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let signal_tx = signal_tx.clone();
        let remote_id = remote_id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = signal_tx.send((remote_id, SignalPayload::Candidate { candidate: init }));
                }
                Err(e) => {
                    warn!(event = "candidate_encode_failed", error = %e, "Failed to serialize ICE candidate");
                }
            }
        })
    }));
}

/// Route incoming channels: `signaling` to the control layer, `file-<id>`
/// to a FileReceiver. Anything else is ignored.
fn dispatch_incoming_channels(
    pc: &Arc<RTCPeerConnection>,
    ctx: &TransportContext,
    session: &Arc<TransportSession>,
) {
    let ctx = ctx.clone();
    let control_slot = Arc::clone(&session.control_channel);
    let file_channels = Arc::clone(&session.file_channels);

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let ctx = ctx.clone();
        let control_slot = Arc::clone(&control_slot);
        let file_channels = Arc::clone(&file_channels);
        Box::pin(async move {
            let label = dc.label().to_string();
            if label == CONTROL_CHANNEL_LABEL {
                debug!(event = "control_stream_incoming", "Remote control stream arrived");
                attach_control_handlers(&dc, ctx).await;
                *control_slot.write().await = Some(dc);
            } else if let Some(id) = file_id_from_label(&label) {
                debug!(event = "file_stream_incoming", transfer_id = %id, "Remote file stream arrived");
                file_channels.write().await.insert(id, Arc::clone(&dc));
                attach_file_receiver(dc, id, ctx, file_channels);
            } else {
                warn!(event = "unknown_channel", %label, "Ignoring channel with unknown label");
            }
        })
    }));
}
