//! Control stream: the single reliable ordered text channel (labeled
//! `signaling`) carrying the auth handshake and, after admission, chat.
//!
//! Frames are UTF-8 JSON. The auth handshake must resolve before any chat
//! is accepted; non-auth frames on an un-admitted stream are discarded.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use super::{EngineSignal, TransportContext};
use crate::core::event::SessionEvent;
use crate::core::security::auth::AuthAction;
use crate::core::transfer::{ChatMessage, ChatOrigin};

// ── Wire frames ──────────────────────────────────────────────────────────────

/// Control-channel message kinds. Challenge and signature travel base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    AuthSkip,
    AuthChallenge {
        challenge: String,
    },
    AuthResponse {
        challenge: String,
        signature: String,
    },
    AuthOk,
    AuthFail,
    Chat {
        id: Uuid,
        text: String,
        timestamp: u64,
    },
}

impl ControlFrame {
    pub fn is_auth(&self) -> bool {
        !matches!(self, ControlFrame::Chat { .. })
    }
}

// ── Sending ──────────────────────────────────────────────────────────────────

/// Serialize and send one frame as a text message.
pub(crate) async fn send_frame(dc: &Arc<RTCDataChannel>, frame: &ControlFrame) -> anyhow::Result<()> {
    let json = serde_json::to_string(frame)?;
    dc.send_text(json).await?;
    Ok(())
}

// ── Handler wiring ───────────────────────────────────────────────────────────

/// Attach open/message handlers that drive the auth machine and dispatch
/// chat. Used by both roles; the machine knows which side it is.
pub(crate) async fn attach_control_handlers(dc: &Arc<RTCDataChannel>, ctx: TransportContext) {
    // Stream open: the side with no password announces auth-skip, the
    // initiator with a password issues its challenge.
    {
        let dc_open = Arc::clone(dc);
        let ctx_open = ctx.clone();
        dc.on_open(Box::new(move || {
            let dc = Arc::clone(&dc_open);
            let ctx = ctx_open.clone();
            Box::pin(async move {
                let password = ctx.password.read().await.clone();
                let actions = {
                    let mut machine = ctx.auth.lock().expect("auth machine lock");
                    machine.on_open(password.as_deref())
                };
                info!(event = "control_stream_open", "Control stream open, starting auth");
                run_auth_actions(&dc, &ctx, actions).await;
            })
        }));
    }

    let dc_msg = Arc::clone(dc);
    let ctx_msg = ctx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let dc = Arc::clone(&dc_msg);
        let ctx = ctx_msg.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!(event = "control_binary_discarded", "Binary frame on control stream; discarding");
                return;
            }
            let frame: ControlFrame = match serde_json::from_slice(&msg.data) {
                Ok(f) => f,
                Err(e) => {
                    warn!(event = "control_frame_invalid", error = %e, "Undecodable control frame; discarding");
                    return;
                }
            };

            if frame.is_auth() {
                let password = ctx.password.read().await.clone();
                let actions = {
                    let mut machine = ctx.auth.lock().expect("auth machine lock");
                    machine.on_frame(&frame, password.as_deref())
                };
                run_auth_actions(&dc, &ctx, actions).await;
                return;
            }

            // Chat is only accepted once the handshake admitted the peer.
            let admitted = ctx.auth.lock().expect("auth machine lock").is_admitted();
            if !admitted {
                debug!(event = "chat_before_admission", "Chat frame before admission; discarding");
                return;
            }
            if let ControlFrame::Chat { id, text, timestamp } = frame {
                ctx.hub
                    .push_chat(ChatMessage {
                        id,
                        text,
                        origin: ChatOrigin::Remote,
                        timestamp,
                    })
                    .await;
            }
        })
    }));

    // The responder may attach after the channel already opened; the
    // machine's `on_open` is idempotent, so driving it twice is safe.
    if dc.ready_state() == webrtc::data_channel::data_channel_state::RTCDataChannelState::Open {
        let password = ctx.password.read().await.clone();
        let actions = {
            let mut machine = ctx.auth.lock().expect("auth machine lock");
            machine.on_open(password.as_deref())
        };
        run_auth_actions(dc, &ctx, actions).await;
    }
}

/// Execute the declarative actions returned by the auth machine.
async fn run_auth_actions(dc: &Arc<RTCDataChannel>, ctx: &TransportContext, actions: Vec<AuthAction>) {
    for action in actions {
        match action {
            AuthAction::SendFrame(frame) => {
                if let Err(e) = send_frame(dc, &frame).await {
                    warn!(event = "auth_frame_send_failed", error = %e, "Failed to send auth frame");
                }
            }
            AuthAction::Admit(state) => {
                info!(event = "auth_resolved", state = ?state, "Peer admitted");
                ctx.emit(SessionEvent::AuthState { state });
                let _ = ctx.engine_tx.send(EngineSignal::AuthResolved { state });
            }
            AuthAction::Reject(kind) => {
                warn!(event = "auth_rejected", kind = %kind, "Auth handshake rejected; tearing down");
                let _ = ctx.engine_tx.send(EngineSignal::AuthFailed { kind });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wire_names_are_kebab() {
        let json = serde_json::to_value(ControlFrame::AuthSkip).unwrap();
        assert_eq!(json["type"], "auth-skip");

        let json = serde_json::to_value(ControlFrame::AuthChallenge {
            challenge: "AAECAw==".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "auth-challenge");
        assert_eq!(json["challenge"], "AAECAw==");

        let json = serde_json::to_value(ControlFrame::Chat {
            id: Uuid::nil(),
            text: "hi".into(),
            timestamp: 1700000000000,
        })
        .unwrap();
        assert_eq!(json["type"], "chat");
    }

    #[test]
    fn frame_roundtrip() {
        let frame = ControlFrame::AuthResponse {
            challenge: "bm9uY2U=".into(),
            signature: "c2ln".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ControlFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn auth_classification() {
        assert!(ControlFrame::AuthOk.is_auth());
        assert!(ControlFrame::AuthFail.is_auth());
        assert!(!ControlFrame::Chat {
            id: Uuid::nil(),
            text: String::new(),
            timestamp: 0,
        }
        .is_auth());
    }
}
