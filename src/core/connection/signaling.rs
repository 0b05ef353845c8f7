//! SignalingClient: a thin carrier over the room-scoped relay.
//!
//! One persistent WebSocket in bidirectional-stream mode (no polling
//! fallback, which breaks behind upgrade-mangling intermediaries). JSON
//! envelope messages; the relay inspects only the envelope and forwards
//! `signal` payloads unchanged. Keepalive pings every 10 s defeat 60 s
//! idle timeouts; a missed pong deadline forces a reconnect, after which
//! the client re-joins its room and surfaces `Reconnected` so the engine
//! can tear down any stale peer transport.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::{KEEPALIVE_INTERVAL, PONG_DEADLINE, RECONNECT_RETRY_DELAYS};

// ── Wire envelope ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    Signal {
        to: String,
        from: String,
        signal: serde_json::Value,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    PeerJoined { remote_id: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { remote_id: String },
    Signal {
        from: String,
        signal: serde_json::Value,
    },
    Pong,
}

// ── Client-facing events ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    PeerJoined { remote_id: String },
    PeerLeft { remote_id: String },
    Signal { from: String, payload: serde_json::Value },
    /// The carrier re-established its transport and re-joined the room.
    Reconnected,
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct SignalingClient {
    local_id: String,
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    room: Arc<RwLock<Option<String>>>,
}

impl SignalingClient {
    /// Connect to the relay and spawn the carrier task. Events arrive on
    /// the returned receiver for the life of the client.
    pub fn connect(
        url: &str,
        local_id: String,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let url = Url::parse(url).context("invalid signaling url")?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let room = Arc::new(RwLock::new(None));

        let client = Arc::new(Self {
            local_id,
            out_tx,
            room: Arc::clone(&room),
        });

        tokio::spawn(run_carrier(url, out_rx, events_tx, room));

        Ok((client, events_rx))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Join a named room; the relay announces us to existing members.
    pub async fn join(&self, room_id: &str) {
        *self.room.write().await = Some(room_id.to_owned());
        let _ = self.out_tx.send(ClientMessage::JoinRoom {
            room_id: room_id.to_owned(),
        });
    }

    /// Leave the current room, if any.
    pub async fn leave(&self) {
        if let Some(room_id) = self.room.write().await.take() {
            let _ = self.out_tx.send(ClientMessage::LeaveRoom { room_id });
        }
    }

    /// Relay an opaque payload to a specific remote endpoint.
    pub fn send_signal(&self, to: &str, payload: serde_json::Value) {
        let _ = self.out_tx.send(ClientMessage::Signal {
            to: to.to_owned(),
            from: self.local_id.clone(),
            signal: payload,
        });
    }
}

// ── Carrier task ─────────────────────────────────────────────────────────────

async fn run_carrier(
    url: Url,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    room: Arc<RwLock<Option<String>>>,
) {
    let mut first_connect = true;

    'carrier: loop {
        let ws = {
            let mut attempt = 0usize;
            loop {
                if events_tx.is_closed() {
                    return;
                }
                match connect_async(url.as_str()).await {
                    Ok((ws, _)) => break ws,
                    Err(e) => {
                        let delay =
                            RECONNECT_RETRY_DELAYS[attempt.min(RECONNECT_RETRY_DELAYS.len() - 1)];
                        warn!(
                            event = "signaling_connect_failed",
                            error = %e,
                            retry_in_secs = delay,
                            "Relay connect failed, retrying"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                        attempt += 1;
                    }
                }
            }
        };
        info!(event = "signaling_connected", url = %url, "Signaling websocket connected");
        let (mut write, mut read) = ws.split();

        // Re-join the room before announcing the reconnect, so the relay's
        // peer-joined re-announcement can already reach us.
        if let Some(room_id) = room.read().await.clone() {
            let join = ClientMessage::JoinRoom { room_id };
            if let Ok(text) = serde_json::to_string(&join) {
                let _ = write.send(Message::Text(text)).await;
            }
        }
        if !first_connect {
            let _ = events_tx.send(SignalingEvent::Reconnected);
        }
        first_connect = false;

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick completes immediately
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(message) = outbound else {
                        // Client dropped; close politely and stop.
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    };
                    let Ok(text) = serde_json::to_string(&message) else { continue };
                    if write.send(Message::Text(text)).await.is_err() {
                        warn!(event = "signaling_send_failed", "Relay write failed, reconnecting");
                        continue 'carrier;
                    }
                }
                inbound = read.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            last_heard = Instant::now();
                            dispatch(&events_tx, &text);
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            last_heard = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(event = "signaling_closed", "Relay closed the stream, reconnecting");
                            continue 'carrier;
                        }
                        Some(Err(e)) => {
                            warn!(event = "signaling_read_failed", error = %e, "Relay read failed, reconnecting");
                            continue 'carrier;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = keepalive.tick() => {
                    if last_heard.elapsed() > KEEPALIVE_INTERVAL + PONG_DEADLINE {
                        warn!(event = "signaling_pong_deadline", "Relay missed the pong deadline, reconnecting");
                        continue 'carrier;
                    }
                    let Ok(text) = serde_json::to_string(&ClientMessage::Ping) else { continue };
                    if write.send(Message::Text(text)).await.is_err() {
                        continue 'carrier;
                    }
                }
            }
        }
    }
}

fn dispatch(events_tx: &mpsc::UnboundedSender<SignalingEvent>, text: &str) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(event = "signaling_frame_invalid", error = %e, "Undecodable relay frame");
            return;
        }
    };
    let event = match message {
        ServerMessage::PeerJoined { remote_id } => SignalingEvent::PeerJoined { remote_id },
        ServerMessage::PeerLeft { remote_id } => SignalingEvent::PeerLeft { remote_id },
        ServerMessage::Signal { from, signal } => SignalingEvent::Signal {
            from,
            payload: signal,
        },
        ServerMessage::Pong => return,
    };
    let _ = events_tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_envelope_wire_format() {
        let json = serde_json::to_value(ClientMessage::JoinRoom {
            room_id: "k3x9p2q".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "join-room");
        assert_eq!(json["roomId"], "k3x9p2q");

        let json = serde_json::to_value(ClientMessage::Signal {
            to: "b".into(),
            from: "a".into(),
            signal: serde_json::json!({"type": "offer"}),
        })
        .unwrap();
        assert_eq!(json["type"], "signal");
        assert_eq!(json["signal"]["type"], "offer");

        assert_eq!(
            serde_json::to_value(ClientMessage::Ping).unwrap()["type"],
            "ping"
        );
    }

    #[test]
    fn server_envelope_wire_format() {
        let message: ServerMessage =
            serde_json::from_str(r#"{"type":"peer-joined","remoteId":"peer-1"}"#).unwrap();
        assert_eq!(
            message,
            ServerMessage::PeerJoined {
                remote_id: "peer-1".into()
            }
        );

        let message: ServerMessage = serde_json::from_str(
            r#"{"type":"signal","from":"peer-1","signal":{"type":"candidate"}}"#,
        )
        .unwrap();
        match message {
            ServerMessage::Signal { from, signal } => {
                assert_eq!(from, "peer-1");
                assert_eq!(signal["type"], "candidate");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
