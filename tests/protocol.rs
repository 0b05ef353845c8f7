//! End-to-end protocol scenarios over the pure state machines: the auth
//! handshake pair, the chunk pipeline with and without encryption, and
//! the transfer lifecycle table. No network required.

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

use dropsync::core::config::CHUNK_SIZE;
use dropsync::core::connection::webrtc::control::ControlFrame;
use dropsync::core::security::auth::{AuthAction, AuthMachine, AuthRole, AuthState};
use dropsync::core::security::crypto;
use dropsync::core::transfer::{progress_pct, TransferHub, TransferStatus};
use dropsync::{ErrorKind, SessionEvent};

// ── Harness ──────────────────────────────────────────────────────────────────

/// Drive two auth machines over a simulated lossless ordered stream until
/// no frames remain in flight. Returns every non-frame action observed.
fn run_handshake(
    initiator: &mut AuthMachine,
    initiator_pw: Option<&str>,
    responder: &mut AuthMachine,
    responder_pw: Option<&str>,
) -> Vec<AuthAction> {
    let mut resolutions = Vec::new();

    // Stream opens on both sides.
    let mut to_responder: Vec<ControlFrame> = Vec::new();
    let mut to_initiator: Vec<ControlFrame> = Vec::new();
    split(initiator.on_open(initiator_pw), &mut to_responder, &mut resolutions);
    split(responder.on_open(responder_pw), &mut to_initiator, &mut resolutions);

    while !to_responder.is_empty() || !to_initiator.is_empty() {
        for frame in std::mem::take(&mut to_responder) {
            split(
                responder.on_frame(&frame, responder_pw),
                &mut to_initiator,
                &mut resolutions,
            );
        }
        for frame in std::mem::take(&mut to_initiator) {
            split(
                initiator.on_frame(&frame, initiator_pw),
                &mut to_responder,
                &mut resolutions,
            );
        }
    }
    resolutions
}

fn split(actions: Vec<AuthAction>, wire: &mut Vec<ControlFrame>, out: &mut Vec<AuthAction>) {
    for action in actions {
        match action {
            AuthAction::SendFrame(frame) => wire.push(frame),
            other => out.push(other),
        }
    }
}

/// Chunk a payload the way the sender does, optionally encrypting, then
/// reassemble it the way the receiver does.
fn pipe_payload(payload: &[u8], password: Option<&str>) -> Vec<u8> {
    let mut wire: Vec<Vec<u8>> = Vec::new();
    for chunk in payload.chunks(CHUNK_SIZE) {
        match password {
            Some(pw) => wire.push(crypto::encrypt_chunk(chunk, pw).expect("encrypt")),
            None => wire.push(chunk.to_vec()),
        }
    }

    let mut assembled = Vec::new();
    for frame in &wire {
        match password {
            Some(pw) => assembled.extend(crypto::decrypt_chunk(frame, pw).expect("decrypt")),
            None => assembled.extend_from_slice(frame),
        }
    }
    assembled
}

fn hub() -> (TransferHub, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransferHub::new(tx), rx)
}

// ── Scenario 1: no-password success ──────────────────────────────────────────

#[test]
fn no_password_session_transfers_exact_bytes() {
    let mut a = AuthMachine::new(AuthRole::Initiator);
    let mut b = AuthMachine::new(AuthRole::Responder);
    run_handshake(&mut a, None, &mut b, None);
    assert_eq!(a.state(), AuthState::Skipped);
    assert_eq!(b.state(), AuthState::Skipped);

    let payload = b"hi!";
    let received = pipe_payload(payload, None);
    assert_eq!(received, payload);
    assert_eq!(progress_pct(received.len() as u64, payload.len() as u64), 100);
}

// ── Scenario 2: correct password ─────────────────────────────────────────────

#[test]
fn matching_password_session_transfers_random_blob() {
    let mut a = AuthMachine::new(AuthRole::Initiator);
    let mut b = AuthMachine::new(AuthRole::Responder);
    let resolutions = run_handshake(&mut a, Some("secret"), &mut b, Some("secret"));

    assert_eq!(a.state(), AuthState::Admitted);
    assert_eq!(b.state(), AuthState::Admitted);
    assert!(resolutions
        .iter()
        .all(|r| !matches!(r, AuthAction::Reject(_))));

    // 100 KiB random blob survives chunked encryption byte-for-byte.
    let blob: Vec<u8> = (0..100 * 1024).map(|_| rand::random::<u8>()).collect();
    let received = pipe_payload(&blob, Some("secret"));

    assert_eq!(Sha256::digest(&received), Sha256::digest(&blob));
}

// ── Scenario 3: wrong password ───────────────────────────────────────────────

#[test]
fn wrong_password_rejects_without_payload_frames() {
    let mut a = AuthMachine::new(AuthRole::Initiator);
    let mut b = AuthMachine::new(AuthRole::Responder);
    let resolutions = run_handshake(&mut a, Some("alpha"), &mut b, Some("beta"));

    assert_eq!(a.state(), AuthState::Rejected);
    assert_eq!(b.state(), AuthState::Rejected);
    assert!(resolutions
        .iter()
        .any(|r| *r == AuthAction::Reject(ErrorKind::WrongPassword)));
    assert!(!a.is_admitted() && !b.is_admitted());
}

// ── Scenario 4: one side unset ───────────────────────────────────────────────

#[test]
fn password_mismatch_one_side_unset_tears_down() {
    let mut a = AuthMachine::new(AuthRole::Initiator);
    let mut b = AuthMachine::new(AuthRole::Responder);
    let resolutions = run_handshake(&mut a, Some("alpha"), &mut b, None);

    assert_eq!(a.state(), AuthState::Rejected);
    assert_eq!(b.state(), AuthState::Rejected);
    assert!(resolutions
        .iter()
        .any(|r| *r == AuthAction::Reject(ErrorKind::PasswordMismatchPeerHasNone)));
}

// ── Scenario 5: cancellation ─────────────────────────────────────────────────

#[tokio::test]
async fn cancel_mid_transfer_is_idempotent_and_isolated() {
    let (hub, _events) = hub();
    let big = Uuid::new_v4();
    let other = Uuid::new_v4();

    let cancel_rx = hub
        .insert_send(big, "big.bin", 10 * 1024 * 1024, PathBuf::from("/tmp/big.bin"))
        .await;
    hub.insert_receive(other, "other.bin", 1024).await;

    hub.set_progress(big, 50).await;

    // Cancel once: flag flips, status transitions.
    assert!(hub.trigger_cancel(big).await);
    hub.cancel(big, ErrorKind::Cancelled).await;
    assert!(*cancel_rx.borrow());
    let first = hub.transfer(big).await.unwrap();
    assert_eq!(first.status, TransferStatus::Cancelled);
    assert_eq!(first.error, Some(ErrorKind::Cancelled));
    assert_eq!(first.progress, 50);

    // Cancel twice: identical final state.
    hub.cancel(big, ErrorKind::Cancelled).await;
    let second = hub.transfer(big).await.unwrap();
    assert_eq!(second.status, first.status);
    assert_eq!(second.progress, first.progress);

    // The concurrent transfer is untouched.
    hub.set_progress(other, 100).await;
    hub.complete(other).await;
    assert_eq!(hub.status(other).await, Some(TransferStatus::Completed));
}

// ── Scenario 6: decline on the receiver ──────────────────────────────────────

#[tokio::test]
async fn decline_leaves_sender_contract_fulfilled() {
    let (receiver_hub, _events) = hub();
    let (sender_hub, _sender_events) = hub();
    let id = Uuid::new_v4();
    let payload = vec![0xAB; 1024 * 1024];

    // Sender side fulfilled its contract.
    sender_hub
        .insert_send(id, "blob.bin", payload.len() as u64, PathBuf::from("/tmp/blob.bin"))
        .await;
    sender_hub.complete(id).await;

    // Receiver assembles, then declines at file-end.
    receiver_hub
        .insert_receive(id, "blob.bin", payload.len() as u64)
        .await;
    receiver_hub
        .publish_pending(id, "blob.bin".into(), payload)
        .await;
    assert_eq!(
        receiver_hub.status(id).await,
        Some(TransferStatus::PendingAccept)
    );

    receiver_hub.take_pending(id).await.expect("pending payload");
    receiver_hub.cancel(id, ErrorKind::Declined).await;

    let declined = receiver_hub.transfer(id).await.unwrap();
    assert_eq!(declined.status, TransferStatus::Cancelled);
    assert_eq!(declined.error, Some(ErrorKind::Declined));
    assert_eq!(
        sender_hub.status(id).await,
        Some(TransferStatus::Completed)
    );
}

// ── Boundary: chunk slicing ──────────────────────────────────────────────────

#[test]
fn chunk_boundaries_round_trip() {
    // Exact multiple of the chunk size: no short final chunk.
    let exact = vec![7u8; CHUNK_SIZE * 2];
    assert_eq!(pipe_payload(&exact, Some("pw")), exact);

    // One byte over: a one-byte final chunk.
    let over = vec![9u8; CHUNK_SIZE * 2 + 1];
    assert_eq!(pipe_payload(&over, Some("pw")), over);

    // Empty payload.
    assert!(pipe_payload(&[], Some("pw")).is_empty());
}

// ── Invariant: IV uniqueness on the wire ─────────────────────────────────────

#[test]
fn encrypted_chunks_never_share_an_iv() {
    let chunk = vec![0u8; 512];
    let mut ivs = std::collections::HashSet::new();
    for _ in 0..64 {
        let frame = crypto::encrypt_chunk(&chunk, "pw").expect("encrypt");
        assert!(ivs.insert(frame[..12].to_vec()), "IV repeated on the wire");
    }
}
