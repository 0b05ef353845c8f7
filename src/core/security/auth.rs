//! Password-authenticated admission: an HMAC challenge-response state
//! machine running over the control stream.
//!
//! The machine is pure — no I/O, no clocks. Each stream-open or received
//! frame yields a list of declarative [`AuthAction`]s the control-channel
//! driver executes. This keeps every admission rule unit-testable without
//! a live transport.
//!
//! The challenge is echoed back in the response to bind the signature to a
//! specific request and prevent response replay across restarts.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use tracing::debug;

use crate::core::config::CHALLENGE_LEN;
use crate::core::connection::webrtc::control::ControlFrame;
use crate::core::security::crypto;
use crate::core::transfer::ErrorKind;

// ── States ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Control stream not yet open.
    PendingOpen,
    /// Stream open; waiting on the remote side.
    PendingRemote,
    Admitted,
    Rejected,
    Skipped,
}

impl AuthState {
    /// Admission: user payload (chat, file frames) is permitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, AuthState::Admitted | AuthState::Skipped)
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, AuthState::PendingOpen | AuthState::PendingRemote)
    }
}

// ── Actions ──────────────────────────────────────────────────────────────────

/// Side effects the driver must execute, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    SendFrame(ControlFrame),
    /// Transitioned to `Admitted` or `Skipped`.
    Admit(AuthState),
    /// Transitioned to `Rejected`; the transport must be torn down.
    Reject(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    Initiator,
    Responder,
}

// ── Machine ──────────────────────────────────────────────────────────────────

pub struct AuthMachine {
    role: AuthRole,
    state: AuthState,
    /// The challenge we issued, awaiting its echoed response.
    sent_challenge: Option<Vec<u8>>,
}

impl AuthMachine {
    pub fn new(role: AuthRole) -> Self {
        Self {
            role,
            state: AuthState::PendingOpen,
            sent_challenge: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_admitted(&self) -> bool {
        self.state.is_admitted()
    }

    /// The control stream just opened. Announce `auth-skip` when no local
    /// password is set; the initiator with a password issues its challenge.
    pub fn on_open(&mut self, password: Option<&str>) -> Vec<AuthAction> {
        if self.state != AuthState::PendingOpen {
            return Vec::new();
        }
        self.state = AuthState::PendingRemote;

        match password {
            None => vec![AuthAction::SendFrame(ControlFrame::AuthSkip)],
            Some(_) if self.role == AuthRole::Initiator => {
                let mut challenge = vec![0u8; CHALLENGE_LEN];
                rand::thread_rng().fill_bytes(&mut challenge);
                let frame = ControlFrame::AuthChallenge {
                    challenge: BASE64.encode(&challenge),
                };
                self.sent_challenge = Some(challenge);
                vec![AuthAction::SendFrame(frame)]
            }
            // Responder with a password waits for the initiator's challenge.
            Some(_) => Vec::new(),
        }
    }

    /// Evaluate one received auth frame against the admission rules.
    pub fn on_frame(&mut self, frame: &ControlFrame, password: Option<&str>) -> Vec<AuthAction> {
        // The admission transition is monotonic until teardown; anything
        // arriving after resolution is ignored.
        if self.state.is_resolved() {
            debug!(event = "auth_frame_after_resolution", state = ?self.state, "Ignoring auth frame after resolution");
            return Vec::new();
        }

        match (frame, password) {
            // Both sides unprotected: skip.
            (ControlFrame::AuthSkip, None) => self.admit(AuthState::Skipped),

            // Peer demands a password we do not have.
            (ControlFrame::AuthChallenge { .. }, None) => {
                self.reject_with_fail(ErrorKind::PasswordRequired)
            }
            (ControlFrame::AuthResponse { .. }, None) => {
                self.reject_with_fail(ErrorKind::PasswordMismatchPeerHasPassword)
            }

            // We have a password, peer has none.
            (ControlFrame::AuthSkip, Some(_)) => {
                self.reject_with_fail(ErrorKind::PasswordMismatchPeerHasNone)
            }

            // Sign the peer's challenge.
            (ControlFrame::AuthChallenge { challenge }, Some(pw)) => {
                let Ok(nonce) = BASE64.decode(challenge) else {
                    return self.reject_with_fail(ErrorKind::WrongPassword);
                };
                let signature = crypto::sign_challenge(&nonce, pw);
                vec![AuthAction::SendFrame(ControlFrame::AuthResponse {
                    challenge: challenge.clone(),
                    signature: BASE64.encode(signature),
                })]
            }

            // Verify the echoed response against our challenge.
            (ControlFrame::AuthResponse { challenge, signature }, Some(pw)) => {
                let valid = match (&self.sent_challenge, BASE64.decode(challenge), BASE64.decode(signature)) {
                    (Some(sent), Ok(echoed), Ok(mac)) => {
                        sent == &echoed && crypto::verify_challenge(sent, &mac, pw)
                    }
                    _ => false,
                };
                if valid {
                    let mut actions = vec![AuthAction::SendFrame(ControlFrame::AuthOk)];
                    actions.extend(self.admit(AuthState::Admitted));
                    actions
                } else {
                    self.reject_with_fail(ErrorKind::WrongPassword)
                }
            }

            // The initiator verified our response.
            (ControlFrame::AuthOk, Some(_)) => self.admit(AuthState::Admitted),
            (ControlFrame::AuthOk, None) => Vec::new(),

            // The peer gave up on us, at any time.
            (ControlFrame::AuthFail, pw) => {
                let kind = match pw {
                    Some(_) => ErrorKind::WrongPassword,
                    None => ErrorKind::PasswordRequired,
                };
                self.state = AuthState::Rejected;
                vec![AuthAction::Reject(kind)]
            }

            (ControlFrame::Chat { .. }, _) => Vec::new(),
        }
    }

    fn admit(&mut self, state: AuthState) -> Vec<AuthAction> {
        self.state = state;
        vec![AuthAction::Admit(state)]
    }

    fn reject_with_fail(&mut self, kind: ErrorKind) -> Vec<AuthAction> {
        self.state = AuthState::Rejected;
        vec![
            AuthAction::SendFrame(ControlFrame::AuthFail),
            AuthAction::Reject(kind),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `actions` from one machine into the other, returning any
    /// resolution. Simulates a lossless ordered control stream.
    fn pump(
        from: &mut AuthMachine,
        from_pw: Option<&str>,
        to: &mut AuthMachine,
        to_pw: Option<&str>,
        actions: Vec<AuthAction>,
    ) -> Vec<AuthAction> {
        let mut pending = actions;
        let mut out = Vec::new();
        // Alternate delivery direction until no frames are in flight.
        let (mut sender, mut receiver) = (from, to);
        let (mut sender_pw, mut receiver_pw) = (from_pw, to_pw);
        loop {
            let mut next = Vec::new();
            for action in pending {
                match action {
                    AuthAction::SendFrame(frame) => {
                        next.extend(receiver.on_frame(&frame, receiver_pw));
                    }
                    other => out.push(other),
                }
            }
            if next.is_empty() {
                break;
            }
            pending = next;
            std::mem::swap(&mut sender, &mut receiver);
            std::mem::swap(&mut sender_pw, &mut receiver_pw);
        }
        out
    }

    #[test]
    fn no_password_both_sides_skip() {
        let mut alice = AuthMachine::new(AuthRole::Initiator);
        let mut bob = AuthMachine::new(AuthRole::Responder);

        let a_open = alice.on_open(None);
        let b_open = bob.on_open(None);
        pump(&mut alice, None, &mut bob, None, a_open);
        pump(&mut bob, None, &mut alice, None, b_open);

        assert_eq!(alice.state(), AuthState::Skipped);
        assert_eq!(bob.state(), AuthState::Skipped);
        assert!(alice.is_admitted() && bob.is_admitted());
    }

    #[test]
    fn matching_passwords_admit_both_sides() {
        let mut alice = AuthMachine::new(AuthRole::Initiator);
        let mut bob = AuthMachine::new(AuthRole::Responder);

        assert!(bob.on_open(Some("secret")).is_empty());
        let challenge = alice.on_open(Some("secret"));
        assert!(matches!(
            challenge.first(),
            Some(AuthAction::SendFrame(ControlFrame::AuthChallenge { .. }))
        ));

        pump(&mut alice, Some("secret"), &mut bob, Some("secret"), challenge);

        assert_eq!(alice.state(), AuthState::Admitted);
        assert_eq!(bob.state(), AuthState::Admitted);
    }

    #[test]
    fn wrong_password_rejects_both_sides() {
        let mut alice = AuthMachine::new(AuthRole::Initiator);
        let mut bob = AuthMachine::new(AuthRole::Responder);

        bob.on_open(Some("beta"));
        let challenge = alice.on_open(Some("alpha"));
        let resolutions = pump(&mut alice, Some("alpha"), &mut bob, Some("beta"), challenge);

        assert_eq!(alice.state(), AuthState::Rejected);
        assert_eq!(bob.state(), AuthState::Rejected);
        assert!(resolutions.contains(&AuthAction::Reject(ErrorKind::WrongPassword)));
    }

    #[test]
    fn peer_without_password_is_rejected() {
        // Alice protects the room, Bob joins unprotected.
        let mut alice = AuthMachine::new(AuthRole::Initiator);
        let mut bob = AuthMachine::new(AuthRole::Responder);

        let b_open = bob.on_open(None);
        alice.on_open(Some("alpha"));

        // Bob's auth-skip reaches Alice.
        let reaction = pump(&mut bob, None, &mut alice, Some("alpha"), b_open);

        assert_eq!(alice.state(), AuthState::Rejected);
        assert_eq!(bob.state(), AuthState::Rejected);
        assert!(reaction
            .iter()
            .any(|a| *a == AuthAction::Reject(ErrorKind::PasswordMismatchPeerHasNone)
                || *a == AuthAction::Reject(ErrorKind::PasswordRequired)));
    }

    #[test]
    fn local_without_password_rejects_challenge() {
        let mut bob = AuthMachine::new(AuthRole::Responder);
        bob.on_open(None);

        let actions = bob.on_frame(
            &ControlFrame::AuthChallenge {
                challenge: "AAAA".into(),
            },
            None,
        );
        assert_eq!(bob.state(), AuthState::Rejected);
        assert!(actions.contains(&AuthAction::SendFrame(ControlFrame::AuthFail)));
        assert!(actions.contains(&AuthAction::Reject(ErrorKind::PasswordRequired)));
    }

    #[test]
    fn response_without_local_password_flags_peer_password() {
        let mut bob = AuthMachine::new(AuthRole::Responder);
        bob.on_open(None);

        let actions = bob.on_frame(
            &ControlFrame::AuthResponse {
                challenge: "AAAA".into(),
                signature: "BBBB".into(),
            },
            None,
        );
        assert!(actions.contains(&AuthAction::Reject(
            ErrorKind::PasswordMismatchPeerHasPassword
        )));
    }

    #[test]
    fn mismatched_challenge_echo_fails_verification() {
        let mut alice = AuthMachine::new(AuthRole::Initiator);
        alice.on_open(Some("secret"));

        // Signature valid for a different nonce: must not verify.
        let other_nonce = b"not-the-nonce-we-sent-012345678!";
        let signature = crypto::sign_challenge(other_nonce, "secret");
        let actions = alice.on_frame(
            &ControlFrame::AuthResponse {
                challenge: BASE64.encode(other_nonce),
                signature: BASE64.encode(signature),
            },
            Some("secret"),
        );

        assert_eq!(alice.state(), AuthState::Rejected);
        assert!(actions.contains(&AuthAction::Reject(ErrorKind::WrongPassword)));
    }

    #[test]
    fn auth_fail_resolves_to_rejected() {
        let mut bob = AuthMachine::new(AuthRole::Responder);
        bob.on_open(Some("secret"));

        let actions = bob.on_frame(&ControlFrame::AuthFail, Some("secret"));
        assert_eq!(bob.state(), AuthState::Rejected);
        assert_eq!(actions, vec![AuthAction::Reject(ErrorKind::WrongPassword)]);
    }

    #[test]
    fn frames_after_resolution_are_ignored() {
        let mut bob = AuthMachine::new(AuthRole::Responder);
        bob.on_open(None);
        bob.on_frame(&ControlFrame::AuthSkip, None);
        assert_eq!(bob.state(), AuthState::Skipped);

        // A late challenge must not regress the admission.
        let actions = bob.on_frame(
            &ControlFrame::AuthChallenge {
                challenge: "AAAA".into(),
            },
            None,
        );
        assert!(actions.is_empty());
        assert_eq!(bob.state(), AuthState::Skipped);
    }

    #[test]
    fn open_is_idempotent() {
        let mut alice = AuthMachine::new(AuthRole::Initiator);
        let first = alice.on_open(Some("secret"));
        assert_eq!(first.len(), 1);
        assert!(alice.on_open(Some("secret")).is_empty());
    }
}
