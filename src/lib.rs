//! DropSync: serverless peer-to-peer file transfer and chat for two
//! endpoints.
//!
//! A room-scoped relay brokers the initial handshake; after that every
//! byte — file chunks, chat, authentication — travels directly between
//! the peers over WebRTC data channels. An optional password yields
//! end-to-end confidentiality (per-chunk AES-256-GCM) and peer
//! authentication (HMAC challenge-response) without ever putting the
//! password on the wire.
//!
//! The entry point is [`SessionEngine`]: it joins a room, negotiates the
//! peer transport, runs the auth handshake, and fans everything
//! observable out as [`SessionEvent`]s.

pub mod core;
pub mod utils;

pub use crate::core::event::SessionEvent;
pub use crate::core::security::auth::AuthState;
pub use crate::core::session::{SessionConfig, SessionEngine, SessionSnapshot};
pub use crate::core::transfer::{
    ChatMessage, ChatOrigin, DirectorySink, ErrorKind, FileSink, FileTransfer, PendingFile,
    TransferDirection, TransferStatus,
};
