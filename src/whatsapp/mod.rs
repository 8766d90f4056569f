//! Multi-tenant WhatsApp connectivity.
//!
//! `ConnectionManager` keeps one transport session per tenant, drives the QR
//! pairing handshake and fans inbound messages out to a `MessageHandler`.
//! The transport itself sits behind the `Transport` trait; `bridge` talks to
//! the HTTP sidecar that wraps the WhatsApp Web protocol.

pub mod address;
pub mod bridge;
pub mod manager;
pub mod qr;
pub mod transport;

pub use address::{normalize, sender_from_jid, Address, Addressing};
pub use manager::{
    ConnectionManager, ManagerOptions, PairResult, SessionEvent, SessionState, SessionStatus,
};
pub use transport::{
    DeviceIdentity, InboundMessage, MediaHandle, MediaKind, MediaRef, MessageContent,
    MessageHandler, PairingEvent, Transport, TransportError, TransportEvent, TransportFactory,
};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("tenant {0} is not connected to WhatsApp")]
    NotConnected(i64),
    #[error("tenant {0} not found")]
    NotFound(i64),
    #[error("timed out waiting for pairing events")]
    PairingTimeout,
    #[error("pairing stream closed before any event")]
    PairingClosed,
    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),
    #[error("failed to read media {path}: {source}")]
    MediaRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to upload media: {0}")]
    Upload(TransportError),
    #[error("failed to send: {0}")]
    SendFailed(TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
