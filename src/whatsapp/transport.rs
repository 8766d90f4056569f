//! Transport seam: one chat session per tenant device.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::address::Address;
use crate::store::TenantId;

/// Identity of one pairing attempt. A fresh one is allocated every time a
/// tenant pairs, so stale sessions can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(pub Uuid);

impl DeviceIdentity {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Pairing handshake events. The stream ends by closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A QR payload to render. May repeat as codes refresh.
    Code(String),
    /// The device was linked.
    Success { phone: String },
    /// The current code expired.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
        }
    }
}

/// An uploaded media blob, ready to be referenced by a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle(pub String);

/// Reference to inbound media held by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Image { caption: String, media: MediaRef },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender user part (digits), not yet normalized.
    pub sender: String,
    pub content: MessageContent,
    pub from_me: bool,
}

/// Events a paired session emits after pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    Connected,
    Disconnected,
}

pub type EventCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// One device session on the chat network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the pairing event stream. Must be called before `connect`.
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>, TransportError>;

    async fn connect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn send_text(&self, to: &Address, text: &str) -> Result<(), TransportError>;

    async fn upload_media(&self, data: Vec<u8>, kind: MediaKind) -> Result<MediaHandle, TransportError>;

    async fn send_media(
        &self,
        to: &Address,
        media: &MediaHandle,
        caption: &str,
    ) -> Result<(), TransportError>;

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, TransportError>;

    async fn disconnect(&self);

    /// Install the callback for post-pairing events. Replaces any previous one.
    fn on_event(&self, callback: EventCallback);
}

/// Creates a fresh, unpaired transport session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, tenant: TenantId, device: DeviceIdentity) -> Arc<dyn Transport>;
}

/// Receives every inbound message from every tenant.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, tenant: TenantId, message: InboundMessage);
}
