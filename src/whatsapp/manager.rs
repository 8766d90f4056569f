//! Per-tenant session lifecycle and the pairing state machine.
//!
//! States move `Unpaired → QrPending → Paired`, driven only by the pairing
//! event stream of the current attempt. Transport `Connected`/`Disconnected`
//! events refine a session that is already paired.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use super::address::{normalize, Addressing};
use super::qr;
use super::transport::{
    DeviceIdentity, MediaKind, MediaRef, MessageHandler, PairingEvent, Transport, TransportEvent,
    TransportFactory,
};
use super::ConnectionError;
use crate::store::TenantId;

/// Default bound on how long `pair_tenant` waits for the first pairing event.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unpaired,
    QrPending,
    Paired,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unpaired => "unpaired",
            SessionState::QrPending => "qr_pending",
            SessionState::Paired => "paired",
            SessionState::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairResult {
    AlreadyConnected { phone: String },
    QrGenerated { code: String },
    Paired { phone: String },
    /// A pairing attempt is running but has not produced a QR yet.
    PairingInProgress,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Paired { tenant: TenantId, phone: String },
    PairingFailed { tenant: TenantId },
    Disconnected { tenant: TenantId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub phone: Option<String>,
    pub qr_available: bool,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub pairing_timeout: Duration,
    pub qr_dir: PathBuf,
    pub addressing: Addressing,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            qr_dir: PathBuf::from("data/qr"),
            addressing: Addressing::default(),
        }
    }
}

struct TenantSession {
    state: SessionState,
    phone: Option<String>,
    transport: Arc<dyn Transport>,
    device: DeviceIdentity,
    qr_code: Option<String>,
}

impl TenantSession {
    fn is_live(&self) -> bool {
        self.state == SessionState::Paired && self.transport.is_connected()
    }
}

/// What the pairing task reports back to the waiting caller.
enum FirstEvent {
    Code(String),
    Paired(String),
    Closed,
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    sessions: RwLock<HashMap<TenantId, TenantSession>>,
    handler: StdRwLock<Option<Arc<dyn MessageHandler>>>,
    events: broadcast::Sender<SessionEvent>,
    options: ManagerOptions,
}

/// Owns every tenant's WhatsApp session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, options: ManagerOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                factory,
                sessions: RwLock::new(HashMap::new()),
                handler: StdRwLock::new(None),
                events,
                options,
            }),
        }
    }

    /// Register the process-wide inbound message handler.
    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start (or report on) pairing for a tenant.
    pub async fn pair_tenant(&self, tenant: TenantId) -> Result<PairResult, ConnectionError> {
        info!("📱 Pairing tenant {}", tenant);

        let device = DeviceIdentity::new();
        let (transport, stale) = {
            let mut sessions = self.inner.sessions.write().await;
            if let Some(session) = sessions.get(&tenant) {
                if session.is_live() {
                    let phone = session.phone.clone().unwrap_or_default();
                    info!("Tenant {} already connected as {}", tenant, phone);
                    return Ok(PairResult::AlreadyConnected { phone });
                }
                if session.state == SessionState::QrPending {
                    return Ok(match &session.qr_code {
                        Some(code) => PairResult::QrGenerated { code: code.clone() },
                        None => PairResult::PairingInProgress,
                    });
                }
            }

            let stale = sessions.remove(&tenant);
            let transport = self.inner.factory.create(tenant, device);
            sessions.insert(
                tenant,
                TenantSession {
                    state: SessionState::QrPending,
                    phone: None,
                    transport: transport.clone(),
                    device,
                    qr_code: None,
                },
            );
            (transport, stale)
        };

        if let Some(stale) = stale {
            debug!("Releasing stale {} session for tenant {}", stale.state.as_str(), tenant);
            stale.transport.disconnect().await;
        }

        let events = match transport.pairing_events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to open pairing stream for tenant {}: {}", tenant, e);
                self.abandon(tenant, device, &transport).await;
                return Err(e.into());
            }
        };

        if let Err(e) = transport.connect().await {
            error!("Failed to connect tenant {}: {}", tenant, e);
            self.abandon(tenant, device, &transport).await;
            return Err(e.into());
        }

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(run_pairing(self.inner.clone(), tenant, device, transport, events, first_tx));

        match tokio::time::timeout(self.inner.options.pairing_timeout, first_rx).await {
            Ok(Ok(FirstEvent::Code(code))) => Ok(PairResult::QrGenerated { code }),
            Ok(Ok(FirstEvent::Paired(phone))) => Ok(PairResult::Paired { phone }),
            Ok(Ok(FirstEvent::Closed)) | Ok(Err(_)) => Err(ConnectionError::PairingClosed),
            Err(_) => {
                warn!("⏱️ No pairing event for tenant {} within {:?}", tenant, self.inner.options.pairing_timeout);
                Err(ConnectionError::PairingTimeout)
            }
        }
    }

    /// Drop a session that never got going.
    async fn abandon(&self, tenant: TenantId, device: DeviceIdentity, transport: &Arc<dyn Transport>) {
        remove_if_current(&self.inner, tenant, device).await;
        transport.disconnect().await;
    }

    async fn live_transport(&self, tenant: TenantId) -> Result<Arc<dyn Transport>, ConnectionError> {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(&tenant) {
            Some(session) if session.is_live() => Ok(session.transport.clone()),
            _ => Err(ConnectionError::NotConnected(tenant)),
        }
    }

    pub async fn send_message(
        &self,
        tenant: TenantId,
        recipient: &str,
        text: &str,
    ) -> Result<(), ConnectionError> {
        let transport = self.live_transport(tenant).await?;
        let to = normalize(recipient, &self.inner.options.addressing)?;

        transport.send_text(&to, text).await.map_err(ConnectionError::SendFailed)?;
        info!("📤 Sent message to {} (tenant {})", to, tenant);
        Ok(())
    }

    pub async fn send_image(
        &self,
        tenant: TenantId,
        recipient: &str,
        path: &str,
        caption: &str,
    ) -> Result<(), ConnectionError> {
        let transport = self.live_transport(tenant).await?;
        let to = normalize(recipient, &self.inner.options.addressing)?;

        let data = tokio::fs::read(path).await.map_err(|source| ConnectionError::MediaRead {
            path: path.to_string(),
            source,
        })?;
        let handle = transport
            .upload_media(data, MediaKind::Image)
            .await
            .map_err(ConnectionError::Upload)?;
        transport
            .send_media(&to, &handle, caption)
            .await
            .map_err(ConnectionError::SendFailed)?;

        info!("🖼️ Sent image {} to {} (tenant {})", path, to, tenant);
        Ok(())
    }

    pub async fn download_media(&self, tenant: TenantId, media: &MediaRef) -> Result<Vec<u8>, ConnectionError> {
        let transport = self.live_transport(tenant).await?;
        Ok(transport.download_media(media).await?)
    }

    pub async fn is_connected(&self, tenant: TenantId) -> bool {
        let sessions = self.inner.sessions.read().await;
        sessions.get(&tenant).is_some_and(TenantSession::is_live)
    }

    pub async fn phone_number(&self, tenant: TenantId) -> Option<String> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(&tenant).filter(|s| s.is_live()).and_then(|s| s.phone.clone())
    }

    pub async fn status(&self, tenant: TenantId) -> SessionStatus {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(&tenant) {
            Some(session) => SessionStatus {
                state: session.state,
                phone: session.phone.clone(),
                qr_available: session.state == SessionState::QrPending && session.qr_code.is_some(),
            },
            None => SessionStatus { state: SessionState::Unpaired, phone: None, qr_available: false },
        }
    }

    /// Path of the tenant's current QR image, while a QR is pending.
    pub async fn qr_image_path(&self, tenant: TenantId) -> Option<PathBuf> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(&tenant)
            .filter(|s| s.state == SessionState::QrPending && s.qr_code.is_some())
            .map(|_| qr::qr_path(&self.inner.options.qr_dir, tenant))
    }

    pub async fn disconnect(&self, tenant: TenantId) -> Result<(), ConnectionError> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(&tenant)
            .ok_or(ConnectionError::NotFound(tenant))?;

        session.transport.disconnect().await;
        remove_qr_image(&self.inner, tenant).await;
        let _ = self.inner.events.send(SessionEvent::Disconnected { tenant });
        info!("🔌 Disconnected tenant {}", tenant);
        Ok(())
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.inner.sessions.write().await.drain().collect();
        for (tenant, session) in sessions {
            session.transport.disconnect().await;
            debug!("Closed session for tenant {}", tenant);
        }
        info!("WhatsApp sessions closed");
    }
}

async fn remove_if_current(inner: &Inner, tenant: TenantId, device: DeviceIdentity) -> bool {
    let mut sessions = inner.sessions.write().await;
    if sessions.get(&tenant).is_some_and(|s| s.device == device) {
        sessions.remove(&tenant);
        true
    } else {
        false
    }
}

async fn remove_qr_image(inner: &Inner, tenant: TenantId) {
    let path = qr::qr_path(&inner.options.qr_dir, tenant);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove QR image {:?}: {}", path, e);
        }
    }
}

/// Consume one attempt's pairing stream until it succeeds or closes.
async fn run_pairing(
    inner: Arc<Inner>,
    tenant: TenantId,
    device: DeviceIdentity,
    transport: Arc<dyn Transport>,
    mut events: mpsc::Receiver<PairingEvent>,
    first: oneshot::Sender<FirstEvent>,
) {
    let mut first = Some(first);
    let mut codes = 0usize;

    while let Some(event) = events.recv().await {
        match event {
            PairingEvent::Code(code) => {
                codes += 1;
                match qr::write_qr(&inner.options.qr_dir, tenant, &code).await {
                    Ok(path) => info!("🔳 QR code #{} for tenant {} written to {:?}", codes, tenant, path),
                    Err(e) => error!("Failed to render QR for tenant {}: {}", tenant, e),
                }

                let current = {
                    let mut sessions = inner.sessions.write().await;
                    match sessions.get_mut(&tenant) {
                        Some(session) if session.device == device => {
                            session.qr_code = Some(code.clone());
                            true
                        }
                        _ => false,
                    }
                };
                if !current {
                    debug!("Pairing attempt {} for tenant {} superseded", device, tenant);
                    transport.disconnect().await;
                    return;
                }

                if let Some(tx) = first.take() {
                    let _ = tx.send(FirstEvent::Code(code));
                }
            }
            PairingEvent::Timeout => {
                warn!("⌛ QR code expired for tenant {}", tenant);
            }
            PairingEvent::Success { phone } => {
                install_routing(&inner, tenant, device, &transport);

                let promoted = {
                    let mut sessions = inner.sessions.write().await;
                    match sessions.get_mut(&tenant) {
                        Some(session) if session.device == device => {
                            session.state = SessionState::Paired;
                            session.phone = Some(phone.clone());
                            session.qr_code = None;
                            true
                        }
                        _ => false,
                    }
                };

                if !promoted {
                    warn!("Tenant {} paired on a superseded attempt, releasing it", tenant);
                    transport.disconnect().await;
                    return;
                }

                remove_qr_image(&inner, tenant).await;
                info!("✅ Tenant {} paired as {}", tenant, phone);
                let _ = inner.events.send(SessionEvent::Paired { tenant, phone: phone.clone() });
                if let Some(tx) = first.take() {
                    let _ = tx.send(FirstEvent::Paired(phone));
                }
                return;
            }
        }
    }

    info!("Pairing stream for tenant {} closed after {} code(s)", tenant, codes);
    if remove_if_current(&inner, tenant, device).await {
        transport.disconnect().await;
        remove_qr_image(&inner, tenant).await;
        let _ = inner.events.send(SessionEvent::PairingFailed { tenant });
    }
    if let Some(tx) = first.take() {
        let _ = tx.send(FirstEvent::Closed);
    }
}

/// Route post-pairing transport events back into the manager.
fn install_routing(inner: &Arc<Inner>, tenant: TenantId, device: DeviceIdentity, transport: &Arc<dyn Transport>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let runtime = tokio::runtime::Handle::current();

    transport.on_event(Arc::new(move |event| {
        let Some(inner) = weak.upgrade() else { return };
        runtime.spawn(dispatch(inner, tenant, device, event));
    }));
}

async fn dispatch(inner: Arc<Inner>, tenant: TenantId, device: DeviceIdentity, event: TransportEvent) {
    match event {
        TransportEvent::Message(message) => {
            if message.from_me {
                return;
            }
            let handler = inner.handler.read().unwrap_or_else(PoisonError::into_inner).clone();
            match handler {
                Some(handler) => handler.handle(tenant, message).await,
                None => debug!("No message handler set, dropping message for tenant {}", tenant),
            }
        }
        TransportEvent::Connected => {
            let phone = {
                let mut sessions = inner.sessions.write().await;
                match sessions.get_mut(&tenant) {
                    Some(session) if session.device == device && session.state == SessionState::Disconnected => {
                        session.state = SessionState::Paired;
                        session.phone.clone()
                    }
                    _ => None,
                }
            };
            if let Some(phone) = phone {
                info!("🔗 Tenant {} reconnected", tenant);
                let _ = inner.events.send(SessionEvent::Paired { tenant, phone });
            }
        }
        TransportEvent::Disconnected => {
            let dropped = {
                let mut sessions = inner.sessions.write().await;
                match sessions.get_mut(&tenant) {
                    Some(session) if session.device == device && session.state == SessionState::Paired => {
                        session.state = SessionState::Disconnected;
                        true
                    }
                    _ => false,
                }
            };
            if dropped {
                warn!("Tenant {} lost its WhatsApp connection", tenant);
                let _ = inner.events.send(SessionEvent::Disconnected { tenant });
            }
        }
    }
}
