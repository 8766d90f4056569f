//! `Transport` over the WhatsApp sidecar bridge.
//!
//! The bridge wraps a WhatsApp Web client and exposes one session per device
//! ID as JSON over HTTP. Pairing events and inbound traffic are polled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::address::{sender_from_jid, Address};
use super::transport::{
    DeviceIdentity, EventCallback, InboundMessage, MediaHandle, MediaKind, MediaRef,
    MessageContent, PairingEvent, Transport, TransportError, TransportEvent, TransportFactory,
};
use crate::store::TenantId;

/// Creates one bridge session per device.
pub struct BridgeFactory {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl BridgeFactory {
    pub fn new(base_url: &str, poll_interval: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        }
    }
}

impl TransportFactory for BridgeFactory {
    fn create(&self, tenant: TenantId, device: DeviceIdentity) -> Arc<dyn Transport> {
        debug!("Creating bridge session {} for tenant {}", device, tenant);
        Arc::new(BridgeTransport {
            http: self.http.clone(),
            session_url: format!(
                "{}/sessions/{}",
                self.base_url,
                urlencoding::encode(&device.to_string())
            ),
            tenant,
            poll_interval: self.poll_interval,
            connected: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct BridgeTransport {
    http: reqwest::Client,
    session_url: String,
    tenant: TenantId,
    poll_interval: Duration,
    connected: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<EventCallback>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
enum PairingPoll {
    Code { code: String },
    Success { phone: String },
    Timeout,
    Closed,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BridgeEvent {
    Message {
        sender: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image: Option<BridgeImage>,
        #[serde(default)]
        from_me: bool,
    },
    Connected,
    Disconnected,
}

#[derive(Debug, Deserialize, PartialEq)]
struct BridgeImage {
    media_id: String,
    #[serde(default)]
    caption: String,
}

#[derive(Serialize)]
struct SendText<'a> {
    to: String,
    text: &'a str,
}

#[derive(Serialize)]
struct UploadMedia<'a> {
    kind: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    handle: String,
}

#[derive(Serialize)]
struct SendMedia<'a> {
    to: String,
    handle: &'a str,
    caption: &'a str,
}

impl BridgeEvent {
    fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            BridgeEvent::Connected => Some(TransportEvent::Connected),
            BridgeEvent::Disconnected => Some(TransportEvent::Disconnected),
            BridgeEvent::Message { sender, text, image, from_me } => {
                let sender = sender_from_jid(&sender).unwrap_or(sender);
                let content = match (image, text) {
                    (Some(image), _) => MessageContent::Image {
                        caption: image.caption,
                        media: MediaRef(image.media_id),
                    },
                    (None, Some(text)) if !text.is_empty() => MessageContent::Text(text),
                    _ => return None,
                };
                Some(TransportEvent::Message(InboundMessage { sender, content, from_me }))
            }
        }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError(format!("bridge returned {status}: {body}")))
}

impl BridgeTransport {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.session_url, path)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    async fn poll_pairing(&self) -> Result<Option<PairingPoll>, TransportError> {
        let response = check(self.http.get(self.url("/pairing")).send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let poll = response
            .json()
            .await
            .map_err(|e| TransportError(format!("bad pairing event: {e}")))?;
        Ok(Some(poll))
    }

    async fn poll_events(&self) -> Result<Vec<BridgeEvent>, TransportError> {
        let response = check(self.http.get(self.url("/events")).send().await?).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError(format!("bad event batch: {e}")))
    }

    fn clone_handle(&self) -> Self {
        Self {
            http: self.http.clone(),
            session_url: self.session_url.clone(),
            tenant: self.tenant,
            poll_interval: self.poll_interval,
            connected: self.connected.clone(),
            callback: self.callback.clone(),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(8);
        let this = self.clone_handle();

        self.track(tokio::spawn(async move {
            loop {
                let event = match this.poll_pairing().await {
                    Ok(Some(PairingPoll::Code { code })) => PairingEvent::Code(code),
                    Ok(Some(PairingPoll::Success { phone })) => PairingEvent::Success { phone },
                    Ok(Some(PairingPoll::Timeout)) => PairingEvent::Timeout,
                    Ok(Some(PairingPoll::Closed)) => break,
                    Ok(None) => {
                        tokio::time::sleep(this.poll_interval).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Pairing poll failed for tenant {}: {}", this.tenant, e);
                        break;
                    }
                };
                let done = matches!(event, PairingEvent::Success { .. });
                if tx.send(event).await.is_err() || done {
                    break;
                }
            }
            debug!("Pairing poller for tenant {} stopped", this.tenant);
        }));

        Ok(rx)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        check(self.http.post(self.url("/connect")).send().await?).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("🌐 Bridge session for tenant {} connected", self.tenant);

        let this = self.clone_handle();
        self.track(tokio::spawn(async move {
            loop {
                let batch = match this.poll_events().await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("Event poll failed for tenant {}: {}", this.tenant, e);
                        tokio::time::sleep(this.poll_interval).await;
                        continue;
                    }
                };
                if batch.is_empty() {
                    tokio::time::sleep(this.poll_interval).await;
                    continue;
                }

                for event in batch.into_iter().filter_map(BridgeEvent::into_transport_event) {
                    match event {
                        TransportEvent::Connected => this.connected.store(true, Ordering::SeqCst),
                        TransportEvent::Disconnected => this.connected.store(false, Ordering::SeqCst),
                        TransportEvent::Message(_) => {}
                    }
                    let callback = this.callback.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    match callback {
                        Some(callback) => callback(event),
                        None => debug!("No event callback yet for tenant {}, dropping event", this.tenant),
                    }
                }
            }
        }));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, to: &Address, text: &str) -> Result<(), TransportError> {
        let body = SendText { to: to.jid(), text };
        check(self.http.post(self.url("/messages")).json(&body).send().await?).await?;
        Ok(())
    }

    async fn upload_media(&self, data: Vec<u8>, kind: MediaKind) -> Result<MediaHandle, TransportError> {
        let body = UploadMedia { kind: kind.as_str(), data: BASE64.encode(data) };
        let response = check(self.http.post(self.url("/media")).json(&body).send().await?).await?;
        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| TransportError(format!("bad upload response: {e}")))?;
        Ok(MediaHandle(uploaded.handle))
    }

    async fn send_media(
        &self,
        to: &Address,
        media: &MediaHandle,
        caption: &str,
    ) -> Result<(), TransportError> {
        let body = SendMedia { to: to.jid(), handle: &media.0, caption };
        check(self.http.post(self.url("/media/send")).json(&body).send().await?).await?;
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, TransportError> {
        let url = self.url(&format!("/media/{}", urlencoding::encode(&media.0)));
        let response = check(self.http.get(url).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.http.delete(&self.session_url).send().await {
            warn!("Failed to close bridge session for tenant {}: {}", self.tenant, e);
        }
    }

    fn on_event(&self, callback: EventCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }
}
