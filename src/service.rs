//! Glue between the WhatsApp sessions and the bot engine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::bot::BotEngine;
use crate::store::{Conversation, ConversationStore, Direction, StaffDirectory, TenantId, BOT_SENDER};
use crate::whatsapp::{
    normalize, Addressing, ConnectionManager, InboundMessage, MediaRef, MessageContent, MessageHandler,
};

/// Caption of the first image in a requested photo batch.
pub const IMAGE_CAPTION: &str = "Foto mobil yang Anda minta";

pub struct BotService {
    engine: Arc<BotEngine>,
    manager: ConnectionManager,
    conversations: Arc<dyn ConversationStore>,
    staff: Arc<dyn StaffDirectory>,
    addressing: Addressing,
}

impl BotService {
    pub fn new(
        engine: Arc<BotEngine>,
        manager: ConnectionManager,
        conversations: Arc<dyn ConversationStore>,
        staff: Arc<dyn StaffDirectory>,
        addressing: Addressing,
    ) -> Self {
        Self { engine, manager, conversations, staff, addressing }
    }

    /// Canonical sender digits, or the raw sender if it cannot be normalized.
    fn sender_key(&self, raw: &str) -> String {
        match normalize(raw, &self.addressing) {
            Ok(address) => address.user().to_string(),
            Err(e) => {
                warn!("Keeping raw sender {:?}: {}", raw, e);
                raw.to_string()
            }
        }
    }

    async fn is_staff(&self, tenant: TenantId, sender: &str) -> bool {
        match self.staff.is_staff(tenant, sender).await {
            Ok(is_staff) => is_staff,
            Err(e) => {
                warn!("Staff lookup failed for {} (tenant {}): {}, treating as customer", sender, tenant, e);
                false
            }
        }
    }

    async fn reply(&self, tenant: TenantId, to: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.manager.send_message(tenant, to, text).await {
            error!("Failed to reply to {} (tenant {}): {}", to, tenant, e);
        }
    }

    async fn handle_image(&self, tenant: TenantId, sender: &str, is_staff: bool, media: MediaRef) {
        info!("🖼️ Image from {} (tenant {})", sender, tenant);
        let manager = &self.manager;
        let reply = self
            .engine
            .handle_image(tenant, sender, is_staff, || async move { manager.download_media(tenant, &media).await })
            .await;
        self.reply(tenant, sender, &reply).await;
    }

    /// The sender's conversation, created with the live staff lookup on
    /// first contact. Its role never changes afterwards.
    async fn conversation(&self, tenant: TenantId, sender: &str) -> (Option<Conversation>, bool) {
        let is_staff = self.is_staff(tenant, sender).await;
        match self.conversations.get_or_create(tenant, sender, is_staff).await {
            Ok(conversation) => {
                let role = conversation.is_staff;
                (Some(conversation), role)
            }
            Err(e) => {
                error!("Failed to load conversation for {} (tenant {}): {}", sender, tenant, e);
                (None, is_staff)
            }
        }
    }

    async fn handle_text(
        &self,
        tenant: TenantId,
        sender: &str,
        conversation: Option<Conversation>,
        is_staff: bool,
        text: &str,
    ) {
        info!("📨 {} (tenant {}): \"{}\"", sender, tenant, text);

        if let Some(conversation) = &conversation {
            if let Err(e) = self.conversations.add_message(conversation.id, sender, text, Direction::Inbound).await {
                error!("Failed to save inbound message from {}: {}", sender, e);
            }
        }

        let reply = self.engine.process_message(tenant, sender, text, is_staff).await;

        if let Some(conversation) = &conversation {
            if let Err(e) = self
                .conversations
                .add_message(conversation.id, BOT_SENDER, &reply, Direction::Outbound)
                .await
            {
                error!("Failed to save reply to {}: {}", sender, e);
            }
        }

        self.reply(tenant, sender, &reply).await;
        self.send_queued_images(tenant, sender).await;
    }

    async fn send_queued_images(&self, tenant: TenantId, sender: &str) {
        let paths = self.engine.pending().take_outbound(tenant, sender).await;
        if paths.is_empty() {
            return;
        }

        let mut sent = 0;
        for (i, path) in paths.iter().enumerate() {
            let caption = if i == 0 { IMAGE_CAPTION } else { "" };
            match self.manager.send_image(tenant, sender, path, caption).await {
                Ok(()) => sent += 1,
                Err(e) => error!("Failed to send image {} to {}: {}", path, sender, e),
            }
        }
        info!("📷 Sent {}/{} image(s) to {} (tenant {})", sent, paths.len(), sender, tenant);
    }
}

#[async_trait]
impl MessageHandler for BotService {
    async fn handle(&self, tenant: TenantId, message: InboundMessage) {
        let sender = self.sender_key(&message.sender);

        match message.content {
            MessageContent::Image { media, .. } => {
                let (_, is_staff) = self.conversation(tenant, &sender).await;
                self.handle_image(tenant, &sender, is_staff, media).await
            }
            MessageContent::Text(text) => {
                if text.trim().is_empty() {
                    return;
                }
                let (conversation, is_staff) = self.conversation(tenant, &sender).await;
                self.handle_text(tenant, &sender, conversation, is_staff, &text).await;
            }
        }
    }
}
