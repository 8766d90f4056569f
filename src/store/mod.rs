//! Persistence adapters consumed by the bot.
//!
//! The bot only sees these traits. `SqliteStore` implements all of them.

pub mod models;
pub mod sqlite;

use async_trait::async_trait;

pub use models::{
    Car, CarFilters, CarPhoto, Conversation, Direction, Lead, NewCar, StoredMessage, TenantId,
    BOT_SENDER,
};
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Find the conversation for (tenant, sender) or create it. Repeated calls
    /// return the same conversation.
    async fn get_or_create(
        &self,
        tenant: TenantId,
        sender: &str,
        is_staff: bool,
    ) -> Result<Conversation, StoreError>;

    async fn add_message(
        &self,
        conversation_id: i64,
        sender: &str,
        text: &str,
        direction: Direction,
    ) -> Result<(), StoreError>;

    /// The most recent `limit` messages, oldest first.
    async fn messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Dealership inventory.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn search(&self, tenant: TenantId, filters: &CarFilters) -> Result<Vec<Car>, StoreError>;

    async fn detail(&self, tenant: TenantId, car_id: i64) -> Result<Option<Car>, StoreError>;

    async fn photos(&self, tenant: TenantId, car_id: i64) -> Result<Vec<CarPhoto>, StoreError>;

    /// Create a listing and attach photos in order. Returns the new car ID.
    async fn create_with_photos(
        &self,
        tenant: TenantId,
        car: &NewCar,
        photo_paths: &[String],
    ) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn create(
        &self,
        tenant: TenantId,
        phone_number: &str,
        name: Option<&str>,
        interested_car_id: Option<i64>,
    ) -> Result<i64, StoreError>;
}

/// Registered sales staff per tenant.
#[async_trait]
pub trait StaffDirectory: Send + Sync {
    async fn is_staff(&self, tenant: TenantId, phone_number: &str) -> Result<bool, StoreError>;
}

/// Tenant pairing bookkeeping.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn record_pairing(
        &self,
        tenant: TenantId,
        status: &str,
        phone_number: Option<&str>,
    ) -> Result<(), StoreError>;
}
