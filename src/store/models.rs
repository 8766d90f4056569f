//! Records exchanged with the persistence adapters.

use serde::{Deserialize, Serialize};

/// A dealership account.
pub type TenantId = i64;

/// Sender recorded on outbound (bot-authored) messages.
pub const BOT_SENDER: &str = "BOT";

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub(crate) fn from_db(s: &str) -> Self {
        match s {
            "outbound" => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }
}

/// One ongoing exchange between a tenant and a single sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub tenant_id: TenantId,
    pub sender: String,
    /// Decided once at creation.
    pub is_staff: bool,
    pub created_at: String,
}

/// A persisted conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub sender: String,
    pub text: String,
    pub direction: Direction,
    pub created_at: String,
}

/// A catalog listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Car {
    pub id: i64,
    pub tenant_id: TenantId,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mileage: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmission: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
    pub is_featured: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarPhoto {
    pub id: i64,
    pub car_id: i64,
    pub file_path: String,
    pub display_order: i32,
}

/// A listing about to be created from chat.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCar {
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub price: i64,
    pub transmission: String,
    pub fuel_type: String,
    pub description: Option<String>,
}

/// Catalog search filters. Every field is optional; search is always scoped
/// to available listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarFilters {
    pub brand: Option<String>,
    pub model: Option<String>,
    pub max_price: Option<i64>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
    pub limit: usize,
}

/// A recorded customer interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Lead {
    pub id: i64,
    pub tenant_id: TenantId,
    pub phone_number: String,
    pub name: Option<String>,
    pub interested_car_id: Option<i64>,
    pub status: String,
}
