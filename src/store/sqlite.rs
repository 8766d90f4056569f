//! SQLite implementation of every persistence adapter.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::info;

use super::models::{
    Car, CarFilters, CarPhoto, Conversation, Direction, Lead, NewCar, StoredMessage, TenantId,
};
use super::{
    CatalogStore, ConversationStore, LeadStore, StaffDirectory, StoreError, TenantStore,
};

/// Default page size when a search does not ask for one.
const DEFAULT_SEARCH_LIMIT: usize = 10;

const CAR_COLUMNS: &str = "id, tenant_id, brand, model, year, price, mileage, transmission, \
     fuel_type, color, description, status, is_featured";

/// Persistent SQLite database for conversations, catalog, leads and staff.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new in-memory database.
    pub fn new() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;

        let (conversations, cars) = store.counts()?;
        info!("Loaded database from {:?} ({} conversations, {} cars)", path, conversations, cars);
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL,
                sender_phone TEXT NOT NULL,
                is_sales INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, sender_phone)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id),
                sender_phone TEXT NOT NULL,
                message_text TEXT NOT NULL,
                direction TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cars (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL,
                brand TEXT NOT NULL,
                model TEXT NOT NULL,
                year INTEGER NOT NULL,
                price INTEGER NOT NULL,
                mileage INTEGER,
                transmission TEXT,
                fuel_type TEXT,
                color TEXT,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'available',
                is_featured INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS car_photos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                car_id INTEGER NOT NULL REFERENCES cars(id),
                file_path TEXT NOT NULL,
                display_order INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL,
                phone_number TEXT NOT NULL,
                name TEXT,
                interested_car_id INTEGER,
                status TEXT NOT NULL DEFAULT 'new',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sales (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL,
                phone_number TEXT NOT NULL,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (tenant_id, phone_number)
            );

            CREATE TABLE IF NOT EXISTS tenants (
                id INTEGER PRIMARY KEY,
                pairing_status TEXT NOT NULL DEFAULT 'unpaired',
                whatsapp_number TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_cars_tenant_status ON cars(tenant_id, status);
            CREATE INDEX IF NOT EXISTS idx_car_photos_car ON car_photos(car_id);
        "#,
        )?;
        Ok(())
    }

    fn counts(&self) -> Result<(i64, i64), StoreError> {
        let conn = self.conn();
        let conversations = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        let cars = conn.query_row("SELECT COUNT(*) FROM cars", [], |row| row.get(0))?;
        Ok((conversations, cars))
    }

    // ==================== SEEDING / ADMIN ====================

    /// Register a sales staff phone number for a tenant.
    pub fn add_staff(&self, tenant: TenantId, phone_number: &str, name: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sales (tenant_id, phone_number, name, is_active) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(tenant_id, phone_number) DO UPDATE SET name = ?3, is_active = 1",
            params![tenant, phone_number, name],
        )?;
        Ok(())
    }

    /// Latest recorded pairing status and phone for a tenant.
    pub fn pairing_record(&self, tenant: TenantId) -> Result<Option<(String, Option<String>)>, StoreError> {
        let record = self
            .conn()
            .query_row(
                "SELECT pairing_status, whatsapp_number FROM tenants WHERE id = ?1",
                params![tenant],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(record)
    }

    pub fn lead(&self, lead_id: i64) -> Result<Option<Lead>, StoreError> {
        let lead = self
            .conn()
            .query_row(
                "SELECT id, tenant_id, phone_number, name, interested_car_id, status FROM leads WHERE id = ?1",
                params![lead_id],
                |row| {
                    Ok(Lead {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        phone_number: row.get(2)?,
                        name: row.get(3)?,
                        interested_car_id: row.get(4)?,
                        status: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(lead)
    }
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn car_from_row(row: &Row<'_>) -> rusqlite::Result<Car> {
    Ok(Car {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        brand: row.get(2)?,
        model: row.get(3)?,
        year: row.get(4)?,
        price: row.get(5)?,
        mileage: row.get(6)?,
        transmission: row.get(7)?,
        fuel_type: row.get(8)?,
        color: row.get(9)?,
        description: row.get(10)?,
        status: row.get(11)?,
        is_featured: row.get(12)?,
    })
}

/// Stored spellings that count as the given transmission.
fn transmission_aliases(transmission: &str) -> &'static [&'static str] {
    match transmission.to_lowercase().as_str() {
        "automatic" | "at" | "matic" => &["automatic", "at", "matic"],
        "manual" | "mt" => &["manual", "mt"],
        _ => &[],
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_or_create(
        &self,
        tenant: TenantId,
        sender: &str,
        is_staff: bool,
    ) -> Result<Conversation, StoreError> {
        let conn = self.conn();
        let timestamp = now();

        // The staff flag is only written on insert.
        conn.execute(
            "INSERT INTO conversations (tenant_id, sender_phone, is_sales, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(tenant_id, sender_phone) DO UPDATE SET updated_at = ?4",
            params![tenant, sender, is_staff, timestamp],
        )?;

        let conversation = conn.query_row(
            "SELECT id, tenant_id, sender_phone, is_sales, created_at
             FROM conversations WHERE tenant_id = ?1 AND sender_phone = ?2",
            params![tenant, sender],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    sender: row.get(2)?,
                    is_staff: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )?;
        Ok(conversation)
    }

    async fn add_message(
        &self,
        conversation_id: i64,
        sender: &str,
        text: &str,
        direction: Direction,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO messages (conversation_id, sender_phone, message_text, direction, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, sender, text, direction.as_str(), now()],
        )?;
        Ok(())
    }

    async fn messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_phone, message_text, direction, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
            let direction: String = row.get(4)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender: row.get(2)?,
                text: row.get(3)?,
                direction: Direction::from_db(&direction),
                created_at: row.get(5)?,
            })
        })?;

        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn search(&self, tenant: TenantId, filters: &CarFilters) -> Result<Vec<Car>, StoreError> {
        let mut sql = format!(
            "SELECT {CAR_COLUMNS} FROM cars WHERE tenant_id = ? AND status = 'available'"
        );
        let mut args: Vec<Value> = vec![Value::Integer(tenant)];

        if let Some(brand) = filters.brand.as_deref().filter(|b| !b.is_empty()) {
            sql.push_str(" AND LOWER(brand) = LOWER(?)");
            args.push(Value::Text(brand.to_string()));
        }
        if let Some(model) = filters.model.as_deref().filter(|m| !m.is_empty()) {
            sql.push_str(" AND model LIKE ?");
            args.push(Value::Text(format!("%{model}%")));
        }
        if let Some(max_price) = filters.max_price.filter(|p| *p > 0) {
            sql.push_str(" AND price <= ?");
            args.push(Value::Integer(max_price));
        }
        if let Some(transmission) = filters.transmission.as_deref() {
            let aliases = transmission_aliases(transmission);
            if !aliases.is_empty() {
                let placeholders = vec!["?"; aliases.len()].join(", ");
                sql.push_str(&format!(" AND LOWER(transmission) IN ({placeholders})"));
                args.extend(aliases.iter().map(|a| Value::Text(a.to_string())));
            }
        }
        if let Some(fuel_type) = filters.fuel_type.as_deref().filter(|f| !f.is_empty()) {
            sql.push_str(" AND LOWER(fuel_type) = LOWER(?)");
            args.push(Value::Text(fuel_type.to_string()));
        }

        let limit = if filters.limit == 0 { DEFAULT_SEARCH_LIMIT } else { filters.limit };
        sql.push_str(" ORDER BY is_featured DESC, id DESC LIMIT ?");
        args.push(Value::Integer(limit as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let cars = stmt
            .query_map(params_from_iter(args.iter()), car_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cars)
    }

    async fn detail(&self, tenant: TenantId, car_id: i64) -> Result<Option<Car>, StoreError> {
        let car = self
            .conn()
            .query_row(
                &format!("SELECT {CAR_COLUMNS} FROM cars WHERE tenant_id = ?1 AND id = ?2"),
                params![tenant, car_id],
                car_from_row,
            )
            .optional()?;
        Ok(car)
    }

    async fn photos(&self, tenant: TenantId, car_id: i64) -> Result<Vec<CarPhoto>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.car_id, p.file_path, p.display_order
             FROM car_photos p JOIN cars c ON c.id = p.car_id
             WHERE c.tenant_id = ?1 AND p.car_id = ?2
             ORDER BY p.display_order",
        )?;
        let photos = stmt
            .query_map(params![tenant, car_id], |row| {
                Ok(CarPhoto {
                    id: row.get(0)?,
                    car_id: row.get(1)?,
                    file_path: row.get(2)?,
                    display_order: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(photos)
    }

    async fn create_with_photos(
        &self,
        tenant: TenantId,
        car: &NewCar,
        photo_paths: &[String],
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO cars (tenant_id, brand, model, year, price, transmission, fuel_type,
                               description, status, is_featured, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'available', 0, ?9)",
            params![
                tenant,
                car.brand,
                car.model,
                car.year,
                car.price,
                car.transmission,
                car.fuel_type,
                car.description,
                now()
            ],
        )?;
        let car_id = tx.last_insert_rowid();

        for (i, path) in photo_paths.iter().filter(|p| !p.is_empty()).enumerate() {
            tx.execute(
                "INSERT INTO car_photos (car_id, file_path, display_order) VALUES (?1, ?2, ?3)",
                params![car_id, path, (i + 1) as i64],
            )?;
        }

        tx.commit()?;
        info!("🚗 Created car {} for tenant {} with {} photo(s)", car_id, tenant, photo_paths.len());
        Ok(car_id)
    }
}

#[async_trait]
impl LeadStore for SqliteStore {
    async fn create(
        &self,
        tenant: TenantId,
        phone_number: &str,
        name: Option<&str>,
        interested_car_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        if phone_number.trim().is_empty() {
            return Err(StoreError::Invalid("lead phone_number is empty".into()));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO leads (tenant_id, phone_number, name, interested_car_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'new', ?5)",
            params![tenant, phone_number, name, interested_car_id, now()],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[async_trait]
impl StaffDirectory for SqliteStore {
    async fn is_staff(&self, tenant: TenantId, phone_number: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sales WHERE tenant_id = ?1 AND phone_number = ?2 AND is_active = 1",
            params![tenant, phone_number],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn record_pairing(
        &self,
        tenant: TenantId,
        status: &str,
        phone_number: Option<&str>,
    ) -> Result<(), StoreError> {
        // A failed or dropped pairing keeps the last known number.
        self.conn().execute(
            "INSERT INTO tenants (id, pairing_status, whatsapp_number, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                pairing_status = ?2,
                whatsapp_number = COALESCE(?3, whatsapp_number),
                updated_at = ?4",
            params![tenant, status, phone_number, now()],
        )?;
        Ok(())
    }
}
