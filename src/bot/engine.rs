//! Conversation engine: prompt building, the function-calling loop and the
//! pending-photo workflow.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::functions::{
    canonical_fuel, canonical_listing_transmission, canonical_search_transmission, capabilities,
    BotFunction, FunctionError, FunctionOutcome, Refusal, Role,
};
use super::pending::{PendingQueues, PhotoAdded};
use super::prompt::system_prompt;
use crate::llm::{ChatMessage, ChatProvider, ProviderError};
use crate::media;
use crate::store::{
    CarFilters, CatalogStore, ConversationStore, Direction, LeadStore, NewCar, StoredMessage,
    TenantId,
};

pub const PROVIDER_APOLOGY: &str = "Maaf, saya sedang mengalami gangguan. Silakan coba lagi nanti.";
pub const FUNCTION_APOLOGY: &str = "Maaf, terjadi kesalahan saat memproses permintaan Anda.";
pub const CUSTOMER_IMAGE_REPLY: &str = "Terima kasih! Untuk upload mobil, silakan hubungi sales team kami. Saya dapat membantu Anda mencari mobil yang tersedia. Ada yang bisa saya bantu?";
pub const FIRST_PHOTO_ACK: &str =
    "Foto diterima! Upload lebih banyak foto atau ketik detail mobil.\nContoh: Toyota Avanza 2020 185juta AT Bensin";
pub const EMPTY_REPLY: &str = "Maaf, saya belum menangkap maksud Anda. Bisa diulangi?";
pub const PHOTO_SAVE_FAILED: &str = "Maaf, gagal menyimpan foto. Silakan coba lagi.";
pub const CAR_CREATED: &str = "Mobil berhasil ditambahkan ke catalog!";
pub const NO_IMAGES: &str = "Maaf, foto mobil ini belum tersedia.";

const MISSING_FIELDS: &str =
    "Brand, model, tahun, harga, transmisi, dan bahan bakar wajib diisi.";

/// Listing validation bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRules {
    pub min_year: i64,
    pub max_year: i64,
    pub min_price: i64,
    pub max_price: i64,
}

impl Default for ListingRules {
    fn default() -> Self {
        Self {
            min_year: 1990,
            max_year: 2025,
            min_price: 10_000_000,
            max_price: 10_000_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub history_limit: usize,
    pub max_function_rounds: usize,
    pub search_limit: usize,
    pub listing: ListingRules,
    /// `{tenant}` and `{car}` are substituted.
    pub catalog_url_template: String,
    pub enable_lead_capture: bool,
    pub upload_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            history_limit: 10,
            max_function_rounds: 3,
            search_limit: 10,
            listing: ListingRules::default(),
            catalog_url_template: "https://tenant{tenant}.auto-lmk.com/cars/{car}".to_string(),
            enable_lead_capture: false,
            upload_dir: PathBuf::from("data/uploads"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error("LLM call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Function(#[from] FunctionError),
    #[error("still calling functions after {0} rounds")]
    RoundsExhausted(usize),
}

/// Who a function runs on behalf of.
struct Caller<'a> {
    tenant: TenantId,
    sender: &'a str,
    role: Role,
}

pub struct BotEngine {
    provider: Arc<dyn ChatProvider>,
    conversations: Arc<dyn ConversationStore>,
    catalog: Arc<dyn CatalogStore>,
    leads: Arc<dyn LeadStore>,
    pending: Arc<PendingQueues>,
    options: EngineOptions,
}

fn is_cancel(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "batal" | "cancel")
}

/// `10_000_000` → "10 juta", `10_000_000_000` → "10 miliar".
fn rupiah_words(amount: i64) -> String {
    const MILIAR: i64 = 1_000_000_000;
    const JUTA: i64 = 1_000_000;
    if amount >= MILIAR && amount % MILIAR == 0 {
        format!("{} miliar", amount / MILIAR)
    } else if amount >= JUTA && amount % JUTA == 0 {
        format!("{} juta", amount / JUTA)
    } else {
        amount.to_string()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Keep the newest `limit` messages, dropping the inbound turn that is
/// about to be appended anyway.
fn trim_history(mut history: Vec<StoredMessage>, current_text: &str, limit: usize) -> Vec<StoredMessage> {
    if history
        .last()
        .is_some_and(|m| m.direction == Direction::Inbound && m.text == current_text)
    {
        history.pop();
    }
    let excess = history.len().saturating_sub(limit);
    history.drain(..excess);
    history
}

impl BotEngine {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        conversations: Arc<dyn ConversationStore>,
        catalog: Arc<dyn CatalogStore>,
        leads: Arc<dyn LeadStore>,
        pending: Arc<PendingQueues>,
        options: EngineOptions,
    ) -> Self {
        Self { provider, conversations, catalog, leads, pending, options }
    }

    pub fn pending(&self) -> &Arc<PendingQueues> {
        &self.pending
    }

    fn max_photos_notice(&self) -> String {
        format!(
            "Maksimum {} foto tercapai. Silakan ketik detail mobil sekarang.",
            self.pending.max_photos()
        )
    }

    /// Turn one text message into a reply. Never fails: errors become a
    /// fixed apology.
    pub async fn process_message(&self, tenant: TenantId, sender: &str, text: &str, is_staff: bool) -> String {
        let role = Role::from_staff_flag(is_staff);
        info!("🤖 Processing message from {} (tenant {}, {:?})", sender, tenant, role);

        if role == Role::Staff && is_cancel(text) {
            return self.cancel_upload(tenant, sender).await;
        }

        match self.run_turn(Caller { tenant, sender, role }, text, is_staff).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Turn failed for {} (tenant {}): {}", sender, tenant, e);
                match e {
                    TurnError::Provider(_) => PROVIDER_APOLOGY.to_string(),
                    TurnError::Function(_) | TurnError::RoundsExhausted(_) => FUNCTION_APOLOGY.to_string(),
                }
            }
        }
    }

    async fn cancel_upload(&self, tenant: TenantId, sender: &str) -> String {
        let dropped = self.pending.clear_uploads(tenant, sender).await;
        if dropped.is_empty() {
            return "Tidak ada foto yang menunggu untuk diupload.".to_string();
        }
        media::discard(&dropped).await;
        info!("🗑️ {} cancelled upload of {} photo(s)", sender, dropped.len());
        format!("Upload dibatalkan. {} foto dihapus.", dropped.len())
    }

    async fn build_messages(&self, caller: &Caller<'_>, text: &str, is_staff: bool) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_prompt(caller.role, self.pending.max_photos()))];

        let conversation = match self.conversations.get_or_create(caller.tenant, caller.sender, is_staff).await {
            Ok(conversation) => Some(conversation),
            Err(e) => {
                warn!("Failed to load conversation for {}: {}, continuing without history", caller.sender, e);
                None
            }
        };

        if let Some(conversation) = conversation {
            match self.conversations.messages(conversation.id, self.options.history_limit + 1).await {
                Ok(history) => {
                    for msg in trim_history(history, text, self.options.history_limit) {
                        messages.push(match msg.direction {
                            Direction::Inbound => ChatMessage::user(msg.text),
                            Direction::Outbound => ChatMessage::assistant(msg.text),
                        });
                    }
                }
                Err(e) => warn!("Failed to load history for conversation {}: {}", conversation.id, e),
            }
        }

        messages.push(ChatMessage::user(text));
        messages
    }

    async fn run_turn(&self, caller: Caller<'_>, text: &str, is_staff: bool) -> Result<String, TurnError> {
        let mut messages = self.build_messages(&caller, text, is_staff).await;
        let functions = capabilities(caller.role, self.options.enable_lead_capture);
        let mut last_refusal: Option<String> = None;

        let mut response = self.provider.chat(&messages, &functions).await?;

        for round in 0..self.options.max_function_rounds {
            let Some(call) = response.function_call.take() else {
                break;
            };
            info!("🔧 Round {}: {} {}", round + 1, call.name, call.arguments);

            let function = BotFunction::parse(&call.name, &call.arguments, caller.role)?;
            let outcome = self.execute_function(&caller, function).await?;
            if let Some(refusal) = outcome.refusal() {
                info!("Refused {}: {}", call.name, refusal.message);
                last_refusal = Some(refusal.message.clone());
            }

            messages.push(ChatMessage::assistant(response.content));
            messages.push(ChatMessage::function(&call.name, outcome.summary(&call.name)));
            response = self.provider.chat(&messages, &functions).await?;
        }

        if response.function_call.is_some() {
            return Err(TurnError::RoundsExhausted(self.options.max_function_rounds));
        }

        let reply = response.content.trim().to_string();
        if reply.is_empty() {
            if let Some(refusal) = last_refusal {
                return Ok(refusal);
            }
            debug!("Empty reply from LLM");
            return Ok(EMPTY_REPLY.to_string());
        }
        Ok(reply)
    }

    async fn execute_function(&self, caller: &Caller<'_>, function: BotFunction) -> Result<FunctionOutcome, FunctionError> {
        match function {
            BotFunction::SearchCars { brand, model, max_price, transmission, fuel_type } => {
                let filters = CarFilters {
                    brand: non_empty(brand),
                    model: non_empty(model),
                    max_price,
                    transmission: transmission
                        .as_deref()
                        .and_then(canonical_search_transmission)
                        .map(str::to_string),
                    fuel_type: non_empty(fuel_type),
                    limit: self.options.search_limit,
                };
                self.execute_search_cars(caller, &filters).await
            }
            BotFunction::GetCarDetails { car_id } => self.execute_get_car_details(caller, car_id).await,
            BotFunction::SendCarImages { car_id } => self.execute_send_car_images(caller, car_id).await,
            BotFunction::UploadCar { brand, model, year, price, transmission, fuel_type, description } => {
                let fields = UploadFields {
                    brand: non_empty(brand),
                    model: non_empty(model),
                    year: year.filter(|y| *y != 0),
                    price: price.filter(|p| *p != 0),
                    transmission: non_empty(transmission),
                    fuel_type: non_empty(fuel_type),
                    description: non_empty(description),
                };
                self.execute_upload_car(caller, fields).await
            }
            BotFunction::CreateLead { phone_number, name, interested_car_id } => {
                self.execute_create_lead(caller, non_empty(phone_number), non_empty(name), interested_car_id)
                    .await
            }
        }
    }

    async fn execute_search_cars(&self, caller: &Caller<'_>, filters: &CarFilters) -> Result<FunctionOutcome, FunctionError> {
        let cars = self.catalog.search(caller.tenant, filters).await?;
        info!("🔍 Search {:?} → {} car(s)", filters, cars.len());
        Ok(FunctionOutcome::Cars { count: cars.len(), cars })
    }

    async fn execute_get_car_details(&self, caller: &Caller<'_>, car_id: i64) -> Result<FunctionOutcome, FunctionError> {
        let Some(car) = self.catalog.detail(caller.tenant, car_id).await? else {
            return Ok(FunctionOutcome::CarNotFound {
                car_id,
                message: format!("Mobil dengan ID {car_id} tidak ditemukan."),
            });
        };
        let photos = self.catalog.photos(caller.tenant, car_id).await?;
        Ok(FunctionOutcome::CarDetail {
            car,
            photos: photos.into_iter().map(|p| p.file_path).collect(),
        })
    }

    async fn execute_send_car_images(&self, caller: &Caller<'_>, car_id: i64) -> Result<FunctionOutcome, FunctionError> {
        let photos = self.catalog.photos(caller.tenant, car_id).await?;
        if photos.is_empty() {
            return Ok(FunctionOutcome::NoImages { car_id, message: NO_IMAGES.to_string() });
        }

        let paths: Vec<String> = photos.into_iter().map(|p| p.file_path).collect();
        let image_count = paths.len();
        self.pending.queue_outbound(caller.tenant, caller.sender, paths).await;
        info!("📷 Queued {} photo(s) of car {} for {}", image_count, car_id, caller.sender);

        Ok(FunctionOutcome::ImagesQueued {
            car_id,
            image_count,
            message: format!("Mengirimkan {image_count} foto mobil..."),
        })
    }

    async fn execute_upload_car(&self, caller: &Caller<'_>, fields: UploadFields) -> Result<FunctionOutcome, FunctionError> {
        let rules = &self.options.listing;
        let listing = match fields.validate(rules) {
            Ok(listing) => listing,
            Err(refusal) => return Ok(FunctionOutcome::Refused(refusal)),
        };

        let photos = self.pending.uploads(caller.tenant, caller.sender).await;
        if photos.is_empty() {
            return Ok(FunctionOutcome::Refused(Refusal::field(
                "photos",
                "Silakan upload foto mobil terlebih dahulu",
            )));
        }

        let car_id = self.catalog.create_with_photos(caller.tenant, &listing, &photos).await?;
        self.pending.consume_uploads(caller.tenant, caller.sender, photos.len()).await;

        let catalog_url = self
            .options
            .catalog_url_template
            .replace("{tenant}", &caller.tenant.to_string())
            .replace("{car}", &car_id.to_string());
        info!("✅ {} uploaded car {} ({} {} {})", caller.sender, car_id, listing.brand, listing.model, listing.year);

        Ok(FunctionOutcome::CarCreated {
            car_id,
            brand: listing.brand,
            model: listing.model,
            year: listing.year,
            price: listing.price,
            transmission: listing.transmission,
            fuel_type: listing.fuel_type,
            photo_count: photos.len(),
            catalog_url,
            message: CAR_CREATED.to_string(),
        })
    }

    async fn execute_create_lead(
        &self,
        caller: &Caller<'_>,
        phone_number: Option<String>,
        name: Option<String>,
        interested_car_id: Option<i64>,
    ) -> Result<FunctionOutcome, FunctionError> {
        if !self.options.enable_lead_capture {
            return Err(FunctionError::Forbidden("createLead".to_string()));
        }
        let phone_number = phone_number.ok_or(FunctionError::MissingArgument("phone_number"))?;

        let lead_id = self
            .leads
            .create(caller.tenant, &phone_number, name.as_deref(), interested_car_id)
            .await?;
        info!("📝 Lead {} created by {} for {}", lead_id, caller.sender, phone_number);

        Ok(FunctionOutcome::LeadCreated {
            lead_id,
            message: "Lead berhasil dicatat.".to_string(),
        })
    }

    /// Handle an inbound image. Staff photos join the pending upload queue;
    /// everyone else gets a redirect.
    pub async fn handle_image<F, Fut, E>(&self, tenant: TenantId, sender: &str, is_staff: bool, download: F) -> String
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: Display,
    {
        if !is_staff {
            info!("Customer {} sent an image (tenant {}), redirecting", sender, tenant);
            return CUSTOMER_IMAGE_REPLY.to_string();
        }

        if !self.pending.has_room(tenant, sender).await {
            return self.max_photos_notice();
        }

        let data = match download().await {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to download photo from {}: {}", sender, e);
                return PHOTO_SAVE_FAILED.to_string();
            }
        };

        let path = match media::save_upload(&self.options.upload_dir, tenant, &data).await {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                error!("Failed to save photo from {}: {}", sender, e);
                return PHOTO_SAVE_FAILED.to_string();
            }
        };

        match self.pending.add_upload(tenant, sender, path.clone()).await {
            PhotoAdded::Accepted { count: 1 } => FIRST_PHOTO_ACK.to_string(),
            PhotoAdded::Accepted { count } => format!("Foto {count} diterima! Total {count} foto."),
            PhotoAdded::LimitReached { .. } => self.max_photos_notice(),
            PhotoAdded::Rejected { .. } => {
                media::discard(&[path]).await;
                self.max_photos_notice()
            }
        }
    }
}

/// Raw `uploadCar` fields, blanks already removed.
struct UploadFields {
    brand: Option<String>,
    model: Option<String>,
    year: Option<i64>,
    price: Option<i64>,
    transmission: Option<String>,
    fuel_type: Option<String>,
    description: Option<String>,
}

impl UploadFields {
    fn validate(self, rules: &ListingRules) -> Result<NewCar, Refusal> {
        fn missing(field: &str, label: &str) -> Refusal {
            Refusal::field(field, format!("Data tidak lengkap: {label} belum diisi. {MISSING_FIELDS}"))
        }

        let brand = self.brand.ok_or_else(|| missing("brand", "brand"))?;
        let model = self.model.ok_or_else(|| missing("model", "model"))?;
        let year = self.year.ok_or_else(|| missing("year", "tahun"))?;
        let price = self.price.ok_or_else(|| missing("price", "harga"))?;
        let transmission = self.transmission.ok_or_else(|| missing("transmission", "transmisi"))?;
        let fuel_type = self.fuel_type.ok_or_else(|| missing("fuel_type", "bahan bakar"))?;

        if year < rules.min_year || year > rules.max_year {
            return Err(Refusal::field(
                "year",
                format!("Tahun harus antara {} dan {}", rules.min_year, rules.max_year),
            ));
        }
        if price < rules.min_price || price > rules.max_price {
            return Err(Refusal::field(
                "price",
                format!(
                    "Harga harus antara {} dan {}",
                    rupiah_words(rules.min_price),
                    rupiah_words(rules.max_price)
                ),
            ));
        }
        let transmission = canonical_listing_transmission(&transmission)
            .ok_or_else(|| Refusal::field("transmission", "Transmisi harus AT atau MT"))?;
        let fuel_type = canonical_fuel(&fuel_type)
            .ok_or_else(|| Refusal::field("fuel_type", "Bahan bakar harus Bensin atau Diesel"))?;

        Ok(NewCar {
            brand,
            model,
            year: year as i32,
            price,
            transmission: transmission.to_string(),
            fuel_type: fuel_type.to_string(),
            description: self.description,
        })
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn stored(id: i64, text: &str, direction: Direction) -> StoredMessage {
        StoredMessage {
            id,
            conversation_id: 1,
            sender: "628".into(),
            text: text.into(),
            direction,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_rupiah_words() {
        assert_eq!(rupiah_words(10_000_000), "10 juta");
        assert_eq!(rupiah_words(10_000_000_000), "10 miliar");
        assert_eq!(rupiah_words(12_345), "12345");
    }

    #[test]
    fn test_trim_history_drops_current_inbound() {
        let history = vec![
            stored(1, "halo", Direction::Inbound),
            stored(2, "Halo! Ada yang bisa dibantu?", Direction::Outbound),
            stored(3, "cari avanza", Direction::Inbound),
        ];
        let trimmed = trim_history(history, "cari avanza", 10);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[1].text, "Halo! Ada yang bisa dibantu?");
    }

    #[test]
    fn test_trim_history_limit() {
        let history: Vec<_> = (1..=11).map(|i| stored(i, &format!("m{i}"), Direction::Outbound)).collect();
        let trimmed = trim_history(history, "new", 10);
        assert_eq!(trimmed.len(), 10);
        assert_eq!(trimmed[0].text, "m2");
    }

    #[test]
    fn test_cancel_words() {
        assert!(is_cancel(" Batal "));
        assert!(is_cancel("cancel"));
        assert!(!is_cancel("batalkan mobil 3"));
    }
}
