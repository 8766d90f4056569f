//! Behaviour tests for the bot engine, driven by a scripted LLM.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use super::engine::{
    CUSTOMER_IMAGE_REPLY, EMPTY_REPLY, FIRST_PHOTO_ACK, FUNCTION_APOLOGY, PHOTO_SAVE_FAILED, PROVIDER_APOLOGY,
};
use super::*;
use crate::llm::{ChatMessage, ChatProvider, FunctionCall, FunctionSpec, ProviderError, ProviderResponse, Role as ChatRole};
use crate::store::{CatalogStore, ConversationStore, Direction, NewCar, SqliteStore};

const TENANT: i64 = 1;
const STAFF: &str = "6281100000001";
const CUSTOMER: &str = "6281200000002";

/// One recorded `chat` call.
struct Recorded {
    messages: Vec<ChatMessage>,
    functions: Vec<String>,
}

struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    calls: Mutex<Vec<Recorded>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self { script: Mutex::new(script.into()), calls: Mutex::new(Vec::new()) }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn functions_offered(&self, call: usize) -> Vec<String> {
        self.calls.lock().unwrap()[call].functions.clone()
    }

    fn messages(&self, call: usize) -> Vec<ChatMessage> {
        self.calls.lock().unwrap()[call].messages.clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionSpec],
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().unwrap().push(Recorded {
            messages: messages.to_vec(),
            functions: functions.iter().map(|f| f.name.clone()).collect(),
        });
        self.script.lock().unwrap().pop_front().unwrap_or(Err(ProviderError::Empty))
    }
}

fn text(content: &str) -> Result<ProviderResponse, ProviderError> {
    Ok(ProviderResponse { content: content.to_string(), function_call: None })
}

fn call(name: &str, arguments: Value) -> Result<ProviderResponse, ProviderError> {
    Ok(ProviderResponse {
        content: String::new(),
        function_call: Some(FunctionCall { name: name.to_string(), arguments }),
    })
}

struct Harness {
    engine: BotEngine,
    store: Arc<SqliteStore>,
    provider: Arc<ScriptedProvider>,
    pending: Arc<PendingQueues>,
    _dir: TempDir,
}

fn harness_with(options: EngineOptions, script: Vec<Result<ProviderResponse, ProviderError>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new().unwrap());
    let provider = Arc::new(ScriptedProvider::new(script));
    let pending = Arc::new(PendingQueues::new(5, Duration::from_secs(3600)));
    let options = EngineOptions { upload_dir: dir.path().join("uploads"), ..options };

    let engine = BotEngine::new(
        provider.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        pending.clone(),
        options,
    );
    Harness { engine, store, provider, pending, _dir: dir }
}

fn harness(script: Vec<Result<ProviderResponse, ProviderError>>) -> Harness {
    harness_with(EngineOptions::default(), script)
}

impl Harness {
    async fn staff_photo(&self) -> String {
        self.engine
            .handle_image(TENANT, STAFF, true, || async { Ok::<_, String>(b"jpeg".to_vec()) })
            .await
    }

    async fn seed_car(&self, brand: &str, model: &str, price: i64, photos: &[&str]) -> i64 {
        let car = NewCar {
            brand: brand.to_string(),
            model: model.to_string(),
            year: 2021,
            price,
            transmission: "AT".to_string(),
            fuel_type: "Bensin".to_string(),
            description: None,
        };
        let photos: Vec<String> = photos.iter().map(|p| p.to_string()).collect();
        self.store.create_with_photos(TENANT, &car, &photos).await.unwrap()
    }

    /// The function-result message of the given provider call.
    fn function_result(&self, call: usize) -> String {
        let messages = self.provider.messages(call);
        let last = messages.last().unwrap();
        assert_eq!(last.role, ChatRole::Function);
        last.content.clone()
    }
}

fn upload_args(year: Value, price: Value) -> Value {
    json!({
        "brand": "Toyota",
        "model": "Avanza",
        "year": year,
        "price": price,
        "transmission": "AT",
        "fuel_type": "Bensin"
    })
}

// =============================================================================
// PROMPT AND HISTORY
// =============================================================================

mod prompt_and_history {
    use super::*;

    #[tokio::test]
    async fn test_plain_reply() {
        let h = harness(vec![text("Halo! Ada yang bisa saya bantu?")]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "halo", false).await;

        assert_eq!(reply, "Halo! Ada yang bisa saya bantu?");
        let messages = h.provider.messages(0);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains("CUSTOMER"));
        assert_eq!(messages.last().unwrap(), &ChatMessage::user("halo"));
    }

    #[tokio::test]
    async fn test_staff_gets_staff_prompt() {
        let h = harness(vec![text("Siap")]);
        h.engine.process_message(TENANT, STAFF, "halo", true).await;
        assert!(h.provider.messages(0)[0].content.contains("SALES TEAM"));
    }

    #[tokio::test]
    async fn test_history_replayed_by_direction_without_duplicate() {
        let h = harness(vec![text("Ada, Avanza 2021.")]);
        let conv = h.store.get_or_create(TENANT, CUSTOMER, false).await.unwrap();
        h.store.add_message(conv.id, CUSTOMER, "halo", Direction::Inbound).await.unwrap();
        h.store.add_message(conv.id, "BOT", "Halo juga!", Direction::Outbound).await.unwrap();
        // The orchestrator persists the inbound turn before processing.
        h.store.add_message(conv.id, CUSTOMER, "ada avanza?", Direction::Inbound).await.unwrap();

        h.engine.process_message(TENANT, CUSTOMER, "ada avanza?", false).await;

        let messages = h.provider.messages(0);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1], ChatMessage::user("halo"));
        assert_eq!(messages[2], ChatMessage::assistant("Halo juga!"));
        assert_eq!(messages[3], ChatMessage::user("ada avanza?"));
    }

    #[tokio::test]
    async fn test_history_limited() {
        let h = harness_with(EngineOptions { history_limit: 2, ..Default::default() }, vec![text("ok")]);
        let conv = h.store.get_or_create(TENANT, CUSTOMER, false).await.unwrap();
        for i in 1..=5 {
            h.store.add_message(conv.id, CUSTOMER, &format!("m{i}"), Direction::Inbound).await.unwrap();
        }

        h.engine.process_message(TENANT, CUSTOMER, "baru", false).await;

        let messages = h.provider.messages(0);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content, "m4");
        assert_eq!(messages[2].content, "m5");
    }
}

// =============================================================================
// CAPABILITIES AND ROLES
// =============================================================================

mod capabilities_and_roles {
    use super::*;

    #[tokio::test]
    async fn test_customer_search_flow() {
        let h = harness(vec![
            call("searchCars", json!({"brand": "Toyota", "max_price": 200000000})),
            text("Ada Toyota Avanza seharga 185 juta."),
        ]);
        h.seed_car("Toyota", "Avanza", 185_000_000, &[]).await;
        h.seed_car("Toyota", "Fortuner", 550_000_000, &[]).await;
        h.seed_car("Honda", "Brio", 150_000_000, &[]).await;

        let reply = h.engine.process_message(TENANT, CUSTOMER, "cari toyota dibawah 200 juta", false).await;

        assert_eq!(reply, "Ada Toyota Avanza seharga 185 juta.");
        assert_eq!(h.provider.functions_offered(0), vec!["searchCars", "getCarDetails", "sendCarImages"]);
        let result = h.function_result(1);
        assert!(result.starts_with("Hasil fungsi searchCars: "));
        assert!(result.contains("\"count\":1"));
        assert!(result.contains("Avanza"));
        assert!(!result.contains("Fortuner"));
    }

    #[tokio::test]
    async fn test_staff_sees_upload() {
        let h = harness(vec![text("ok")]);
        h.engine.process_message(TENANT, STAFF, "halo", true).await;
        assert!(h.provider.functions_offered(0).contains(&"uploadCar".to_string()));
        assert!(!h.provider.functions_offered(0).contains(&"createLead".to_string()));
    }

    #[tokio::test]
    async fn test_customer_calling_upload_is_refused() {
        let h = harness(vec![call("uploadCar", upload_args(json!(2020), json!(185000000)))]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "upload mobil", false).await;

        assert_eq!(reply, FUNCTION_APOLOGY);
        assert_eq!(h.provider.call_count(), 1);
        assert!(h.store.search(TENANT, &Default::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lead_capture_when_enabled() {
        let h = harness_with(
            EngineOptions { enable_lead_capture: true, ..Default::default() },
            vec![
                call("createLead", json!({"phone_number": "628555", "name": "Sari", "interested_car_id": "4"})),
                text("Lead dicatat."),
            ],
        );
        let reply = h.engine.process_message(TENANT, STAFF, "catat lead Sari 628555", true).await;

        assert_eq!(reply, "Lead dicatat.");
        assert!(h.provider.functions_offered(0).contains(&"createLead".to_string()));
        assert!(h.function_result(1).contains("lead_created"));
        let lead = h.store.lead(1).unwrap().unwrap();
        assert_eq!(lead.interested_car_id, Some(4));
    }

    #[tokio::test]
    async fn test_lead_without_phone_is_error() {
        let h = harness_with(
            EngineOptions { enable_lead_capture: true, ..Default::default() },
            vec![call("createLead", json!({"name": "Sari"}))],
        );
        let reply = h.engine.process_message(TENANT, STAFF, "catat lead", true).await;
        assert_eq!(reply, FUNCTION_APOLOGY);
    }

    #[tokio::test]
    async fn test_lead_disabled_is_refused() {
        let h = harness(vec![call("createLead", json!({"phone_number": "628555"}))]);
        let reply = h.engine.process_message(TENANT, STAFF, "catat lead", true).await;
        assert_eq!(reply, FUNCTION_APOLOGY);
    }
}

// =============================================================================
// FUNCTION LOOP ERRORS
// =============================================================================

mod loop_errors {
    use super::*;

    #[tokio::test]
    async fn test_provider_error_apology() {
        let h = harness(vec![Err(ProviderError::Http("connection refused".into()))]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "halo", false).await;
        assert_eq!(reply, PROVIDER_APOLOGY);
    }

    #[tokio::test]
    async fn test_provider_error_after_function() {
        let h = harness(vec![
            call("searchCars", json!({})),
            Err(ProviderError::Api("500".into())),
        ]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "ada mobil apa?", false).await;
        assert_eq!(reply, PROVIDER_APOLOGY);
    }

    #[tokio::test]
    async fn test_blank_reply_gets_fallback() {
        let h = harness(vec![text("   ")]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "halo", false).await;
        assert_eq!(reply, EMPTY_REPLY);
    }

    #[tokio::test]
    async fn test_unknown_function_apology() {
        let h = harness(vec![call("deleteAllCars", json!({}))]);
        let reply = h.engine.process_message(TENANT, STAFF, "hapus semua", true).await;
        assert_eq!(reply, FUNCTION_APOLOGY);
    }

    #[tokio::test]
    async fn test_non_numeric_car_id_apology() {
        let h = harness(vec![call("getCarDetails", json!({"car_id": "avanza"}))]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "detail avanza", false).await;
        assert_eq!(reply, FUNCTION_APOLOGY);
    }

    #[tokio::test]
    async fn test_rounds_are_bounded() {
        let h = harness(vec![
            call("searchCars", json!({})),
            call("searchCars", json!({})),
            call("searchCars", json!({})),
            call("searchCars", json!({})),
        ]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "cari", false).await;

        assert_eq!(reply, FUNCTION_APOLOGY);
        assert_eq!(h.provider.call_count(), 4);
    }

    #[tokio::test]
    async fn test_multiple_rounds_then_answer() {
        let h = harness(vec![
            call("searchCars", json!({"brand": "Honda"})),
            call("getCarDetails", json!({"car_id": 1})),
            text("Honda Brio 2021, 150 juta."),
        ]);
        h.seed_car("Honda", "Brio", 150_000_000, &["brio.jpg"]).await;

        let reply = h.engine.process_message(TENANT, CUSTOMER, "ada honda?", false).await;

        assert_eq!(reply, "Honda Brio 2021, 150 juta.");
        let detail = h.function_result(2);
        assert!(detail.contains("car_detail"));
        assert!(detail.contains("brio.jpg"));
    }

    #[tokio::test]
    async fn test_unknown_car_is_not_found_outcome() {
        let h = harness(vec![call("getCarDetails", json!({"car_id": 99})), text("Mobil tidak ditemukan.")]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "detail 99", false).await;

        assert_eq!(reply, "Mobil tidak ditemukan.");
        assert!(h.function_result(1).contains("car_not_found"));
    }
}

// =============================================================================
// CAR IMAGES
// =============================================================================

mod car_images {
    use super::*;

    #[tokio::test]
    async fn test_send_car_images_queues_outbound() {
        let h = harness(vec![call("sendCarImages", json!({"car_id": 1})), text("Berikut fotonya.")]);
        h.seed_car("Toyota", "Avanza", 185_000_000, &["a.jpg", "b.jpg"]).await;

        h.engine.process_message(TENANT, CUSTOMER, "kirim foto", false).await;

        assert!(h.function_result(1).contains("Mengirimkan 2 foto mobil..."));
        assert_eq!(h.pending.take_outbound(TENANT, CUSTOMER).await, vec!["a.jpg", "b.jpg"]);
        assert!(h.pending.uploads(TENANT, CUSTOMER).await.is_empty());
    }

    #[tokio::test]
    async fn test_send_car_images_without_photos() {
        let h = harness(vec![call("sendCarImages", json!({"car_id": 1})), text("Maaf, belum ada foto.")]);
        h.seed_car("Toyota", "Avanza", 185_000_000, &[]).await;

        h.engine.process_message(TENANT, CUSTOMER, "kirim foto", false).await;

        assert!(h.function_result(1).contains("no_images"));
        assert!(h.pending.take_outbound(TENANT, CUSTOMER).await.is_empty());
    }
}

// =============================================================================
// PHOTO UPLOAD WORKFLOW
// =============================================================================

mod photo_upload {
    use super::*;

    #[tokio::test]
    async fn test_customer_image_never_queued() {
        let h = harness(vec![]);
        let reply = h
            .engine
            .handle_image(TENANT, CUSTOMER, false, || async { Ok::<_, String>(b"jpeg".to_vec()) })
            .await;

        assert_eq!(reply, CUSTOMER_IMAGE_REPLY);
        assert!(h.pending.uploads(TENANT, CUSTOMER).await.is_empty());
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_running_count_and_cap() {
        let h = harness(vec![]);

        assert_eq!(h.staff_photo().await, FIRST_PHOTO_ACK);
        assert_eq!(h.staff_photo().await, "Foto 2 diterima! Total 2 foto.");
        assert_eq!(h.staff_photo().await, "Foto 3 diterima! Total 3 foto.");
        assert_eq!(h.staff_photo().await, "Foto 4 diterima! Total 4 foto.");

        let max = "Maksimum 5 foto tercapai. Silakan ketik detail mobil sekarang.";
        assert_eq!(h.staff_photo().await, max);
        assert_eq!(h.pending.uploads(TENANT, STAFF).await.len(), 5);

        assert_eq!(h.staff_photo().await, max);
        assert_eq!(h.pending.uploads(TENANT, STAFF).await.len(), 5);
    }

    #[tokio::test]
    async fn test_download_failure() {
        let h = harness(vec![]);
        let reply = h
            .engine
            .handle_image(TENANT, STAFF, true, || async { Err::<Vec<u8>, _>("media expired") })
            .await;

        assert_eq!(reply, PHOTO_SAVE_FAILED);
        assert!(h.pending.uploads(TENANT, STAFF).await.is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_photos_refuses() {
        let h = harness(vec![
            call("uploadCar", upload_args(json!(2024), json!(200000000))),
            text(""),
        ]);
        let reply = h.engine.process_message(TENANT, STAFF, "Toyota Avanza 2024 200jt AT Bensin", true).await;

        assert_eq!(reply, "Silakan upload foto mobil terlebih dahulu");
        assert!(h.store.search(TENANT, &Default::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_year_out_of_range_refused() {
        let h = harness(vec![
            call("uploadCar", upload_args(json!(1980), json!(200000000))),
            text(""),
        ]);
        h.staff_photo().await;

        let reply = h.engine.process_message(TENANT, STAFF, "Toyota Avanza 1980 200jt AT Bensin", true).await;

        assert_eq!(reply, "Tahun harus antara 1990 dan 2025");
        assert!(h.function_result(1).contains("\"field\":\"year\""));
        assert_eq!(h.pending.uploads(TENANT, STAFF).await.len(), 1);
    }

    #[tokio::test]
    async fn test_price_out_of_range_refused() {
        let h = harness(vec![
            call("uploadCar", upload_args(json!(2024), json!(1))),
            text("Harga tidak valid, mohon cek lagi."),
        ]);
        h.staff_photo().await;

        let reply = h.engine.process_message(TENANT, STAFF, "Toyota Avanza 2024 1 AT Bensin", true).await;

        assert_eq!(reply, "Harga tidak valid, mohon cek lagi.");
        let result = h.function_result(1);
        assert!(result.contains("\"field\":\"price\""));
        assert!(result.contains("Harga harus antara 10 juta dan 10 miliar"));
    }

    #[tokio::test]
    async fn test_missing_field_named() {
        let h = harness(vec![
            call("uploadCar", json!({"brand": "Toyota", "model": "Avanza", "year": 2020, "price": 185000000, "transmission": "AT"})),
            text(""),
        ]);
        h.staff_photo().await;

        let reply = h.engine.process_message(TENANT, STAFF, "Toyota Avanza 2020 185jt AT", true).await;

        assert!(reply.starts_with("Data tidak lengkap: bahan bakar belum diisi."));
        assert!(h.function_result(1).contains("\"field\":\"fuel_type\""));
    }

    #[tokio::test]
    async fn test_valid_upload_clears_queue() {
        let h = harness(vec![
            call("uploadCar", upload_args(json!(2024), json!(200000000))),
            text("Mobil berhasil ditambahkan!"),
        ]);
        h.staff_photo().await;

        let reply = h.engine.process_message(TENANT, STAFF, "Toyota Avanza 2024 200jt AT Bensin", true).await;

        assert_eq!(reply, "Mobil berhasil ditambahkan!");
        assert!(h.pending.uploads(TENANT, STAFF).await.is_empty());
        let cars = h.store.search(TENANT, &Default::default()).await.unwrap();
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].year, 2024);
    }

    #[tokio::test]
    async fn test_three_photos_then_details() {
        let h = harness(vec![
            call(
                "uploadCar",
                json!({
                    "brand": "Toyota",
                    "model": "Avanza",
                    "year": 2020,
                    "price": "185000000",
                    "transmission": "AT",
                    "fuel_type": "Bensin"
                }),
            ),
            text("Mobil berhasil ditambahkan ke catalog!"),
        ]);
        for _ in 0..3 {
            h.staff_photo().await;
        }

        h.engine.process_message(TENANT, STAFF, "Toyota Avanza 2020 185000000 AT Bensin", true).await;

        assert_eq!(h.provider.call_count(), 2);
        assert!(h.pending.uploads(TENANT, STAFF).await.is_empty());

        let cars = h.store.search(TENANT, &Default::default()).await.unwrap();
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].brand, "Toyota");
        assert_eq!(cars[0].model, "Avanza");
        assert_eq!(cars[0].price, 185_000_000);
        assert_eq!(cars[0].transmission.as_deref(), Some("AT"));
        assert_eq!(cars[0].fuel_type.as_deref(), Some("Bensin"));
        assert_eq!(h.store.photos(TENANT, cars[0].id).await.unwrap().len(), 3);

        let result = h.function_result(1);
        assert!(result.contains("\"photo_count\":3"));
        assert!(result.contains(&format!("https://tenant1.auto-lmk.com/cars/{}", cars[0].id)));
    }

    #[tokio::test]
    async fn test_cancel_clears_queue() {
        let h = harness(vec![]);
        h.staff_photo().await;
        h.staff_photo().await;
        let paths = h.pending.uploads(TENANT, STAFF).await;

        let reply = h.engine.process_message(TENANT, STAFF, "batal", true).await;

        assert_eq!(reply, "Upload dibatalkan. 2 foto dihapus.");
        assert!(h.pending.uploads(TENANT, STAFF).await.is_empty());
        assert!(paths.iter().all(|p| !std::path::Path::new(p).exists()));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_customer_cancel_goes_to_llm() {
        let h = harness(vec![text("Baik, ada lagi yang bisa dibantu?")]);
        let reply = h.engine.process_message(TENANT, CUSTOMER, "batal", false).await;
        assert_eq!(reply, "Baik, ada lagi yang bisa dibantu?");
    }
}
