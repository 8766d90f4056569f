//! Functions the LLM can call, and who may call them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::llm::FunctionSpec;
use crate::store::{Car, StoreError};

/// Who is talking to the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Staff,
}

impl Role {
    pub fn from_staff_flag(is_staff: bool) -> Self {
        if is_staff { Role::Staff } else { Role::Customer }
    }
}

/// Optional features that gate capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    LeadCapture,
}

/// One registry entry: a function, its schema and the roles allowed to call it.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub roles: &'static [Role],
    pub feature: Option<Feature>,
}

const EVERYONE: &[Role] = &[Role::Customer, Role::Staff];
const STAFF_ONLY: &[Role] = &[Role::Staff];

/// Every function the bot knows about.
pub fn registry() -> Vec<Capability> {
    vec![
        Capability {
            name: "searchCars",
            description: "Cari mobil yang tersedia berdasarkan kriteria",
            parameters: json!({
                "type": "object",
                "properties": {
                    "brand": { "type": "string", "description": "Merek mobil (Toyota, Honda, Mitsubishi, dll)" },
                    "model": { "type": "string", "description": "Model mobil (Avanza, CR-V, Xpander, dll)" },
                    "max_price": { "type": "integer", "description": "Harga maksimal dalam Rupiah" },
                    "transmission": {
                        "type": "string",
                        "enum": ["manual", "automatic"],
                        "description": "Jenis transmisi (matic/automatic atau manual)"
                    },
                    "fuel_type": {
                        "type": "string",
                        "enum": ["bensin", "diesel", "hybrid", "electric"],
                        "description": "Jenis bahan bakar"
                    }
                }
            }),
            roles: EVERYONE,
            feature: None,
        },
        Capability {
            name: "getCarDetails",
            description: "Dapatkan detail lengkap sebuah mobil termasuk foto",
            parameters: json!({
                "type": "object",
                "properties": {
                    "car_id": { "type": "integer", "description": "ID mobil" }
                },
                "required": ["car_id"]
            }),
            roles: EVERYONE,
            feature: None,
        },
        Capability {
            name: "sendCarImages",
            description: "Kirim foto-foto mobil ke customer via WhatsApp",
            parameters: json!({
                "type": "object",
                "properties": {
                    "car_id": { "type": "integer", "description": "ID mobil yang fotonya akan dikirim" }
                },
                "required": ["car_id"]
            }),
            roles: EVERYONE,
            feature: None,
        },
        Capability {
            name: "uploadCar",
            description: "Upload mobil baru ke catalog dengan foto dan detail",
            parameters: json!({
                "type": "object",
                "properties": {
                    "brand": { "type": "string", "description": "Brand mobil (Toyota, Honda, dll)" },
                    "model": { "type": "string", "description": "Model mobil (Avanza, Civic, dll)" },
                    "year": { "type": "integer", "description": "Tahun produksi" },
                    "price": { "type": "integer", "description": "Harga dalam rupiah" },
                    "transmission": { "type": "string", "enum": ["AT", "MT"], "description": "AT atau MT" },
                    "fuel_type": { "type": "string", "enum": ["Bensin", "Diesel"], "description": "Bensin atau Diesel" },
                    "description": { "type": "string", "description": "Deskripsi tambahan (optional)" }
                },
                "required": ["brand", "model", "year", "price", "transmission", "fuel_type"]
            }),
            roles: STAFF_ONLY,
            feature: None,
        },
        Capability {
            name: "createLead",
            description: "Catat calon pembeli (lead) yang tertarik dengan mobil",
            parameters: json!({
                "type": "object",
                "properties": {
                    "phone_number": { "type": "string", "description": "Nomor WhatsApp calon pembeli" },
                    "name": { "type": "string", "description": "Nama calon pembeli (optional)" },
                    "interested_car_id": { "type": "integer", "description": "ID mobil yang diminati (optional)" }
                },
                "required": ["phone_number"]
            }),
            roles: STAFF_ONLY,
            feature: Some(Feature::LeadCapture),
        },
    ]
}

impl Capability {
    pub fn allows(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    fn enabled(&self, lead_capture: bool) -> bool {
        match self.feature {
            None => true,
            Some(Feature::LeadCapture) => lead_capture,
        }
    }

    pub fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.parameters.clone(),
        }
    }
}

/// The function specs offered to a role.
pub fn capabilities(role: Role, lead_capture: bool) -> Vec<FunctionSpec> {
    registry()
        .iter()
        .filter(|c| c.allows(role) && c.enabled(lead_capture))
        .map(Capability::spec)
        .collect()
}

/// A parsed function call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "function", rename_all = "camelCase")]
pub enum BotFunction {
    SearchCars {
        #[serde(default)]
        brand: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default, deserialize_with = "lenient_opt_i64")]
        max_price: Option<i64>,
        #[serde(default)]
        transmission: Option<String>,
        #[serde(default)]
        fuel_type: Option<String>,
    },
    GetCarDetails {
        #[serde(deserialize_with = "lenient_i64")]
        car_id: i64,
    },
    SendCarImages {
        #[serde(deserialize_with = "lenient_i64")]
        car_id: i64,
    },
    /// Every field is optional here so a missing one becomes a refusal
    /// naming it, not a parse failure.
    UploadCar {
        #[serde(default)]
        brand: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default, deserialize_with = "lenient_opt_i64")]
        year: Option<i64>,
        #[serde(default, deserialize_with = "lenient_opt_i64")]
        price: Option<i64>,
        #[serde(default)]
        transmission: Option<String>,
        #[serde(default)]
        fuel_type: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    CreateLead {
        #[serde(default)]
        phone_number: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default, deserialize_with = "lenient_opt_i64")]
        interested_car_id: Option<i64>,
    },
}

impl BotFunction {
    /// Parse an LLM function call. Checks the name against the registry and
    /// the caller's role before looking at the arguments.
    pub fn parse(name: &str, arguments: &Value, role: Role) -> Result<Self, FunctionError> {
        let capability = registry()
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| FunctionError::Unknown(name.to_string()))?;
        if !capability.allows(role) {
            return Err(FunctionError::Forbidden(name.to_string()));
        }

        let mut tagged = match arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Default::default(),
            other => {
                return Err(FunctionError::BadArguments {
                    name: name.to_string(),
                    reason: format!("expected an object, got {other}"),
                });
            }
        };
        tagged.insert("function".to_string(), Value::String(name.to_string()));

        serde_json::from_value(Value::Object(tagged)).map_err(|e| FunctionError::BadArguments {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

fn number_from_value(value: &Value) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| format!("number out of range: {n}")),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| format!("not a number: {s:?}"))
        }
        other => Err(format!("not a number: {other}")),
    }
}

/// Accepts a JSON number or a numeric string.
fn lenient_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    number_from_value(&value).map_err(serde::de::Error::custom)
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    lenient_opt_i64(deserializer)?.ok_or_else(|| serde::de::Error::custom("value is required"))
}

/// Search transmission filter: `manual` or `automatic` (`matic`, `AT` accepted).
pub fn canonical_search_transmission(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "manual" | "mt" => Some("manual"),
        "automatic" | "matic" | "at" | "otomatis" => Some("automatic"),
        _ => None,
    }
}

/// Listing transmission: `AT` or `MT`.
pub fn canonical_listing_transmission(raw: &str) -> Option<&'static str> {
    match canonical_search_transmission(raw)? {
        "automatic" => Some("AT"),
        _ => Some("MT"),
    }
}

/// Listing fuel type: `Bensin` or `Diesel`.
pub fn canonical_fuel(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "bensin" | "gasoline" | "petrol" => Some("Bensin"),
        "diesel" | "solar" => Some("Diesel"),
        _ => None,
    }
}

/// A validation failure the LLM should relay to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refusal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl Refusal {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self { field: Some(field.to_string()), message: message.into() }
    }
}

/// Structured result of one executed function.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FunctionOutcome {
    Cars {
        count: usize,
        cars: Vec<Car>,
    },
    CarDetail {
        car: Car,
        photos: Vec<String>,
    },
    CarNotFound {
        car_id: i64,
        message: String,
    },
    ImagesQueued {
        car_id: i64,
        image_count: usize,
        message: String,
    },
    NoImages {
        car_id: i64,
        message: String,
    },
    CarCreated {
        car_id: i64,
        brand: String,
        model: String,
        year: i32,
        price: i64,
        transmission: String,
        fuel_type: String,
        photo_count: usize,
        catalog_url: String,
        message: String,
    },
    Refused(Refusal),
    LeadCreated {
        lead_id: i64,
        message: String,
    },
}

impl FunctionOutcome {
    /// The `function`-role message fed back to the LLM.
    pub fn summary(&self, name: &str) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("Hasil fungsi {name}: {body}")
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            FunctionOutcome::Refused(refusal) => Some(refusal),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("unknown function: {0}")]
    Unknown(String),
    #[error("function {0} is not available to this user")]
    Forbidden(String),
    #[error("invalid arguments for {name}: {reason}")]
    BadArguments { name: String, reason: String },
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}
