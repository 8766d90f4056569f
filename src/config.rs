use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bot::{EngineOptions, ListingRules};
use crate::store::TenantId;
use crate::whatsapp::{Addressing, ManagerOptions};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize, Default)]
struct LlmSection {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize, Default)]
struct BridgeSection {
    #[serde(default)]
    base_url: String,
    /// Delay between pairing polls while the sidecar has nothing new.
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
}

#[derive(Deserialize)]
#[serde(default)]
struct ListingSection {
    min_year: i64,
    max_year: i64,
    min_price: i64,
    max_price: i64,
}

impl Default for ListingSection {
    fn default() -> Self {
        let rules = ListingRules::default();
        Self {
            min_year: rules.min_year,
            max_year: rules.max_year,
            min_price: rules.min_price,
            max_price: rules.max_price,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct AddressingSection {
    country_code: String,
    international_length: usize,
}

impl Default for AddressingSection {
    fn default() -> Self {
        let addressing = Addressing::default();
        Self {
            country_code: addressing.country_code,
            international_length: addressing.international_length,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Directory for state files (logs, uploads, QR images). Defaults to current directory.
    data_dir: Option<String>,
    /// Defaults to `<data_dir>/dealerbot.db`.
    database_path: Option<String>,
    /// Tenants to pair at startup.
    #[serde(default)]
    tenants: Vec<TenantId>,
    #[serde(default)]
    llm: LlmSection,
    #[serde(default)]
    bridge: BridgeSection,
    #[serde(default = "default_pairing_timeout_secs")]
    pairing_timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    history_limit: usize,
    #[serde(default = "default_max_function_rounds")]
    max_function_rounds: usize,
    #[serde(default = "default_max_pending_photos")]
    max_pending_photos: usize,
    #[serde(default = "default_pending_upload_ttl_minutes")]
    pending_upload_ttl_minutes: u64,
    #[serde(default = "default_search_limit")]
    search_limit: usize,
    #[serde(default)]
    listing: ListingSection,
    #[serde(default)]
    addressing: AddressingSection,
    /// Public listing URL; `{tenant}` and `{car}` are substituted.
    catalog_url_template: Option<String>,
    #[serde(default)]
    enable_lead_capture: bool,
    upload_dir: Option<String>,
    qr_dir: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_pairing_timeout_secs() -> u64 {
    10
}

fn default_history_limit() -> usize {
    10
}

fn default_max_function_rounds() -> usize {
    3
}

fn default_max_pending_photos() -> usize {
    5
}

fn default_pending_upload_ttl_minutes() -> u64 {
    60
}

fn default_search_limit() -> usize {
    10
}

pub struct Config {
    /// Directory for state files.
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub tenants: Vec<TenantId>,
    pub llm_endpoint: Option<String>,
    pub llm_api_key: String,
    pub llm_model: Option<String>,
    pub bridge_url: String,
    pub bridge_poll_interval: Duration,
    pub pairing_timeout: Duration,
    pub history_limit: usize,
    pub max_function_rounds: usize,
    pub max_pending_photos: usize,
    pub pending_upload_ttl: Duration,
    pub search_limit: usize,
    pub listing: ListingRules,
    pub addressing: Addressing,
    pub catalog_url_template: Option<String>,
    pub enable_lead_capture: bool,
    pub upload_dir: PathBuf,
    pub qr_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.llm.api_key.trim().is_empty() {
            return Err(ConfigError::Validation("llm.api_key is required".into()));
        }
        if file.bridge.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("bridge.base_url is required".into()));
        }
        if file.listing.min_year > file.listing.max_year {
            return Err(ConfigError::Validation(format!(
                "listing.min_year ({}) must not exceed listing.max_year ({})",
                file.listing.min_year, file.listing.max_year
            )));
        }
        if file.listing.min_price > file.listing.max_price {
            return Err(ConfigError::Validation(format!(
                "listing.min_price ({}) must not exceed listing.max_price ({})",
                file.listing.min_price, file.listing.max_price
            )));
        }
        let country_code = &file.addressing.country_code;
        if country_code.is_empty() || !country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Validation(format!(
                "addressing.country_code must be digits, got {:?}",
                country_code
            )));
        }
        if file.max_pending_photos == 0 {
            return Err(ConfigError::Validation("max_pending_photos must be at least 1".into()));
        }
        if file.max_function_rounds == 0 {
            return Err(ConfigError::Validation("max_function_rounds must be at least 1".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let in_data_dir = |value: Option<String>, default: &str| {
            value.map(PathBuf::from).unwrap_or_else(|| data_dir.join(default))
        };
        let database_path = in_data_dir(file.database_path, "dealerbot.db");
        let upload_dir = in_data_dir(file.upload_dir, "uploads");
        let qr_dir = in_data_dir(file.qr_dir, "qr");

        Ok(Self {
            database_path,
            upload_dir,
            qr_dir,
            tenants: file.tenants,
            llm_endpoint: file.llm.endpoint,
            llm_api_key: file.llm.api_key,
            llm_model: file.llm.model,
            bridge_url: file.bridge.base_url.trim_end_matches('/').to_string(),
            bridge_poll_interval: Duration::from_millis(file.bridge.poll_interval_ms),
            pairing_timeout: Duration::from_secs(file.pairing_timeout_secs),
            history_limit: file.history_limit,
            max_function_rounds: file.max_function_rounds,
            max_pending_photos: file.max_pending_photos,
            pending_upload_ttl: Duration::from_secs(file.pending_upload_ttl_minutes * 60),
            search_limit: file.search_limit,
            listing: ListingRules {
                min_year: file.listing.min_year,
                max_year: file.listing.max_year,
                min_price: file.listing.min_price,
                max_price: file.listing.max_price,
            },
            addressing: Addressing {
                country_code: file.addressing.country_code,
                international_length: file.addressing.international_length,
            },
            catalog_url_template: file.catalog_url_template,
            enable_lead_capture: file.enable_lead_capture,
            data_dir,
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        let defaults = EngineOptions::default();
        EngineOptions {
            history_limit: self.history_limit,
            max_function_rounds: self.max_function_rounds,
            search_limit: self.search_limit,
            listing: self.listing.clone(),
            catalog_url_template: self
                .catalog_url_template
                .clone()
                .unwrap_or(defaults.catalog_url_template),
            enable_lead_capture: self.enable_lead_capture,
            upload_dir: self.upload_dir.clone(),
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            pairing_timeout: self.pairing_timeout,
            qr_dir: self.qr_dir.clone(),
            addressing: self.addressing.clone(),
        }
    }
}
