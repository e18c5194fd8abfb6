use crate::errors::PipelineError;
use crate::models::Tier;
use chrono::NaiveDate;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    // Refinery policy
    pub require_phone: bool,
    pub require_email: bool,
    pub reject_invalid_tax_id: bool,

    // Export / message policy
    pub export_all_tiers: bool,
    pub message_tiers: Vec<Tier>,
    pub deep_tiers: Vec<Tier>,

    // Cache
    pub cache_ttl_registry_hours: u64,
    pub cache_ttl_price_hours: u64,
    pub cache_ttl_infrastructure_hours: u64,
    pub cache_capacity: u64,
    pub cache_snapshot_path: Option<PathBuf>,

    // Batching
    pub chunk_size: usize,
    pub chunk_workers: usize,
    pub deep_batch_size: usize,
    pub deep_batch_pause_ms: u64,

    // Gateways
    pub gateway_concurrency: usize,
    pub gateway_timeout_secs: u64,
    pub gateway_max_retries: u32,
    pub gateway_backoff_ms: u64,
    pub live_data: bool,
    pub force_refresh: bool,
    pub registry_base_url: String,
    pub registry_page_size: usize,
    pub registry_max_pages: usize,
    pub fuel_price_url: Option<String>,
    pub charger_base_url: String,
    pub charger_api_key: Option<String>,
    pub narrative_url: Option<String>,
    pub narrative_timeout_secs: u64,

    // Data assets
    pub market_data_path: Option<PathBuf>,
    pub column_synonyms_path: Option<PathBuf>,
    /// Reference date for company age; today when unset.
    pub as_of_date: Option<NaiveDate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            require_phone: true,
            require_email: false,
            reject_invalid_tax_id: false,
            export_all_tiers: false,
            message_tiers: vec![Tier::S, Tier::AAA, Tier::AA, Tier::A],
            deep_tiers: vec![Tier::S, Tier::AAA],
            cache_ttl_registry_hours: 24,
            cache_ttl_price_hours: 24,
            cache_ttl_infrastructure_hours: 168,
            cache_capacity: 100_000,
            cache_snapshot_path: None,
            chunk_size: 10_000,
            chunk_workers: 4,
            deep_batch_size: 3,
            deep_batch_pause_ms: 500,
            gateway_concurrency: 4,
            gateway_timeout_secs: 30,
            gateway_max_retries: 3,
            gateway_backoff_ms: 500,
            live_data: false,
            force_refresh: false,
            registry_base_url: "https://api.cepik.gov.pl".to_string(),
            registry_page_size: 500,
            registry_max_pages: 100,
            fuel_price_url: None,
            charger_base_url: "https://api.openchargemap.io/v3".to_string(),
            charger_api_key: None,
            narrative_url: None,
            narrative_timeout_secs: 20,
            market_data_path: None,
            column_synonyms_path: None,
            as_of_date: None,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

fn bool_var(name: &str, default: bool) -> anyhow::Result<bool> {
    match optional_var(name).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => anyhow::bail!("{} must be true or false, got {}", name, v),
    }
}

fn tiers_var(name: &str, default: Vec<Tier>) -> anyhow::Result<Vec<Tier>> {
    match optional_var(name) {
        Some(raw) => Tier::parse_list(&raw).map_err(|e| anyhow::anyhow!("{}: {}", name, e)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            require_phone: bool_var("REQUIRE_PHONE", defaults.require_phone)?,
            require_email: bool_var("REQUIRE_EMAIL", defaults.require_email)?,
            reject_invalid_tax_id: bool_var(
                "REJECT_INVALID_TAX_ID",
                defaults.reject_invalid_tax_id,
            )?,
            export_all_tiers: bool_var("EXPORT_ALL_TIERS", defaults.export_all_tiers)?,
            message_tiers: tiers_var("MESSAGE_TIERS", defaults.message_tiers)?,
            deep_tiers: tiers_var("DEEP_TIERS", defaults.deep_tiers)?,
            cache_ttl_registry_hours: parse_var(
                "CACHE_TTL_REGISTRY_HOURS",
                defaults.cache_ttl_registry_hours,
            )?,
            cache_ttl_price_hours: parse_var(
                "CACHE_TTL_PRICE_HOURS",
                defaults.cache_ttl_price_hours,
            )?,
            cache_ttl_infrastructure_hours: parse_var(
                "CACHE_TTL_INFRASTRUCTURE_HOURS",
                defaults.cache_ttl_infrastructure_hours,
            )?,
            cache_capacity: parse_var("CACHE_CAPACITY", defaults.cache_capacity)?,
            cache_snapshot_path: optional_var("CACHE_SNAPSHOT_PATH").map(PathBuf::from),
            chunk_size: parse_var("CHUNK_SIZE", defaults.chunk_size)?,
            chunk_workers: parse_var("CHUNK_WORKERS", defaults.chunk_workers)?,
            deep_batch_size: parse_var("DEEP_BATCH_SIZE", defaults.deep_batch_size)?,
            deep_batch_pause_ms: parse_var("DEEP_BATCH_PAUSE_MS", defaults.deep_batch_pause_ms)?,
            gateway_concurrency: parse_var("GATEWAY_CONCURRENCY", defaults.gateway_concurrency)?,
            gateway_timeout_secs: parse_var("GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout_secs)?,
            gateway_max_retries: parse_var("GATEWAY_MAX_RETRIES", defaults.gateway_max_retries)?,
            gateway_backoff_ms: parse_var("GATEWAY_BACKOFF_MS", defaults.gateway_backoff_ms)?,
            live_data: bool_var("LIVE_DATA", defaults.live_data)?,
            force_refresh: bool_var("FORCE_REFRESH", defaults.force_refresh)?,
            registry_base_url: optional_var("REGISTRY_BASE_URL")
                .unwrap_or(defaults.registry_base_url),
            registry_page_size: parse_var("REGISTRY_PAGE_SIZE", defaults.registry_page_size)?,
            registry_max_pages: parse_var("REGISTRY_MAX_PAGES", defaults.registry_max_pages)?,
            fuel_price_url: optional_var("FUEL_PRICE_URL"),
            charger_base_url: optional_var("CHARGER_BASE_URL").unwrap_or(defaults.charger_base_url),
            charger_api_key: optional_var("CHARGER_API_KEY"),
            narrative_url: optional_var("NARRATIVE_URL"),
            narrative_timeout_secs: parse_var(
                "NARRATIVE_TIMEOUT_SECS",
                defaults.narrative_timeout_secs,
            )?,
            market_data_path: optional_var("MARKET_DATA_PATH").map(PathBuf::from),
            column_synonyms_path: optional_var("COLUMN_SYNONYMS_PATH").map(PathBuf::from),
            as_of_date: optional_var("AS_OF_DATE")
                .map(|raw| {
                    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                        .map_err(|_| anyhow::anyhow!("AS_OF_DATE must be YYYY-MM-DD, got {}", raw))
                })
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("CHUNK_SIZE", self.chunk_size as u64),
            ("CHUNK_WORKERS", self.chunk_workers as u64),
            ("DEEP_BATCH_SIZE", self.deep_batch_size as u64),
            ("GATEWAY_CONCURRENCY", self.gateway_concurrency as u64),
            ("GATEWAY_TIMEOUT_SECS", self.gateway_timeout_secs),
            ("REGISTRY_PAGE_SIZE", self.registry_page_size as u64),
            ("REGISTRY_MAX_PAGES", self.registry_max_pages as u64),
            ("NARRATIVE_TIMEOUT_SECS", self.narrative_timeout_secs),
            ("CACHE_CAPACITY", self.cache_capacity),
            ("CACHE_TTL_REGISTRY_HOURS", self.cache_ttl_registry_hours),
            ("CACHE_TTL_PRICE_HOURS", self.cache_ttl_price_hours),
            ("CACHE_TTL_INFRASTRUCTURE_HOURS", self.cache_ttl_infrastructure_hours),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(PipelineError::Configuration(format!("{} must be greater than 0", name)));
        }

        if self.cache_ttl_infrastructure_hours < self.cache_ttl_registry_hours
            || self.cache_ttl_infrastructure_hours < self.cache_ttl_price_hours
        {
            return Err(PipelineError::Configuration(
                "CACHE_TTL_INFRASTRUCTURE_HOURS must be at least the registry and price TTLs"
                    .to_string(),
            ));
        }

        let urls = [
            ("REGISTRY_BASE_URL", Some(self.registry_base_url.as_str())),
            ("CHARGER_BASE_URL", Some(self.charger_base_url.as_str())),
            ("FUEL_PRICE_URL", self.fuel_price_url.as_deref()),
            ("NARRATIVE_URL", self.narrative_url.as_deref()),
        ];
        for (name, url) in urls {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(PipelineError::Configuration(format!(
                        "{} must start with http:// or https://",
                        name
                    )));
                }
            }
        }

        if self.message_tiers.is_empty() {
            return Err(PipelineError::Configuration(
                "MESSAGE_TIERS cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a tier gets enrichment and message columns.
    pub fn is_message_tier(&self, tier: Tier) -> bool {
        self.message_tiers.contains(&tier)
    }

    pub fn is_deep_tier(&self, tier: Tier) -> bool {
        self.deep_tiers.contains(&tier)
    }

    /// Whether a tier is written to the output at all.
    pub fn is_exported(&self, tier: Tier) -> bool {
        self.export_all_tiers || tier <= Tier::A
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of_date
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }
}
