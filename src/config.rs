use crate::constants;
use crate::error::ConfigError;
use crate::pipeline::quality::QualityWeights;
use crate::pipeline::retry::{Backoff, RetryPolicy};
use crate::types::{CvssVersion, RecordProfile};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub extract: ExtractConfig,
    pub transform: TransformConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub profile: RecordProfile,
    /// Falls back to the profile's public endpoint when unset
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    /// Extra query parameters sent with every page request
    pub query: BTreeMap<String, String>,
    /// Publication window pushed down to the API (NVD `pubStartDate`/`pubEndDate`)
    pub lookback_days: Option<i64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            profile: RecordProfile::Nvd,
            base_url: None,
            api_key: None,
            timeout_seconds: constants::DEFAULT_REQUEST_TIMEOUT_SECS,
            query: BTreeMap::new(),
            lookback_days: None,
        }
    }
}

impl ApiConfig {
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => match self.profile {
                RecordProfile::Nvd => constants::NVD_BASE_URL.to_string(),
                RecordProfile::Posts => constants::POSTS_BASE_URL.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub page_size: usize,
    pub max_pages: usize,
    pub rate_limit_delay_secs: f64,
    pub max_attempts: u32,
    /// Multiplier applied to the rate-limit delay between retries; 1.0 keeps it flat
    pub backoff_factor: f64,
    pub max_backoff_secs: f64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            page_size: constants::DEFAULT_PAGE_SIZE,
            max_pages: constants::DEFAULT_MAX_PAGES,
            rate_limit_delay_secs: constants::DEFAULT_RATE_LIMIT_DELAY_SECS,
            max_attempts: constants::DEFAULT_MAX_ATTEMPTS,
            backoff_factor: 2.0,
            max_backoff_secs: 60.0,
        }
    }
}

impl ExtractConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        bounded_secs(self.rate_limit_delay_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base = self.rate_limit_delay();
        let backoff = if (self.backoff_factor - 1.0).abs() < f64::EPSILON {
            Backoff::Fixed(base)
        } else {
            Backoff::Exponential {
                base,
                factor: self.backoff_factor,
                max: bounded_secs(self.max_backoff_secs),
            }
        };
        RetryPolicy::new(self.max_attempts, backoff)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Defaults to the profile's source tag
    pub source_tag: Option<String>,
    pub freshness_window_days: i64,
    pub min_description_length: usize,
    pub severity_precedence: Vec<CvssVersion>,
    /// Defaults to the profile's equal weighting
    pub weights: Option<QualityWeights>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            source_tag: None,
            freshness_window_days: constants::DEFAULT_FRESHNESS_WINDOW_DAYS,
            min_description_length: constants::DEFAULT_MIN_DESCRIPTION_LENGTH,
            severity_precedence: CvssVersion::DEFAULT_PRECEDENCE.to_vec(),
            weights: None,
        }
    }
}

impl TransformConfig {
    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.freshness_window_days.clamp(0, constants::MAX_WINDOW_DAYS))
            .unwrap_or_else(chrono::Duration::zero)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub collection: String,
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: constants::DEFAULT_STORE_PATH.to_string(),
            collection: constants::DEFAULT_COLLECTION.to_string(),
            batch_size: constants::DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub pushgateway_url: Option<String>,
    pub job: Option<String>,
}

impl Config {
    /// Defaults, then the TOML file (when given and present), then environment
    /// variables. Call `dotenv` before this to pick up a `.env` file.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let config_content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&config_content)?;
        Ok(config)
    }

    /// Overlay values from a variable lookup, normally `std::env::var`
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RECORD_PROFILE") {
            self.api.profile = RecordProfile::parse(&v).ok_or_else(|| invalid("RECORD_PROFILE", &v))?;
        }
        if let Some(v) = get("API_BASE_URL") {
            self.api.base_url = Some(v);
        }
        if let Some(v) = get("API_KEY") {
            self.api.api_key = Some(v);
        }
        if let Some(v) = get("LOOKBACK_DAYS") {
            self.api.lookback_days = Some(parse_env("LOOKBACK_DAYS", &v)?);
        }
        if let Some(v) = get("RATE_LIMIT_DELAY") {
            self.extract.rate_limit_delay_secs = parse_env("RATE_LIMIT_DELAY", &v)?;
        }
        if let Some(v) = get("PAGE_SIZE") {
            self.extract.page_size = parse_env("PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_PAGES") {
            self.extract.max_pages = parse_env("MAX_PAGES", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.extract.max_attempts = parse_env("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("FRESHNESS_WINDOW_DAYS") {
            self.transform.freshness_window_days = parse_env("FRESHNESS_WINDOW_DAYS", &v)?;
        }
        if let Some(v) = get("SOURCE_TAG") {
            self.transform.source_tag = Some(v);
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.store.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("STORE_PATH") {
            self.store.path = v;
        }
        if let Some(v) = get("STORE_COLLECTION") {
            self.store.collection = v;
        }
        if let Some(v) = get("PUSHGATEWAY_URL") {
            self.metrics.pushgateway_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.extract.page_size == 0 {
            return Err(invalid("extract.page_size", "must be greater than zero"));
        }
        if self.extract.max_pages == 0 {
            return Err(invalid("extract.max_pages", "must be greater than zero"));
        }
        if self.extract.max_attempts == 0 {
            return Err(invalid("extract.max_attempts", "must be at least 1"));
        }
        check_delay("extract.rate_limit_delay_secs", self.extract.rate_limit_delay_secs)?;
        if !self.extract.backoff_factor.is_finite() || self.extract.backoff_factor < 1.0 {
            return Err(invalid("extract.backoff_factor", "must be at least 1.0"));
        }
        check_delay("extract.max_backoff_secs", self.extract.max_backoff_secs)?;
        check_days("transform.freshness_window_days", self.transform.freshness_window_days)?;
        if let Some(days) = self.api.lookback_days {
            check_days("api.lookback_days", days)?;
        }
        if self.transform.severity_precedence.is_empty() {
            return Err(invalid("transform.severity_precedence", "must list at least one CVSS version"));
        }
        if let Some(weights) = &self.transform.weights {
            weights
                .validate()
                .map_err(|message| invalid("transform.weights", &message))?;
        }
        if self.store.batch_size == 0 {
            return Err(invalid("store.batch_size", "must be greater than zero"));
        }
        if self.store.collection.trim().is_empty() {
            return Err(invalid("store.collection", "must not be empty"));
        }
        Ok(())
    }

    pub fn source_tag(&self) -> String {
        match &self.transform.source_tag {
            Some(tag) => tag.clone(),
            None => match self.api.profile {
                RecordProfile::Nvd => constants::NVD_SOURCE_TAG.to_string(),
                RecordProfile::Posts => constants::POSTS_SOURCE_TAG.to_string(),
            },
        }
    }

    pub fn quality_weights(&self) -> QualityWeights {
        self.transform
            .weights
            .clone()
            .unwrap_or_else(|| QualityWeights::for_profile(self.api.profile))
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn check_delay(key: &str, secs: f64) -> ConfigResult<()> {
    if !secs.is_finite() || !(0.0..=constants::MAX_DELAY_SECS).contains(&secs) {
        return Err(invalid(
            key,
            &format!("must be between 0 and {} seconds", constants::MAX_DELAY_SECS),
        ));
    }
    Ok(())
}

fn check_days(key: &str, days: i64) -> ConfigResult<()> {
    if !(0..=constants::MAX_WINDOW_DAYS).contains(&days) {
        return Err(invalid(key, &format!("must be between 0 and {} days", constants::MAX_WINDOW_DAYS)));
    }
    Ok(())
}

/// Out-of-range values saturate instead of panicking; `validate` rejects them first
fn bounded_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, constants::MAX_DELAY_SECS)).unwrap_or(Duration::ZERO)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, &format!("cannot parse '{}'", value)))
}
