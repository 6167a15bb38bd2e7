//! Defaults and fixed names shared across the pipeline stages

// Schema written into every enriched document's metadata
pub const SCHEMA_VERSION: &str = "1.0";

// Source tags (written to etl_metadata.source)
pub const NVD_SOURCE_TAG: &str = "nvd_cve_api";
pub const POSTS_SOURCE_TAG: &str = "jsonplaceholder_api";

// Default endpoints per record profile
pub const NVD_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
pub const POSTS_BASE_URL: &str = "https://jsonplaceholder.typicode.com/posts";

// NVD asks unauthenticated clients for roughly one request every six seconds
pub const DEFAULT_RATE_LIMIT_DELAY_SECS: f64 = 6.0;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_PAGES: usize = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FRESHNESS_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MIN_DESCRIPTION_LENGTH: usize = 20;

// Upper bounds accepted from configuration
pub const MAX_DELAY_SECS: f64 = 3600.0;
pub const MAX_WINDOW_DAYS: i64 = 36_500;

// Document store
pub const DEFAULT_STORE_PATH: &str = "data/feed_etl.db";
pub const DEFAULT_COLLECTION: &str = "nvd_cves_raw";
/// Natural identifier field on every stored document; the upsert match key
pub const RECORD_ID_FIELD: &str = "record_id";
pub const INGESTION_TIMESTAMP_FIELD: &str = "etl_metadata.ingestion_timestamp";
/// Mirrors the 16 MiB document ceiling common to document databases
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

pub const USER_AGENT: &str = concat!("feed-etl/", env!("CARGO_PKG_VERSION"));
