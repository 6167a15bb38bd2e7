use thiserror::Error;

/// Retries for a single page ran out on rate limiting or transient transport
/// failures. Pages collected before this point stay valid.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("page {page} (offset {offset}) not retrieved after {attempts} attempts: {last_error}")]
pub struct RecoverableExtractionError {
    pub page: usize,
    pub offset: usize,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error(transparent)]
    Recoverable(#[from] RecoverableExtractionError),

    #[error("unexpected HTTP status {status} for page {page}: {body_excerpt}")]
    UnexpectedStatus {
        page: usize,
        status: u16,
        body_excerpt: String,
    },

    #[error("malformed response body for page {page}: {reason}")]
    MalformedBody { page: usize, reason: String },

    #[error("transport failure for page {page}: {message}")]
    Transport { page: usize, message: String },
}

impl ExtractionError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExtractionError::Recoverable(_))
    }
}

/// A single document the store refused inside a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    /// Position of the failing operation inside the submitted batch
    pub index: usize,
    pub record_id: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store authentication failed: {0}")]
    Authentication(String),

    /// The batch was not applied. `write_errors` is empty when the store
    /// cannot tell which operations caused the failure.
    #[error("bulk write rejected: {message} ({} item errors)", write_errors.len())]
    BulkWrite {
        message: String,
        write_errors: Vec<WriteError>,
    },

    #[error("invalid collection or index name: {0}")]
    InvalidName(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Connection-level failures end the run; everything else is counted per record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Authentication(_) | StoreError::InvalidName(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("load failed: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EtlError>;
