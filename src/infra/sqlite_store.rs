use crate::constants::{INGESTION_TIMESTAMP_FIELD, MAX_DOCUMENT_BYTES, RECORD_ID_FIELD};
use crate::error::{StoreError, WriteError};
use crate::storage::{
    round2, validate_op, BulkWriteResult, CollectionSummary, DocumentStore, IndexOutcome, IndexSpec,
    SummaryFields, UpsertOp,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static FIELD_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap());

/// Document collection stored as JSON text in a SQLite table.
///
/// One row per natural identifier; indexes are expression indexes over
/// `json_extract`. The connection is opened once and closed when the store is
/// dropped.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteDocumentStore {
    pub fn open<P: AsRef<Path>>(db_path: P, collection: &str) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Connection(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(db_path).map_err(classify)?;
        let store = Self::with_connection(conn, collection)?;
        info!("Opened document collection {} at {}", collection, db_path.display());
        Ok(store)
    }

    /// Opens a collection only if the database file and its table already exist.
    /// Nothing is created on disk.
    pub fn open_existing<P: AsRef<Path>>(db_path: P, collection: &str) -> Result<Option<Self>, StoreError> {
        let db_path = db_path.as_ref();
        if !IDENTIFIER.is_match(collection) {
            return Err(StoreError::InvalidName(collection.to_string()));
        }
        if !db_path.is_file() {
            debug!("No database at {}", db_path.display());
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(classify)?;
        let has_table = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![collection],
                |_| Ok(()),
            )
            .optional()
            .map_err(classify)?
            .is_some();
        if !has_table {
            return Ok(None);
        }
        Ok(Some(Self {
            conn: Mutex::new(conn),
            table: collection.to_string(),
        }))
    }

    pub fn open_in_memory(collection: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(classify)?, collection)
    }

    fn with_connection(conn: Connection, collection: &str) -> Result<Self, StoreError> {
        if !IDENTIFIER.is_match(collection) {
            return Err(StoreError::InvalidName(collection.to_string()));
        }
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS {table} (
                record_id   TEXT PRIMARY KEY,
                document    TEXT NOT NULL CHECK (json_valid(document)),
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            "#,
            table = collection
        ))
        .map_err(classify)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: collection.to_string(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Connection("connection mutex poisoned".to_string()))
    }

    fn json_path(field: &str) -> Result<String, StoreError> {
        if !FIELD_PATH.is_match(field) {
            return Err(StoreError::InvalidName(field.to_string()));
        }
        Ok(format!("$.{}", field))
    }

    fn index_name(&self, index: &IndexSpec) -> String {
        format!("{}_{}", self.table, index.name())
    }

    fn upsert_one(conn: &Connection, table: &str, op: &UpsertOp, now: &str) -> rusqlite::Result<bool> {
        let exists = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE record_id = ?1", table),
                params![op.key],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        conn.execute(
            &format!(
                "INSERT INTO {} (record_id, document, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(record_id) DO UPDATE SET document=excluded.document, updated_at=excluded.updated_at",
                table
            ),
            params![op.key, op.document.to_string(), now],
        )?;
        Ok(exists)
    }
}

/// Connection-level failures are fatal; everything else concerns one statement
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                StoreError::Authentication(err.to_string())
            }
            _ => StoreError::Connection(err.to_string()),
        },
        _ => StoreError::Connection(err.to_string()),
    }
}

fn is_item_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::ConstraintViolation | ErrorCode::TooBig | ErrorCode::TypeMismatch)
    )
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn ensure_index(&self, index: &IndexSpec) -> Result<IndexOutcome, StoreError> {
        let path = Self::json_path(&index.field)?;
        let name = self.index_name(index);
        let conn = self.conn()?;

        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map_err(classify)?
            .is_some();
        if exists {
            return Ok(IndexOutcome::AlreadyExists);
        }

        conn.execute_batch(&format!(
            "CREATE {unique} INDEX IF NOT EXISTS {name} ON {table} (json_extract(document, '{path}'))",
            unique = if index.unique { "UNIQUE" } else { "" },
            name = name,
            table = self.table,
            path = path,
        ))
        .map_err(classify)?;
        debug!("Created index {}", name);
        Ok(IndexOutcome::Created)
    }

    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError> {
        let mut conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction().map_err(classify)?;

        let mut result = BulkWriteResult::default();
        let mut write_errors = Vec::new();
        for (index, op) in ops.iter().enumerate() {
            if let Some(message) = validate_op(op, MAX_DOCUMENT_BYTES) {
                write_errors.push(WriteError {
                    index,
                    record_id: op.key.clone(),
                    message,
                });
                continue;
            }
            match Self::upsert_one(&tx, &self.table, op, &now) {
                Ok(true) => result.updated += 1,
                Ok(false) => result.inserted += 1,
                Err(e) if is_item_failure(&e) => write_errors.push(WriteError {
                    index,
                    record_id: op.key.clone(),
                    message: e.to_string(),
                }),
                // dropping the transaction rolls it back
                Err(e) => return Err(classify(e)),
            }
        }

        if !write_errors.is_empty() {
            tx.rollback().map_err(classify)?;
            return Err(StoreError::BulkWrite {
                message: format!("{} of {} documents rejected", write_errors.len(), ops.len()),
                write_errors,
            });
        }
        tx.commit().map_err(classify)?;
        Ok(result)
    }

    async fn find(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn()?;
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT document FROM {} WHERE record_id = ?1", self.table),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;
        text.map(|t| serde_json::from_str(&t).map_err(StoreError::from))
            .transpose()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get(0))
            .map_err(classify)?;
        Ok(n as usize)
    }

    async fn summary(&self, fields: &SummaryFields) -> Result<CollectionSummary, StoreError> {
        let category = Self::json_path(&fields.category_field)?;
        let length = Self::json_path(&fields.length_field)?;
        let ingestion = Self::json_path(INGESTION_TIMESTAMP_FIELD)?;
        let conn = self.conn()?;

        let sql = format!(
            "SELECT COUNT(*),
                    COUNT(DISTINCT json_extract(document, '{category}')),
                    MAX(json_extract(document, '{ingestion}')),
                    AVG(json_extract(document, '{length}'))
             FROM {table}",
            category = category,
            ingestion = ingestion,
            length = length,
            table = self.table,
        );
        let (total, distinct, latest, avg): (i64, i64, Option<String>, Option<f64>) = conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .map_err(classify)?;

        Ok(CollectionSummary {
            total_records: total as usize,
            distinct_categories: distinct as usize,
            latest_ingestion: latest,
            avg_length: avg.map(round2).unwrap_or(0.0),
        })
    }
}
