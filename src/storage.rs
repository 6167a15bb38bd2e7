use crate::constants::{INGESTION_TIMESTAMP_FIELD, RECORD_ID_FIELD};
use crate::error::{StoreError, WriteError};
use crate::types::{JsonExt, RecordProfile};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Index over a (possibly dotted) document field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
}

impl IndexSpec {
    pub fn unique(field: &str) -> Self {
        Self {
            field: field.to_string(),
            unique: true,
        }
    }

    pub fn secondary(field: &str) -> Self {
        Self {
            field: field.to_string(),
            unique: false,
        }
    }

    pub fn name(&self) -> String {
        format!("{}_idx", self.field.replace('.', "_"))
    }
}

/// Indexes every collection of the given profile needs before the first write
pub fn required_indexes(profile: RecordProfile) -> Vec<IndexSpec> {
    let mut indexes = vec![IndexSpec::unique(RECORD_ID_FIELD)];
    match profile {
        RecordProfile::Nvd => {
            indexes.push(IndexSpec::secondary("severity_level"));
            indexes.push(IndexSpec::secondary("published"));
        }
        RecordProfile::Posts => {
            indexes.push(IndexSpec::secondary("user_id"));
        }
    }
    indexes.push(IndexSpec::secondary(INGESTION_TIMESTAMP_FIELD));
    indexes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    AlreadyExists,
}

/// Replace-or-insert of one document keyed by its natural identifier
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    pub key: String,
    pub document: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub updated: usize,
}

/// Fields the collection summary aggregates over
#[derive(Debug, Clone)]
pub struct SummaryFields {
    pub category_field: String,
    pub length_field: String,
}

impl SummaryFields {
    pub fn for_profile(profile: RecordProfile) -> Self {
        match profile {
            RecordProfile::Nvd => Self {
                category_field: "severity_level".to_string(),
                length_field: "description_length".to_string(),
            },
            RecordProfile::Posts => Self {
                category_field: "user_id".to_string(),
                length_field: "content_length".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub total_records: usize,
    pub distinct_categories: usize,
    pub latest_ingestion: Option<String>,
    pub avg_length: f64,
}

/// Document collection contract the loader writes through.
///
/// `bulk_upsert` applies a batch atomically: either every operation lands or
/// none does. On rejection the store reports per-item errors when it can tell
/// which operations were at fault.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_index(&self, index: &IndexSpec) -> Result<IndexOutcome, StoreError>;
    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError>;
    async fn find(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
    async fn summary(&self, fields: &SummaryFields) -> Result<CollectionSummary, StoreError>;
}

/// Lets a caller keep a handle on a store it hands to the loader
#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<T> {
    async fn ensure_index(&self, index: &IndexSpec) -> Result<IndexOutcome, StoreError> {
        (**self).ensure_index(index).await
    }

    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError> {
        (**self).bulk_upsert(ops).await
    }

    async fn find(&self, key: &str) -> Result<Option<Value>, StoreError> {
        (**self).find(key).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        (**self).count().await
    }

    async fn summary(&self, fields: &SummaryFields) -> Result<CollectionSummary, StoreError> {
        (**self).summary(fields).await
    }
}

/// Checks every document must pass before a write is accepted
pub fn validate_op(op: &UpsertOp, max_bytes: usize) -> Option<String> {
    if op.key.trim().is_empty() {
        return Some("empty record key".to_string());
    }
    if !op.document.is_object() {
        return Some("document is not a JSON object".to_string());
    }
    match op.document.field(RECORD_ID_FIELD).and_then(Value::as_str) {
        Some(id) if id == op.key => {}
        _ => return Some(format!("document {} does not match key", RECORD_ID_FIELD)),
    }
    let size = op.document.to_string().len();
    if size > max_bytes {
        return Some(format!("document is {} bytes, limit is {}", size, max_bytes));
    }
    None
}

pub(crate) fn dotted<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    let segments: Vec<&str> = field.split('.').collect();
    doc.path(&segments)
}

type ItemValidator = Box<dyn Fn(&UpsertOp) -> Option<String> + Send + Sync>;

/// In-memory collection for development/testing
pub struct InMemoryDocumentStore {
    documents: Mutex<BTreeMap<String, Value>>,
    indexes: Mutex<Vec<IndexSpec>>,
    validator: Option<ItemValidator>,
    identifies_failures: bool,
    offline: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(BTreeMap::new()),
            indexes: Mutex::new(Vec::new()),
            validator: None,
            identifies_failures: true,
            offline: AtomicBool::new(false),
        }
    }

    /// Extra per-document rule, e.g. a schema check the real store would enforce
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&UpsertOp) -> Option<String> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Behave like a store that rejects a batch without saying which item failed
    pub fn without_item_errors(mut self) -> Self {
        self.identifies_failures = false;
        self
    }

    /// Simulate losing the connection
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn index_specs(&self) -> Vec<IndexSpec> {
        self.indexes.lock().map(|i| i.clone()).unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("in-memory store is offline".to_string()));
        }
        Ok(())
    }

    fn documents(&self) -> Result<MutexGuard<'_, BTreeMap<String, Value>>, StoreError> {
        self.documents
            .lock()
            .map_err(|_| StoreError::Connection("document map poisoned".to_string()))
    }

    fn unique_conflict(
        docs: &BTreeMap<String, Value>,
        unique_fields: &[String],
        op: &UpsertOp,
        batch: &[UpsertOp],
        index: usize,
    ) -> Option<String> {
        for field in unique_fields {
            let Some(value) = dotted(&op.document, field) else {
                continue;
            };
            let clash_stored = docs
                .iter()
                .any(|(key, doc)| key != &op.key && dotted(doc, field) == Some(value));
            let clash_batch = batch[..index]
                .iter()
                .any(|other| other.key != op.key && dotted(&other.document, field) == Some(value));
            if clash_stored || clash_batch {
                return Some(format!("duplicate value for unique index on {}", field));
            }
        }
        None
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ensure_index(&self, index: &IndexSpec) -> Result<IndexOutcome, StoreError> {
        self.check_online()?;
        let mut indexes = self
            .indexes
            .lock()
            .map_err(|_| StoreError::Connection("index list poisoned".to_string()))?;
        if indexes.iter().any(|existing| existing.field == index.field) {
            return Ok(IndexOutcome::AlreadyExists);
        }
        indexes.push(index.clone());
        debug!("Created index {}", index.name());
        Ok(IndexOutcome::Created)
    }

    async fn bulk_upsert(&self, ops: &[UpsertOp]) -> Result<BulkWriteResult, StoreError> {
        self.check_online()?;
        let unique_fields: Vec<String> = self
            .index_specs()
            .into_iter()
            .filter(|i| i.unique && i.field != RECORD_ID_FIELD)
            .map(|i| i.field)
            .collect();
        let mut docs = self.documents()?;

        let write_errors: Vec<WriteError> = ops
            .iter()
            .enumerate()
            .filter_map(|(index, op)| {
                validate_op(op, crate::constants::MAX_DOCUMENT_BYTES)
                    .or_else(|| self.validator.as_ref().and_then(|v| v(op)))
                    .or_else(|| Self::unique_conflict(&docs, &unique_fields, op, ops, index))
                    .map(|message| WriteError {
                        index,
                        record_id: op.key.clone(),
                        message,
                    })
            })
            .collect();

        if !write_errors.is_empty() {
            return Err(StoreError::BulkWrite {
                message: format!("{} of {} documents rejected", write_errors.len(), ops.len()),
                write_errors: if self.identifies_failures { write_errors } else { Vec::new() },
            });
        }

        let mut result = BulkWriteResult::default();
        for op in ops {
            match docs.insert(op.key.clone(), op.document.clone()) {
                Some(_) => result.updated += 1,
                None => result.inserted += 1,
            }
        }
        Ok(result)
    }

    async fn find(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check_online()?;
        Ok(self.documents()?.get(key).cloned())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.check_online()?;
        Ok(self.documents()?.len())
    }

    async fn summary(&self, fields: &SummaryFields) -> Result<CollectionSummary, StoreError> {
        self.check_online()?;
        let docs = self.documents()?;

        let mut categories: Vec<String> = docs
            .values()
            .filter_map(|doc| dotted(doc, &fields.category_field))
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .collect();
        categories.sort();
        categories.dedup();

        let latest_ingestion = docs
            .values()
            .filter_map(|doc| dotted(doc, INGESTION_TIMESTAMP_FIELD).and_then(Value::as_str))
            .max()
            .map(str::to_string);

        let lengths: Vec<f64> = docs
            .values()
            .filter_map(|doc| dotted(doc, &fields.length_field).and_then(Value::as_f64))
            .collect();
        let avg_length = if lengths.is_empty() {
            0.0
        } else {
            round2(lengths.iter().sum::<f64>() / lengths.len() as f64)
        };

        Ok(CollectionSummary {
            total_records: docs.len(),
            distinct_categories: categories.len(),
            latest_ingestion,
            avg_length,
        })
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(key: &str, extra: Value) -> UpsertOp {
        let mut document = json!({"record_id": key, "etl_metadata": {"ingestion_timestamp": "2024-03-10T12:00:00Z"}});
        if let (Some(doc), Some(extra)) = (document.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                doc.insert(k.clone(), v.clone());
            }
        }
        UpsertOp {
            key: key.to_string(),
            document,
        }
    }

    #[tokio::test]
    async fn test_upsert_counts_inserts_then_updates() {
        let store = InMemoryDocumentStore::new();
        let first = store.bulk_upsert(&[op("a", json!({})), op("b", json!({}))]).await.unwrap();
        assert_eq!(first, BulkWriteResult { inserted: 2, updated: 0 });

        let second = store
            .bulk_upsert(&[op("a", json!({"severity_level": "LOW"}))])
            .await
            .unwrap();
        assert_eq!(second, BulkWriteResult { inserted: 0, updated: 1 });
        assert_eq!(store.count().await.unwrap(), 2);
        // full replace
        assert_eq!(store.find("a").await.unwrap().unwrap()["severity_level"], "LOW");
    }

    #[tokio::test]
    async fn test_ensure_index_is_idempotent() {
        let store = InMemoryDocumentStore::new();
        let spec = IndexSpec::unique(RECORD_ID_FIELD);
        assert_eq!(store.ensure_index(&spec).await.unwrap(), IndexOutcome::Created);
        assert_eq!(store.ensure_index(&spec).await.unwrap(), IndexOutcome::AlreadyExists);
        assert_eq!(store.index_specs().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_applies_nothing() {
        let store = InMemoryDocumentStore::new()
            .with_validator(|op| (op.key == "bad").then(|| "schema violation".to_string()));
        let err = store
            .bulk_upsert(&[op("good", json!({})), op("bad", json!({}))])
            .await
            .unwrap_err();

        match err {
            StoreError::BulkWrite { write_errors, .. } => {
                assert_eq!(write_errors.len(), 1);
                assert_eq!(write_errors[0].index, 1);
                assert_eq!(write_errors[0].record_id, "bad");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unique_secondary_index_is_enforced() {
        let store = InMemoryDocumentStore::new();
        store.ensure_index(&IndexSpec::unique("cve_id")).await.unwrap();
        let err = store
            .bulk_upsert(&[op("a", json!({"cve_id": "X"})), op("b", json!({"cve_id": "X"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BulkWrite { ref write_errors, .. } if write_errors[0].index == 1));
    }

    #[tokio::test]
    async fn test_offline_store_fails_fatally() {
        let store = InMemoryDocumentStore::new();
        store.set_offline(true);
        let err = store.count().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_summary() {
        let store = InMemoryDocumentStore::new();
        store
            .bulk_upsert(&[
                op("a", json!({"severity_level": "HIGH", "description_length": 100})),
                op("b", json!({"severity_level": "HIGH", "description_length": 51})),
                op("c", json!({"severity_level": "LOW"})),
            ])
            .await
            .unwrap();
        let summary = store.summary(&SummaryFields::for_profile(RecordProfile::Nvd)).await.unwrap();
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.distinct_categories, 2);
        assert_eq!(summary.avg_length, 75.5);
        assert_eq!(summary.latest_ingestion.as_deref(), Some("2024-03-10T12:00:00Z"));
    }

    #[test]
    fn test_required_indexes() {
        let nvd = required_indexes(RecordProfile::Nvd);
        assert!(nvd[0].unique);
        assert_eq!(nvd[0].field, RECORD_ID_FIELD);
        assert!(nvd.iter().any(|i| i.field == "severity_level"));
        assert!(nvd.iter().any(|i| i.field == INGESTION_TIMESTAMP_FIELD));
        assert_eq!(IndexSpec::secondary(INGESTION_TIMESTAMP_FIELD).name(), "etl_metadata_ingestion_timestamp_idx");
    }
}
