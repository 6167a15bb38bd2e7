use crate::error::StoreError;
use crate::observability::metrics;
use crate::pipeline::transform::EnrichedRecord;
use crate::storage::{required_indexes, DocumentStore, IndexOutcome, IndexSpec, UpsertOp};
use crate::types::RecordProfile;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, error, info, instrument, warn};

/// Per-run write counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
}

impl LoadStats {
    fn merge(&mut self, other: LoadStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}

/// Writes enriched records into a document collection, keyed by record id.
///
/// The loader owns the store for the duration of a run; the connection is
/// released when the loader is dropped.
pub struct Loader {
    store: Box<dyn DocumentStore>,
    indexes: Vec<IndexSpec>,
    batch_size: usize,
    indexes_ready: bool,
}

impl Loader {
    pub fn new(store: Box<dyn DocumentStore>, profile: RecordProfile, batch_size: usize) -> Self {
        Self {
            store,
            indexes: required_indexes(profile),
            batch_size: batch_size.max(1),
            indexes_ready: false,
        }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Creates any missing index. Runs against the store once per loader.
    pub async fn ensure_indexes(&mut self) -> Result<(), StoreError> {
        if self.indexes_ready {
            return Ok(());
        }
        for index in &self.indexes {
            match self.store.ensure_index(index).await? {
                IndexOutcome::Created => info!("Created index {}", index.name()),
                IndexOutcome::AlreadyExists => debug!("Index {} already present", index.name()),
            }
        }
        self.indexes_ready = true;
        Ok(())
    }

    /// Upserts `records` in batches. Only connection-level store failures are
    /// returned; refused documents are counted in `errors`.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn load(&mut self, records: &[EnrichedRecord]) -> Result<LoadStats, StoreError> {
        self.ensure_indexes().await?;

        let mut stats = LoadStats::default();
        for (batch_no, chunk) in records.chunks(self.batch_size).enumerate() {
            let mut ops = Vec::with_capacity(chunk.len());
            for record in chunk {
                match serde_json::to_value(record) {
                    Ok(document) => ops.push(UpsertOp {
                        key: record.record_id.clone(),
                        document,
                    }),
                    Err(e) => {
                        warn!(record_id = %record.record_id, "Could not serialize document: {}", e);
                        stats.errors += 1;
                        metrics::load::record_errors(1);
                    }
                }
            }
            if ops.is_empty() {
                continue;
            }
            let batch = self.write_batch(batch_no + 1, ops).await?;
            stats.merge(batch);
        }

        info!(
            "Load finished: {} inserted, {} updated, {} errors",
            stats.inserted, stats.updated, stats.errors
        );
        Ok(stats)
    }

    async fn write_batch(&self, batch_no: usize, ops: Vec<UpsertOp>) -> Result<LoadStats, StoreError> {
        let mut stats = LoadStats::default();

        let write_errors = match self.store.bulk_upsert(&ops).await {
            Ok(result) => {
                metrics::load::batch_written(result.inserted, result.updated);
                stats.inserted = result.inserted;
                stats.updated = result.updated;
                return Ok(stats);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(StoreError::BulkWrite { write_errors, .. }) if !write_errors.is_empty() => write_errors,
            Err(e) => {
                stats.errors = ops.len();
                report_unwritten(batch_no, &ops, &e);
                return Ok(stats);
            }
        };

        let failed: BTreeSet<usize> = write_errors
            .iter()
            .filter(|w| w.index < ops.len())
            .map(|w| w.index)
            .collect();
        for w in &write_errors {
            warn!(batch = batch_no, record_id = %w.record_id, "Document rejected: {}", w.message);
        }
        stats.errors = failed.len();
        metrics::load::record_errors(failed.len());

        let survivors: Vec<UpsertOp> = ops
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !failed.contains(i))
            .map(|(_, op)| op)
            .collect();
        if survivors.is_empty() {
            return Ok(stats);
        }

        metrics::load::batch_retried();
        debug!(batch = batch_no, "Retrying batch with {} surviving documents", survivors.len());
        match self.store.bulk_upsert(&survivors).await {
            Ok(result) => {
                metrics::load::batch_written(result.inserted, result.updated);
                stats.inserted = result.inserted;
                stats.updated = result.updated;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                stats.errors += survivors.len();
                report_unwritten(batch_no, &survivors, &e);
            }
        }
        Ok(stats)
    }
}

/// Logs every id of a batch that was not written so it can be replayed by hand
fn report_unwritten(batch_no: usize, ops: &[UpsertOp], err: &StoreError) {
    metrics::load::record_errors(ops.len());
    let ids: Vec<&str> = ops.iter().map(|op| op.key.as_str()).collect();
    error!(
        batch = batch_no,
        record_ids = %ids.join(","),
        "Batch of {} documents not written: {}",
        ops.len(),
        err
    );
}
