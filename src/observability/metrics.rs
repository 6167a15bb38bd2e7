//! Metric catalog and recording functions for the ETL run.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init`] installs the Prometheus recorder. A batch job has nothing to
//! scrape, so the rendered registry is pushed to a Pushgateway once the run
//! has finished.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Every metric name the pipeline records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Extract
    ExtractPagesFetched,
    ExtractRecordsFetched,
    ExtractPayloadBytes,
    ExtractRetries,
    ExtractRequestErrors,
    ExtractTruncations,

    // Transform
    TransformRecordsEnriched,
    TransformRecordsRejected,
    TransformQualityScore,

    // Load
    LoadRecordsInserted,
    LoadRecordsUpdated,
    LoadRecordErrors,
    LoadBatchesWritten,
    LoadBatchRetries,

    // Pipeline
    PipelineRunsCompleted,
    PipelineRunsFailed,
    PipelineRunDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::ExtractPagesFetched => "feed_etl_extract_pages_fetched_total",
            MetricName::ExtractRecordsFetched => "feed_etl_extract_records_fetched_total",
            MetricName::ExtractPayloadBytes => "feed_etl_extract_payload_bytes",
            MetricName::ExtractRetries => "feed_etl_extract_retries_total",
            MetricName::ExtractRequestErrors => "feed_etl_extract_request_errors_total",
            MetricName::ExtractTruncations => "feed_etl_extract_truncations_total",

            MetricName::TransformRecordsEnriched => "feed_etl_transform_records_enriched_total",
            MetricName::TransformRecordsRejected => "feed_etl_transform_records_rejected_total",
            MetricName::TransformQualityScore => "feed_etl_transform_quality_score",

            MetricName::LoadRecordsInserted => "feed_etl_load_records_inserted_total",
            MetricName::LoadRecordsUpdated => "feed_etl_load_records_updated_total",
            MetricName::LoadRecordErrors => "feed_etl_load_record_errors_total",
            MetricName::LoadBatchesWritten => "feed_etl_load_batches_written_total",
            MetricName::LoadBatchRetries => "feed_etl_load_batch_retries_total",

            MetricName::PipelineRunsCompleted => "feed_etl_pipeline_runs_completed_total",
            MetricName::PipelineRunsFailed => "feed_etl_pipeline_runs_failed_total",
            MetricName::PipelineRunDuration => "feed_etl_pipeline_run_duration_seconds",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            ExtractPagesFetched,
            ExtractRecordsFetched,
            ExtractPayloadBytes,
            ExtractRetries,
            ExtractRequestErrors,
            ExtractTruncations,
            TransformRecordsEnriched,
            TransformRecordsRejected,
            TransformQualityScore,
            LoadRecordsInserted,
            LoadRecordsUpdated,
            LoadRecordErrors,
            LoadBatchesWritten,
            LoadBatchRetries,
            PipelineRunsCompleted,
            PipelineRunsFailed,
            PipelineRunDuration,
        ]
        .into_iter()
    }

    /// (phase, description)
    pub fn metadata(&self) -> (&'static str, &'static str) {
        match self {
            MetricName::ExtractPagesFetched => ("extract", "Pages retrieved from the source API"),
            MetricName::ExtractRecordsFetched => ("extract", "Raw records yielded by the extractor"),
            MetricName::ExtractPayloadBytes => ("extract", "Response body size per page"),
            MetricName::ExtractRetries => ("extract", "Page requests scheduled for another attempt"),
            MetricName::ExtractRequestErrors => ("extract", "Page requests that failed"),
            MetricName::ExtractTruncations => ("extract", "Extractions cut short after retries ran out"),

            MetricName::TransformRecordsEnriched => ("transform", "Records enriched"),
            MetricName::TransformRecordsRejected => ("transform", "Records rejected during transform"),
            MetricName::TransformQualityScore => ("transform", "Data quality score distribution"),

            MetricName::LoadRecordsInserted => ("load", "Documents inserted"),
            MetricName::LoadRecordsUpdated => ("load", "Documents replaced"),
            MetricName::LoadRecordErrors => ("load", "Documents the store refused"),
            MetricName::LoadBatchesWritten => ("load", "Bulk writes committed"),
            MetricName::LoadBatchRetries => ("load", "Bulk writes retried without failed items"),

            MetricName::PipelineRunsCompleted => ("pipeline", "Runs that reached Completed"),
            MetricName::PipelineRunsFailed => ("pipeline", "Runs that ended in Failed"),
            MetricName::PipelineRunDuration => ("pipeline", "Wall time of a run"),
        }
    }

    fn is_histogram(&self) -> bool {
        matches!(
            self,
            MetricName::ExtractPayloadBytes | MetricName::TransformQualityScore | MetricName::PipelineRunDuration
        )
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init() -> Result<(), String> {
    if HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;

    for name in MetricName::all_metrics() {
        let (_, description) = name.metadata();
        if name.is_histogram() {
            ::metrics::describe_histogram!(name.as_str(), description);
        } else {
            ::metrics::describe_counter!(name.as_str(), description);
        }
    }

    let _ = HANDLE.set(handle);
    info!("Metrics system initialized");
    Ok(())
}

/// Prometheus text exposition of everything recorded so far
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

pub fn push_url(gateway: &str, job: &str, instance: &str) -> String {
    format!(
        "{}/metrics/job/{}/instance/{}",
        gateway.trim_end_matches('/'),
        job,
        instance
    )
}

/// Push the rendered registry to a Pushgateway. Failures are logged, never fatal.
pub async fn push_to_gateway(gateway: &str, job: &str, instance: &str) {
    let Some(body) = render() else {
        warn!("Metrics recorder not installed; nothing to push");
        return;
    };
    let url = push_url(gateway, job, instance);
    let result = reqwest::Client::new()
        .post(&url)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => {
            info!("Pushed metrics to {}", url);
        }
        Ok(resp) => {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!("Pushgateway returned status {}: {}", status, text);
        }
        Err(e) => warn!("Failed to push metrics to {}: {}", url, e),
    }
}

// ============================================================================
// Extract Metrics
// ============================================================================

pub mod extract {
    use super::MetricName;

    pub fn page_fetched(records: usize, bytes: usize) {
        ::metrics::counter!(MetricName::ExtractPagesFetched.as_str()).increment(1);
        ::metrics::counter!(MetricName::ExtractRecordsFetched.as_str()).increment(records as u64);
        ::metrics::histogram!(MetricName::ExtractPayloadBytes.as_str()).record(bytes as f64);
    }

    pub fn retry_scheduled() {
        ::metrics::counter!(MetricName::ExtractRetries.as_str()).increment(1);
    }

    pub fn request_failed() {
        ::metrics::counter!(MetricName::ExtractRequestErrors.as_str()).increment(1);
    }

    pub fn truncated() {
        ::metrics::counter!(MetricName::ExtractTruncations.as_str()).increment(1);
    }
}

// ============================================================================
// Transform Metrics
// ============================================================================

pub mod transform {
    use super::MetricName;

    pub fn record_enriched(quality_score: f64) {
        ::metrics::counter!(MetricName::TransformRecordsEnriched.as_str()).increment(1);
        ::metrics::histogram!(MetricName::TransformQualityScore.as_str()).record(quality_score);
    }

    pub fn record_rejected() {
        ::metrics::counter!(MetricName::TransformRecordsRejected.as_str()).increment(1);
    }
}

// ============================================================================
// Load Metrics
// ============================================================================

pub mod load {
    use super::MetricName;

    pub fn batch_written(inserted: usize, updated: usize) {
        ::metrics::counter!(MetricName::LoadBatchesWritten.as_str()).increment(1);
        ::metrics::counter!(MetricName::LoadRecordsInserted.as_str()).increment(inserted as u64);
        ::metrics::counter!(MetricName::LoadRecordsUpdated.as_str()).increment(updated as u64);
    }

    pub fn record_errors(count: usize) {
        ::metrics::counter!(MetricName::LoadRecordErrors.as_str()).increment(count as u64);
    }

    pub fn batch_retried() {
        ::metrics::counter!(MetricName::LoadBatchRetries.as_str()).increment(1);
    }
}

// ============================================================================
// Pipeline Metrics
// ============================================================================

pub mod pipeline {
    use super::MetricName;

    pub fn run_completed(elapsed_secs: f64) {
        ::metrics::counter!(MetricName::PipelineRunsCompleted.as_str()).increment(1);
        ::metrics::histogram!(MetricName::PipelineRunDuration.as_str()).record(elapsed_secs);
    }

    pub fn run_failed(stage: &'static str) {
        ::metrics::counter!(MetricName::PipelineRunsFailed.as_str(), "stage" => stage).increment(1);
    }
}
