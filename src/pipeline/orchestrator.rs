use crate::app::ports::{Clock, HttpClientPort};
use crate::config::Config;
use crate::error::EtlError;
use crate::observability::metrics;
use crate::pipeline::extract::{nvd_publication_window, ExtractRequest, Extractor, PageLayout};
use crate::pipeline::load::Loader;
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::transform::{EnrichedRecord, TransformOutcome, TransformSettings, Transformer};
use crate::storage::{CollectionSummary, DocumentStore, SummaryFields};
use crate::types::{RawRecord, RecordProfile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Extracting => "extracting",
            PipelineState::Transforming => "transforming",
            PipelineState::Loading => "loading",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts for one run. Filled in stage by stage; kept as-is when the run fails.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PipelineState,
    pub pages_fetched: usize,
    pub records_extracted: usize,
    pub records_transformed: usize,
    pub records_rejected: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub errors: usize,
    pub extraction_truncated: bool,
    pub hit_page_cap: bool,
    pub elapsed_secs: f64,
    /// Collection totals after a completed load
    pub collection: Option<CollectionSummary>,
}

impl PipelineStats {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            state: PipelineState::Idle,
            pages_fetched: 0,
            records_extracted: 0,
            records_transformed: 0,
            records_rejected: 0,
            records_inserted: 0,
            records_updated: 0,
            errors: 0,
            extraction_truncated: false,
            hit_page_cap: false,
            elapsed_secs: 0.0,
            collection: None,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "run {} {}: extracted={} transformed={} rejected={} inserted={} updated={} errors={} pages={} elapsed={:.2}s{}",
            self.run_id,
            self.state,
            self.records_extracted,
            self.records_transformed,
            self.records_rejected,
            self.records_inserted,
            self.records_updated,
            self.errors,
            self.pages_fetched,
            self.elapsed_secs,
            if self.extraction_truncated { " (extraction truncated)" } else { "" },
        )
    }
}

/// A run that hit a fatal error, with the stage it stopped in
#[derive(Error, Debug)]
#[error("pipeline failed while {stage}: {error}")]
pub struct PipelineFailure {
    pub stage: PipelineState,
    pub stats: PipelineStats,
    #[source]
    pub error: EtlError,
}

/// Runs Extract, then Transform, then Load, once.
///
/// Owns the rate limiter and lends it to the extractor; owns the loader and
/// with it the store connection, which is released when the orchestrator is
/// dropped at the end of [`run`](Self::run).
pub struct PipelineOrchestrator {
    state: PipelineState,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    extractor: Extractor,
    request: ExtractRequest,
    transformer: Transformer,
    loader: Loader,
}

impl PipelineOrchestrator {
    pub fn new(
        clock: Arc<dyn Clock>,
        limiter: RateLimiter,
        extractor: Extractor,
        request: ExtractRequest,
        transformer: Transformer,
        loader: Loader,
    ) -> Self {
        Self {
            state: PipelineState::Idle,
            clock,
            limiter,
            extractor,
            request,
            transformer,
            loader,
        }
    }

    /// Wires every stage from configuration
    pub fn from_config(
        config: &Config,
        http: Arc<dyn HttpClientPort>,
        clock: Arc<dyn Clock>,
        store: Box<dyn DocumentStore>,
    ) -> Self {
        let profile = config.api.profile;
        let limiter = RateLimiter::new(config.extract.rate_limit_delay(), clock.clone());
        let extractor = Extractor::new(
            http,
            clock.clone(),
            PageLayout::for_profile(profile),
            config.extract.retry_policy(),
            config.extract.max_pages,
        );

        let mut query: Vec<(String, String)> = config
            .api
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let (RecordProfile::Nvd, Some(days)) = (profile, config.api.lookback_days) {
            query.extend(nvd_publication_window(clock.utc_now(), days));
        }
        let request = ExtractRequest {
            base_url: config.api.resolved_base_url(),
            query,
            page_size: config.extract.page_size,
        };

        let settings = TransformSettings {
            profile,
            source_tag: config.source_tag(),
            freshness_window: config.transform.freshness_window(),
            min_description_length: config.transform.min_description_length,
            severity_precedence: config.transform.severity_precedence.clone(),
            weights: config.quality_weights(),
            run_id: Uuid::new_v4(),
        };
        let transformer = Transformer::new(settings, clock.clone());
        let loader = Loader::new(store, profile, config.store.batch_size);

        Self::new(clock, limiter, extractor, request, transformer, loader)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.transformer.settings().run_id
    }

    fn transition(&mut self, next: PipelineState, stats: &mut PipelineStats) {
        debug_assert!(!self.state.is_terminal(), "no transitions out of {}", self.state);
        debug!("Pipeline state {} -> {}", self.state, next);
        self.state = next;
        stats.state = next;
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<PipelineStats, PipelineFailure> {
        let started = self.clock.now();
        let mut stats = PipelineStats::new(self.run_id(), self.clock.utc_now());
        info!(
            "Starting {} pipeline run {} against {}",
            self.transformer.settings().profile,
            stats.run_id,
            self.request.base_url
        );

        self.transition(PipelineState::Extracting, &mut stats);
        let raw = match self.extract(&mut stats).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.fail(stats, started, e)),
        };

        self.transition(PipelineState::Transforming, &mut stats);
        let enriched = self.transform(raw, &mut stats);

        self.transition(PipelineState::Loading, &mut stats);
        match self.loader.load(&enriched).await {
            Ok(load) => {
                stats.records_inserted = load.inserted;
                stats.records_updated = load.updated;
                stats.errors += load.errors;
            }
            Err(e) => return Err(self.fail(stats, started, e.into())),
        }

        let fields = SummaryFields::for_profile(self.transformer.settings().profile);
        match self.loader.store().summary(&fields).await {
            Ok(summary) => stats.collection = Some(summary),
            Err(e) => warn!("Could not summarize collection: {}", e),
        }

        self.transition(PipelineState::Completed, &mut stats);
        self.finish(&mut stats, started);
        metrics::pipeline::run_completed(stats.elapsed_secs);
        info!("Pipeline completed: {}", stats.summary());
        Ok(stats)
    }

    async fn extract(&self, stats: &mut PipelineStats) -> Result<Vec<RawRecord>, EtlError> {
        let mut pages = self.extractor.extract(&self.limiter, self.request.clone());
        let result = pages.collect_all().await;
        stats.pages_fetched = pages.pages_fetched();
        let outcome = result?;

        stats.records_extracted = outcome.records.len();
        stats.hit_page_cap = outcome.hit_page_cap;
        if let Some(truncated) = &outcome.truncated {
            warn!("Continuing with partial extraction: {}", truncated);
            stats.extraction_truncated = true;
        }
        Ok(outcome.records)
    }

    fn transform(&self, raw: Vec<RawRecord>, stats: &mut PipelineStats) -> Vec<EnrichedRecord> {
        let mut enriched = Vec::with_capacity(raw.len());
        for record in raw {
            match self.transformer.transform(record) {
                TransformOutcome::Enriched(record) => enriched.push(*record),
                TransformOutcome::Rejected(rejection) => {
                    warn!("Rejected record ({}): {}", rejection.reason, rejection.excerpt);
                    stats.records_rejected += 1;
                }
            }
        }
        stats.records_transformed = enriched.len();
        info!(
            "Transformed {} records, rejected {}",
            stats.records_transformed, stats.records_rejected
        );
        enriched
    }

    fn finish(&self, stats: &mut PipelineStats, started: Instant) {
        stats.finished_at = Some(self.clock.utc_now());
        stats.elapsed_secs = self.clock.now().saturating_duration_since(started).as_secs_f64();
    }

    fn fail(&mut self, mut stats: PipelineStats, started: Instant, error: EtlError) -> PipelineFailure {
        let stage = self.state;
        self.transition(PipelineState::Failed, &mut stats);
        self.finish(&mut stats, started);
        metrics::pipeline::run_failed(stage.as_str());
        error!("Pipeline failed while {}: {}", stage, error);
        info!("Pipeline stopped: {}", stats.summary());
        PipelineFailure { stage, stats, error }
    }
}
