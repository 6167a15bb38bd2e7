// Extract -> Transform -> Load, plus the policies the stages share

pub mod extract;
pub mod load;
pub mod normalize;
pub mod orchestrator;
pub mod quality;
pub mod rate_limiter;
pub mod retry;
pub mod transform;

pub use extract::{ExtractOutcome, ExtractRequest, Extractor, PageLayout};
pub use load::{LoadStats, Loader};
pub use orchestrator::{PipelineFailure, PipelineOrchestrator, PipelineState, PipelineStats};
pub use quality::{Criterion, QualityScorer, QualityWeights};
pub use rate_limiter::RateLimiter;
pub use retry::{Backoff, RetryPolicy};
pub use transform::{EnrichedRecord, TransformOutcome, TransformSettings, Transformer};
