use crate::app::ports::Clock;
use crate::constants;
use crate::observability::metrics;
use crate::pipeline::normalize::{
    clean_text, collect_weaknesses, parse_timestamp, pick_description, pick_severity, word_count,
};
use crate::pipeline::quality::{Criterion, QualityScorer, QualitySignals, QualityWeights};
use crate::types::{CvssVersion, JsonExt, RawRecord, RecordProfile};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

static CVE_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^CVE-\d{4}-\d{4,}$").unwrap());

/// Knobs fixed for one run
#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub profile: RecordProfile,
    pub source_tag: String,
    pub freshness_window: chrono::Duration,
    pub min_description_length: usize,
    pub severity_precedence: Vec<CvssVersion>,
    pub weights: QualityWeights,
    pub run_id: Uuid,
}

impl TransformSettings {
    pub fn for_profile(profile: RecordProfile) -> Self {
        Self {
            profile,
            source_tag: match profile {
                RecordProfile::Nvd => constants::NVD_SOURCE_TAG.to_string(),
                RecordProfile::Posts => constants::POSTS_SOURCE_TAG.to_string(),
            },
            freshness_window: chrono::Duration::days(constants::DEFAULT_FRESHNESS_WINDOW_DAYS),
            min_description_length: constants::DEFAULT_MIN_DESCRIPTION_LENGTH,
            severity_precedence: CvssVersion::DEFAULT_PRECEDENCE.to_vec(),
            weights: QualityWeights::for_profile(profile),
            run_id: Uuid::new_v4(),
        }
    }
}

/// Why a raw record never became an enriched one
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    MissingIdentifier,
    MalformedRecord(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::MissingIdentifier => write!(f, "missing identifier"),
            RejectionReason::MalformedRecord(detail) => write!(f, "malformed record: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: RejectionReason,
    /// Short rendering of the offending record for the log
    pub excerpt: String,
}

#[derive(Debug, Clone)]
pub enum TransformOutcome {
    Enriched(Box<EnrichedRecord>),
    Rejected(Rejection),
}

impl TransformOutcome {
    pub fn enriched(self) -> Option<EnrichedRecord> {
        match self {
            TransformOutcome::Enriched(record) => Some(*record),
            TransformOutcome::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, TransformOutcome::Rejected(_))
    }
}

/// Document shape written to the store
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedRecord {
    pub record_id: String,
    pub original_data: RawRecord,
    pub etl_metadata: EtlMetadata,
    #[serde(flatten)]
    pub derived: DerivedFields,
    pub validation: Validation,
}

#[derive(Debug, Clone, Serialize)]
pub struct EtlMetadata {
    pub ingestion_timestamp: DateTime<Utc>,
    pub source: String,
    pub schema_version: String,
    pub record_id: String,
    pub data_quality_score: f64,
    pub run_id: Uuid,
    /// SHA-256 of the raw record as received
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DerivedFields {
    Vulnerability(VulnerabilityFacts),
    Post(PostFacts),
}

#[derive(Debug, Clone, Serialize)]
pub struct VulnerabilityFacts {
    pub cve_id: String,
    pub source_identifier: Option<String>,
    pub vuln_status: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub description_length: usize,
    pub description_word_count: usize,
    pub severity_score: Option<f64>,
    pub severity_level: Option<String>,
    pub cvss_version: Option<String>,
    pub cvss_vector: Option<String>,
    pub has_severity_score: bool,
    pub weaknesses: Vec<String>,
    pub reference_count: usize,
    pub is_recent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostFacts {
    pub post_id: String,
    pub user_id: Option<i64>,
    pub title: String,
    pub body: String,
    pub title_word_count: usize,
    pub body_word_count: usize,
    pub has_content: bool,
    pub content_length: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Validation {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

impl Validation {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            is_valid: issues.is_empty(),
            issues,
        }
    }
}

impl DerivedFields {
    /// Quality signals read from the derived fields alone, so the score is a
    /// pure function of the enriched record.
    pub fn quality_signals(&self, min_description_length: usize) -> QualitySignals {
        let mut signals = QualitySignals::new();
        // enriched records always carry an identifier
        signals.mark(Criterion::Identifier, true);
        match self {
            DerivedFields::Vulnerability(facts) => {
                signals
                    .mark(
                        Criterion::Description,
                        facts.description.is_some() && facts.description_length >= min_description_length,
                    )
                    .mark(Criterion::SeverityScore, facts.has_severity_score)
                    .mark(Criterion::References, facts.reference_count > 0);
            }
            DerivedFields::Post(facts) => {
                signals
                    .mark(Criterion::Description, !facts.body.is_empty())
                    .mark(Criterion::Title, !facts.title.is_empty())
                    .mark(Criterion::Author, facts.user_id.is_some());
            }
        }
        signals
    }
}

/// Maps raw feed items to enriched documents: cleans and lifts nested fields,
/// derives facts, validates, and scores.
pub struct Transformer {
    settings: TransformSettings,
    scorer: QualityScorer,
    clock: Arc<dyn Clock>,
}

impl Transformer {
    pub fn new(settings: TransformSettings, clock: Arc<dyn Clock>) -> Self {
        let scorer = QualityScorer::new(settings.weights.clone());
        Self {
            settings,
            scorer,
            clock,
        }
    }

    pub fn settings(&self) -> &TransformSettings {
        &self.settings
    }

    /// Transforms one record stamped with the clock's current time
    pub fn transform(&self, raw: RawRecord) -> TransformOutcome {
        self.transform_at(raw, self.clock.utc_now())
    }

    pub fn transform_at(&self, raw: RawRecord, now: DateTime<Utc>) -> TransformOutcome {
        if !raw.is_object() {
            return self.reject(RejectionReason::MalformedRecord("expected a JSON object".to_string()), &raw);
        }
        let Some(record_id) = self.natural_id(&raw) else {
            return self.reject(RejectionReason::MissingIdentifier, &raw);
        };

        let (derived, issues) = match self.settings.profile {
            RecordProfile::Nvd => match raw.field("cve") {
                Some(cve) if cve.is_object() => {
                    let (facts, issues) = self.vulnerability_facts(&record_id, cve, now);
                    (DerivedFields::Vulnerability(facts), issues)
                }
                _ => {
                    return self.reject(RejectionReason::MalformedRecord("'cve' is not an object".to_string()), &raw)
                }
            },
            RecordProfile::Posts => {
                let (facts, issues) = post_facts(&record_id, &raw);
                (DerivedFields::Post(facts), issues)
            }
        };

        let score = self
            .scorer
            .score(&derived.quality_signals(self.settings.min_description_length));
        metrics::transform::record_enriched(score);

        TransformOutcome::Enriched(Box::new(EnrichedRecord {
            record_id: record_id.clone(),
            etl_metadata: EtlMetadata {
                ingestion_timestamp: now,
                source: self.settings.source_tag.clone(),
                schema_version: constants::SCHEMA_VERSION.to_string(),
                record_id: record_id.clone(),
                data_quality_score: score,
                run_id: self.settings.run_id,
                content_hash: content_hash(&raw),
            },
            original_data: raw,
            derived,
            validation: Validation::from_issues(issues),
        }))
    }

    fn natural_id(&self, raw: &RawRecord) -> Option<String> {
        match raw.path(self.settings.profile.id_path())? {
            Value::String(s) => Some(clean_text(s)).filter(|id| !id.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn vulnerability_facts(
        &self,
        record_id: &str,
        cve: &Value,
        now: DateTime<Utc>,
    ) -> (VulnerabilityFacts, Vec<String>) {
        let mut issues = Vec::new();
        if !CVE_ID.is_match(record_id) {
            issues.push(format!("identifier '{}' is not a CVE id", record_id));
        }

        let description = cve
            .array_at(&["descriptions"])
            .and_then(|d| pick_description(d));
        if description.is_none() {
            issues.push("missing description".to_string());
        }
        let description_length = description.as_deref().map(|d| d.chars().count()).unwrap_or(0);
        let description_word_count = description.as_deref().map(word_count).unwrap_or(0);

        let severity = cve
            .path(&["metrics"])
            .and_then(|m| pick_severity(m, &self.settings.severity_precedence));
        if let Some(metric) = &severity {
            if !(0.0..=10.0).contains(&metric.base_score) {
                issues.push(format!("severity score {} outside 0-10", metric.base_score));
            }
        }

        let published = cve.str_at(&["published"]).and_then(parse_timestamp);
        if published.is_none() {
            issues.push("missing or unparseable publish date".to_string());
        }
        let is_recent = published
            .map(|p| p <= now && now - p <= self.settings.freshness_window)
            .unwrap_or(false);

        let facts = VulnerabilityFacts {
            cve_id: record_id.to_string(),
            source_identifier: cve.str_at(&["sourceIdentifier"]).map(clean_text),
            vuln_status: cve.str_at(&["vulnStatus"]).map(clean_text),
            published,
            last_modified: cve.str_at(&["lastModified"]).and_then(parse_timestamp),
            description_length,
            description_word_count,
            description,
            severity_score: severity.as_ref().map(|m| m.base_score),
            severity_level: severity.as_ref().map(|m| m.base_severity.clone()),
            cvss_version: severity.as_ref().map(|m| m.version.as_str().to_string()),
            cvss_vector: severity.as_ref().and_then(|m| m.vector.clone()),
            has_severity_score: severity.is_some(),
            weaknesses: cve
                .array_at(&["weaknesses"])
                .map(|w| collect_weaknesses(w))
                .unwrap_or_default(),
            reference_count: cve.array_at(&["references"]).map(Vec::len).unwrap_or(0),
            is_recent,
        };
        (facts, issues)
    }

    fn reject(&self, reason: RejectionReason, raw: &RawRecord) -> TransformOutcome {
        let excerpt: String = raw.to_string().chars().take(120).collect();
        debug!("Rejecting record ({}): {}", reason, excerpt);
        metrics::transform::record_rejected();
        TransformOutcome::Rejected(Rejection { reason, excerpt })
    }
}

fn post_facts(record_id: &str, raw: &RawRecord) -> (PostFacts, Vec<String>) {
    let mut issues = Vec::new();
    let title = raw.str_at(&["title"]).map(clean_text).unwrap_or_default();
    let body = raw.str_at(&["body"]).map(clean_text).unwrap_or_default();
    let user_id = raw.path(&["userId"]).and_then(Value::as_i64);

    if user_id.is_none() {
        issues.push("missing userId".to_string());
    }
    if title.is_empty() && body.is_empty() {
        issues.push("post has neither title nor body".to_string());
    }

    let content_length = format!("{} {}", title, body).trim().chars().count();
    let facts = PostFacts {
        post_id: record_id.to_string(),
        user_id,
        title_word_count: word_count(&title),
        body_word_count: word_count(&body),
        has_content: !title.is_empty() || !body.is_empty(),
        content_length,
        title,
        body,
    };
    (facts, issues)
}

/// SHA-256 over the record with object keys sorted, so key order in the feed
/// does not change the hash
fn content_hash(raw: &RawRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(raw).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), canonical_json(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-10T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn nvd_transformer() -> Transformer {
        Transformer::new(
            TransformSettings::for_profile(RecordProfile::Nvd),
            Arc::new(ManualClock::new(now())),
        )
    }

    fn full_cve() -> Value {
        json!({
            "cve": {
                "id": "CVE-2024-0001",
                "sourceIdentifier": "cna@example.com",
                "published": "2024-03-09T08:15:00.000",
                "lastModified": "2024-03-09T09:00:00.000",
                "vulnStatus": "Analyzed",
                "descriptions": [{"lang": "en", "value": "x".repeat(300)}],
                "metrics": {
                    "cvssMetricV31": [{"type": "Primary",
                        "cvssData": {"baseScore": 7.5, "baseSeverity": "HIGH",
                                     "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:N/A:N"}}]
                },
                "weaknesses": [{"description": [{"lang": "en", "value": "CWE-787"}]}],
                "references": [{"url": "https://a"}, {"url": "https://b"}, {"url": "https://c"}]
            }
        })
    }

    #[test]
    fn test_complete_cve_scores_maximum() {
        let record = nvd_transformer().transform(full_cve()).enriched().unwrap();

        assert_eq!(record.record_id, "CVE-2024-0001");
        assert_eq!(record.etl_metadata.data_quality_score, 1.0);
        assert_eq!(record.etl_metadata.ingestion_timestamp, now());
        assert_eq!(record.etl_metadata.schema_version, "1.0");
        assert_eq!(record.etl_metadata.source, constants::NVD_SOURCE_TAG);
        assert!(record.validation.is_valid);
        assert_eq!(record.original_data, full_cve());

        let DerivedFields::Vulnerability(facts) = &record.derived else {
            panic!("expected vulnerability facts");
        };
        assert!(facts.is_recent);
        assert_eq!(facts.severity_score, Some(7.5));
        assert_eq!(facts.severity_level.as_deref(), Some("HIGH"));
        assert_eq!(facts.cvss_version.as_deref(), Some("3.1"));
        assert_eq!(facts.reference_count, 3);
        assert_eq!(facts.description_length, 300);
        assert_eq!(facts.weaknesses, vec!["CWE-787"]);
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = json!({"id": 1, "userId": 2, "nested": {"b": [1, {"y": 1, "x": 2}], "a": null}});
        let b = json!({"nested": {"a": null, "b": [1, {"x": 2, "y": 1}]}, "userId": 2, "id": 1});
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"id": 2, "userId": 2})));
    }

    #[test]
    fn test_missing_identifier_is_rejected() {
        let transformer = nvd_transformer();
        for raw in [
            json!({"cve": {"descriptions": []}}),
            json!({"cve": {"id": "   "}}),
            json!({"cve": {"id": null}}),
        ] {
            match transformer.transform(raw) {
                TransformOutcome::Rejected(rejection) => {
                    assert_eq!(rejection.reason, RejectionReason::MissingIdentifier);
                    assert_eq!(rejection.reason.to_string(), "missing identifier");
                }
                TransformOutcome::Enriched(_) => panic!("record without id must be rejected"),
            }
        }
    }

    #[test]
    fn test_non_object_is_malformed() {
        let outcome = nvd_transformer().transform(json!("CVE-2024-0001"));
        assert!(matches!(
            outcome,
            TransformOutcome::Rejected(Rejection { reason: RejectionReason::MalformedRecord(_), .. })
        ));
    }

    #[test]
    fn test_sparse_cve_is_stored_but_flagged() {
        let raw = json!({"cve": {"id": "CVE-2024-0002", "published": "2023-01-01T00:00:00.000"}});
        let record = nvd_transformer().transform(raw).enriched().unwrap();

        assert_eq!(record.etl_metadata.data_quality_score, 0.25);
        assert!(!record.validation.is_valid);
        assert!(record.validation.issues.iter().any(|i| i.contains("description")));
        let DerivedFields::Vulnerability(facts) = &record.derived else {
            panic!("expected vulnerability facts");
        };
        assert!(!facts.is_recent);
        assert!(!facts.has_severity_score);
    }

    #[test]
    fn test_score_ignores_call_order_and_clock() {
        let transformer = nvd_transformer();
        let first = transformer.transform_at(full_cve(), now());
        let _ = transformer.transform(json!({"cve": {"id": "CVE-2024-0009"}}));
        let later = transformer.transform_at(full_cve(), now() + chrono::Duration::days(30));

        let a = first.enriched().unwrap();
        let b = later.enriched().unwrap();
        assert_eq!(a.etl_metadata.data_quality_score, b.etl_metadata.data_quality_score);
        assert_eq!(a.etl_metadata.content_hash, b.etl_metadata.content_hash);
    }

    #[test]
    fn test_post_profile() {
        let transformer = Transformer::new(
            TransformSettings::for_profile(RecordProfile::Posts),
            Arc::new(ManualClock::new(now())),
        );
        let raw = json!({"userId": 3, "id": 21, "title": " asperiores ea ipsam ", "body": "voluptas\nquia"});
        let record = transformer.transform(raw).enriched().unwrap();

        assert_eq!(record.record_id, "21");
        assert_eq!(record.etl_metadata.data_quality_score, 1.0);
        let DerivedFields::Post(facts) = &record.derived else {
            panic!("expected post facts");
        };
        assert_eq!(facts.title, "asperiores ea ipsam");
        assert_eq!(facts.title_word_count, 3);
        assert_eq!(facts.body_word_count, 2);
        assert_eq!(facts.content_length, "asperiores ea ipsam voluptas quia".len());
        assert!(facts.has_content);
    }

    #[test]
    fn test_document_is_flat() {
        let record = nvd_transformer().transform(full_cve()).enriched().unwrap();
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["record_id"], "CVE-2024-0001");
        assert_eq!(doc["severity_level"], "HIGH");
        assert_eq!(doc["etl_metadata"]["record_id"], "CVE-2024-0001");
        assert_eq!(doc["original_data"]["cve"]["id"], "CVE-2024-0001");
        assert_eq!(doc["validation"]["is_valid"], true);
    }
}
