//! Field-level cleanup and extraction helpers used by the transformer.
//!
//! Everything here is a pure function over JSON fragments so the precedence
//! rules can be exercised without building whole records.

use crate::types::{CvssVersion, JsonExt};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Trims, drops control characters and collapses runs of whitespace
pub fn clean_text(input: &str) -> String {
    input
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// First English description, else the first non-empty one
pub fn pick_description(descriptions: &[Value]) -> Option<String> {
    let cleaned = |entry: &Value| {
        entry
            .str_at(&["value"])
            .map(clean_text)
            .filter(|text| !text.is_empty())
    };

    descriptions
        .iter()
        .filter(|entry| {
            entry
                .str_at(&["lang"])
                .map(|lang| lang.eq_ignore_ascii_case("en"))
                .unwrap_or(false)
        })
        .find_map(cleaned)
        .or_else(|| descriptions.iter().find_map(cleaned))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeverityMetric {
    pub version: CvssVersion,
    pub base_score: f64,
    pub base_severity: String,
    pub vector: Option<String>,
}

/// Walks `precedence` and returns the first CVSS family that carries a base
/// score. Within a family the `Primary` entry wins over secondary sources.
pub fn pick_severity(metrics: &Value, precedence: &[CvssVersion]) -> Option<SeverityMetric> {
    precedence.iter().find_map(|version| {
        let entries = metrics.array_at(&[version.metric_key()])?;
        let entry = entries
            .iter()
            .find(|e| e.str_at(&["type"]) == Some("Primary"))
            .or_else(|| entries.first())?;

        let base_score = entry.f64_at(&["cvssData", "baseScore"])?;
        // v2 keeps baseSeverity beside cvssData rather than inside it
        let base_severity = entry
            .str_at(&["cvssData", "baseSeverity"])
            .or_else(|| entry.str_at(&["baseSeverity"]))
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| severity_band(base_score).to_string());
        let vector = entry
            .str_at(&["cvssData", "vectorString"])
            .map(str::to_string);

        Some(SeverityMetric {
            version: *version,
            base_score,
            base_severity,
            vector,
        })
    })
}

/// CVSS v3 qualitative rating for a base score
pub fn severity_band(score: f64) -> &'static str {
    if score <= 0.0 {
        "NONE"
    } else if score < 4.0 {
        "LOW"
    } else if score < 7.0 {
        "MEDIUM"
    } else if score < 9.0 {
        "HIGH"
    } else {
        "CRITICAL"
    }
}

/// CWE identifiers in first-seen order, without duplicates
pub fn collect_weaknesses(weaknesses: &[Value]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for weakness in weaknesses {
        let Some(descriptions) = weakness.array_at(&["description"]) else {
            continue;
        };
        for entry in descriptions {
            if let Some(id) = entry.str_at(&["value"]).map(clean_text) {
                if !id.is_empty() && !found.contains(&id) {
                    found.push(id);
                }
            }
        }
    }
    found
}

/// Accepts RFC 3339, NVD's zone-less `2024-01-15T10:15:08.463`, or a bare date.
/// Zone-less values are read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Buffer\u{0000} overflow\n\tin   parser "), "Buffer overflow in parser");
        assert_eq!(clean_text("\u{0007}\u{001b}"), "");
    }

    #[test]
    fn test_description_prefers_english() {
        let descriptions = vec![
            json!({"lang": "es", "value": "Desbordamiento"}),
            json!({"lang": "en", "value": "  "}),
            json!({"lang": "en", "value": " Overflow in parser "}),
        ];
        assert_eq!(pick_description(&descriptions).as_deref(), Some("Overflow in parser"));

        let only_spanish = vec![json!({"lang": "es", "value": "Desbordamiento"})];
        assert_eq!(pick_description(&only_spanish).as_deref(), Some("Desbordamiento"));
        assert_eq!(pick_description(&[]), None);
    }

    fn metrics_block() -> Value {
        json!({
            "cvssMetricV31": [
                {"source": "other@example.com", "type": "Secondary",
                 "cvssData": {"version": "3.1", "baseScore": 5.0, "baseSeverity": "MEDIUM"}},
                {"source": "nvd@nist.gov", "type": "Primary",
                 "cvssData": {"version": "3.1", "baseScore": 7.5, "baseSeverity": "HIGH",
                              "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:N/A:N"}}
            ],
            "cvssMetricV2": [
                {"source": "nvd@nist.gov", "type": "Primary", "baseSeverity": "MEDIUM",
                 "cvssData": {"version": "2.0", "baseScore": 5.0}}
            ]
        })
    }

    #[test]
    fn test_newest_cvss_wins_by_default() {
        let picked = pick_severity(&metrics_block(), &CvssVersion::DEFAULT_PRECEDENCE).unwrap();
        assert_eq!(picked.version, CvssVersion::V31);
        assert_eq!(picked.base_score, 7.5);
        assert_eq!(picked.base_severity, "HIGH");
        assert!(picked.vector.unwrap().starts_with("CVSS:3.1"));
    }

    #[test]
    fn test_precedence_is_configurable() {
        let picked = pick_severity(&metrics_block(), &[CvssVersion::V2, CvssVersion::V31]).unwrap();
        assert_eq!(picked.version, CvssVersion::V2);
        assert_eq!(picked.base_severity, "MEDIUM");
        assert!(pick_severity(&metrics_block(), &[CvssVersion::V40]).is_none());
    }

    #[test]
    fn test_missing_severity_label_uses_band() {
        let metrics = json!({"cvssMetricV30": [{"cvssData": {"baseScore": 9.8}}]});
        let picked = pick_severity(&metrics, &CvssVersion::DEFAULT_PRECEDENCE).unwrap();
        assert_eq!(picked.base_severity, "CRITICAL");
        assert_eq!(severity_band(0.0), "NONE");
        assert_eq!(severity_band(3.9), "LOW");
        assert_eq!(severity_band(4.0), "MEDIUM");
        assert_eq!(severity_band(7.0), "HIGH");
    }

    #[test]
    fn test_weaknesses_are_deduplicated() {
        let weaknesses = vec![
            json!({"source": "a", "description": [{"lang": "en", "value": "CWE-79"}]}),
            json!({"source": "b", "description": [{"lang": "en", "value": "CWE-79"}, {"lang": "en", "value": "CWE-352"}]}),
            json!({"source": "c"}),
        ];
        assert_eq!(collect_weaknesses(&weaknesses), vec!["CWE-79", "CWE-352"]);
    }

    #[test]
    fn test_timestamp_formats() {
        let nvd = parse_timestamp("2024-01-15T10:15:08.463").unwrap();
        assert_eq!(nvd.to_rfc3339(), "2024-01-15T10:15:08.463+00:00");
        assert!(parse_timestamp("2024-01-15T10:15:08Z").is_some());
        assert!(parse_timestamp("2024-01-15").is_some());
        assert!(parse_timestamp("last tuesday").is_none());
    }
}
