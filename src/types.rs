use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One item exactly as the feed returned it
pub type RawRecord = Value;

/// Fallible lookups over untyped JSON. Every accessor answers `None` when a
/// segment is absent or has the wrong shape instead of assuming presence.
pub trait JsonExt {
    fn field(&self, key: &str) -> Option<&Value>;
    fn path(&self, segments: &[&str]) -> Option<&Value>;

    fn str_at(&self, segments: &[&str]) -> Option<&str> {
        self.path(segments).and_then(Value::as_str)
    }

    fn f64_at(&self, segments: &[&str]) -> Option<f64> {
        self.path(segments).and_then(Value::as_f64)
    }

    fn array_at(&self, segments: &[&str]) -> Option<&Vec<Value>> {
        self.path(segments).and_then(Value::as_array)
    }

    fn object_at(&self, segments: &[&str]) -> Option<&Map<String, Value>> {
        self.path(segments).and_then(Value::as_object)
    }
}

impl JsonExt for Value {
    fn field(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    fn path(&self, segments: &[&str]) -> Option<&Value> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.field(segment))
    }
}

/// Shape of the feed being ingested. Decides where the natural identifier lives,
/// which facts are derived, and which indexes the collection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordProfile {
    /// NVD CVE API 2.0: `{"vulnerabilities": [{"cve": {...}}], "totalResults": n}`
    #[default]
    Nvd,
    /// JSONPlaceholder-style posts: top-level array of `{id, userId, title, body}`
    Posts,
}

impl RecordProfile {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nvd" | "cve" => Some(RecordProfile::Nvd),
            "posts" | "jsonplaceholder" => Some(RecordProfile::Posts),
            _ => None,
        }
    }

    /// Path of the natural identifier inside a raw record
    pub fn id_path(&self) -> &'static [&'static str] {
        match self {
            RecordProfile::Nvd => &["cve", "id"],
            RecordProfile::Posts => &["id"],
        }
    }
}

impl fmt::Display for RecordProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordProfile::Nvd => write!(f, "nvd"),
            RecordProfile::Posts => write!(f, "posts"),
        }
    }
}

/// CVSS metric families as keyed in NVD `metrics` blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CvssVersion {
    #[serde(rename = "4.0")]
    V40,
    #[serde(rename = "3.1")]
    V31,
    #[serde(rename = "3.0")]
    V30,
    #[serde(rename = "2.0")]
    V2,
}

impl CvssVersion {
    /// Newest first
    pub const DEFAULT_PRECEDENCE: [CvssVersion; 4] = [
        CvssVersion::V40,
        CvssVersion::V31,
        CvssVersion::V30,
        CvssVersion::V2,
    ];

    pub fn metric_key(&self) -> &'static str {
        match self {
            CvssVersion::V40 => "cvssMetricV40",
            CvssVersion::V31 => "cvssMetricV31",
            CvssVersion::V30 => "cvssMetricV30",
            CvssVersion::V2 => "cvssMetricV2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CvssVersion::V40 => "4.0",
            CvssVersion::V31 => "3.1",
            CvssVersion::V30 => "3.0",
            CvssVersion::V2 => "2.0",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches(['v', 'V']) {
            "4" | "4.0" => Some(CvssVersion::V40),
            "3.1" => Some(CvssVersion::V31),
            "3" | "3.0" => Some(CvssVersion::V30),
            "2" | "2.0" => Some(CvssVersion::V2),
            _ => None,
        }
    }
}
