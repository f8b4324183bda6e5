//! Program records and score vectors.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sentinel metric reported when scoring failed.
pub const ERROR_METRIC: &str = "error";
/// Sentinel metric reported when scoring exceeded its time limit.
pub const TIMEOUT_METRIC: &str = "timeout";

/// Metadata key the archive uses to flag evicted records.
pub const ACTIVE_KEY: &str = "active";

/// Metric name to score mapping. Higher is better for every metric.
///
/// A metric absent from the mapping ranks as negative infinity; every
/// comparison in the crate goes through [`Scores::get_or_worst`] so partial
/// or sentinel results never win a score-based comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scores(BTreeMap<String, f64>);

impl Scores {
    /// Create an empty score mapping.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// `{"error": 1.0}`.
    pub fn error() -> Self {
        Self::new().with(ERROR_METRIC, 1.0)
    }

    /// `{"timeout": 1.0}`.
    pub fn timeout() -> Self {
        Self::new().with(TIMEOUT_METRIC, 1.0)
    }

    /// Builder-style insert.
    pub fn with(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.0.insert(metric.into(), value);
        self
    }

    /// Set a metric value.
    pub fn insert(&mut self, metric: impl Into<String>, value: f64) {
        self.0.insert(metric.into(), value);
    }

    /// Raw metric value, if present.
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    /// Metric value for ranking; missing or NaN values rank as negative infinity.
    pub fn get_or_worst(&self, metric: &str) -> f64 {
        match self.0.get(metric) {
            Some(value) if !value.is_nan() => *value,
            _ => f64::NEG_INFINITY,
        }
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.0.contains_key(metric)
    }

    /// Whether this mapping carries an error or timeout sentinel.
    pub fn is_failure(&self) -> bool {
        self.contains(ERROR_METRIC) || self.contains(TIMEOUT_METRIC)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Metric names present in this mapping.
    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, f64)> for Scores {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, f64); N]> for Scores {
    fn from(pairs: [(&str, f64); N]) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

impl fmt::Display for Scores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Descending comparison of two score mappings on one metric.
pub fn compare_desc(a: &Scores, b: &Scores, metric: &str) -> Ordering {
    b.get_or_worst(metric).total_cmp(&a.get_or_worst(metric))
}

/// A stored program variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRecord {
    /// Unique identifier.
    pub id: String,
    /// Full source text.
    pub code: String,
    /// Evaluation result.
    pub scores: Scores,
    /// Record this program was derived from.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Free-form metadata, mutated only by the archive.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ProgramRecord {
    /// Ranking score for a metric (missing = negative infinity).
    pub fn score(&self, metric: &str) -> f64 {
        self.scores.get_or_worst(metric)
    }

    /// False once the archive has evicted this record.
    pub fn is_active(&self) -> bool {
        self.metadata
            .get(ACTIVE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_metric_ranks_worst() {
        let scores = Scores::from([("accuracy", 0.4)]);
        assert_eq!(scores.get_or_worst("accuracy"), 0.4);
        assert_eq!(scores.get_or_worst("speed"), f64::NEG_INFINITY);

        let nan = Scores::from([("accuracy", f64::NAN)]);
        assert_eq!(nan.get_or_worst("accuracy"), f64::NEG_INFINITY);
    }

    #[test]
    fn test_sentinels() {
        assert!(Scores::error().is_failure());
        assert!(Scores::timeout().is_failure());
        assert!(!Scores::from([("accuracy", 1.0)]).is_failure());
        assert_eq!(Scores::timeout().get(TIMEOUT_METRIC), Some(1.0));
    }

    #[test]
    fn test_compare_desc_puts_missing_last() {
        let good = Scores::from([("accuracy", 0.9)]);
        let failed = Scores::error();
        assert_eq!(compare_desc(&good, &failed, "accuracy"), Ordering::Less);
        assert_eq!(compare_desc(&failed, &failed, "accuracy"), Ordering::Equal);
    }

    #[test]
    fn test_scores_serialize_as_plain_map() {
        let scores = Scores::from([("a", 0.5), ("b", 1.0)]);
        let json = serde_json::to_string(&scores).unwrap();
        assert_eq!(json, r#"{"a":0.5,"b":1.0}"#);
        assert_eq!(scores.to_string(), "a: 0.5, b: 1");
    }

    #[test]
    fn test_record_active_flag() {
        let mut record = ProgramRecord {
            id: "p".to_string(),
            code: String::new(),
            scores: Scores::new(),
            parent_id: None,
            created_at: Utc::now(),
            metadata: Map::new(),
        };
        assert!(record.is_active());
        record.metadata.insert(ACTIVE_KEY.to_string(), Value::Bool(false));
        assert!(!record.is_active());
    }
}
