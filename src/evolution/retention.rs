//! Retention policies deciding which records survive when the archive
//! exceeds its capacity.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::schema::{ProgramRecord, RetentionKind, Scores, compare_desc};

/// Selects the records to keep from an over-capacity population.
///
/// `records` arrive in insertion order. Implementations return at most
/// `capacity` ids; the archive evicts everything else.
pub trait RetentionPolicy: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &str;

    /// Ids of the records to keep.
    fn select(&self, records: &[&ProgramRecord], metrics: &[String], capacity: usize)
    -> Vec<String>;
}

impl RetentionKind {
    /// Instantiate the built-in policy.
    pub fn policy(self) -> Box<dyn RetentionPolicy> {
        match self {
            RetentionKind::Best => Box::new(KeepBest),
            RetentionKind::Pareto => Box::new(ParetoFront),
            RetentionKind::Diverse => Box::new(BestAndNewest::default()),
        }
    }
}

/// Keep the `capacity` records with the highest primary metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepBest;

impl RetentionPolicy for KeepBest {
    fn name(&self) -> &str {
        "best"
    }

    fn select(
        &self,
        records: &[&ProgramRecord],
        metrics: &[String],
        capacity: usize,
    ) -> Vec<String> {
        rank_by(records, primary(metrics))
            .into_iter()
            .take(capacity)
            .map(|r| r.id.clone())
            .collect()
    }
}

/// Keep the non-dominated front over all metrics, filled up to capacity by
/// primary metric. A front larger than capacity is truncated in insertion
/// order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParetoFront;

impl RetentionPolicy for ParetoFront {
    fn name(&self) -> &str {
        "pareto"
    }

    fn select(
        &self,
        records: &[&ProgramRecord],
        metrics: &[String],
        capacity: usize,
    ) -> Vec<String> {
        let front = non_dominated(records, metrics);
        let mut keep: Vec<String> = front.iter().map(|&i| records[i].id.clone()).collect();

        if keep.len() < capacity {
            let on_front: HashSet<usize> = front.into_iter().collect();
            let rest: Vec<&ProgramRecord> = records
                .iter()
                .enumerate()
                .filter(|(i, _)| !on_front.contains(i))
                .map(|(_, r)| *r)
                .collect();
            let needed = capacity - keep.len();
            keep.extend(
                rank_by(&rest, primary(metrics))
                    .into_iter()
                    .take(needed)
                    .map(|r| r.id.clone()),
            );
        }

        keep.truncate(capacity);
        keep
    }
}

/// Keep the best fraction by primary metric, then the newest records.
#[derive(Debug, Clone, Copy)]
pub struct BestAndNewest {
    /// Share of capacity reserved for the best records.
    pub best_fraction: f64,
}

impl Default for BestAndNewest {
    fn default() -> Self {
        Self { best_fraction: 0.5 }
    }
}

impl RetentionPolicy for BestAndNewest {
    fn name(&self) -> &str {
        "diverse"
    }

    fn select(
        &self,
        records: &[&ProgramRecord],
        metrics: &[String],
        capacity: usize,
    ) -> Vec<String> {
        let best_quota = ((capacity as f64) * self.best_fraction).floor() as usize;
        let mut keep = Vec::with_capacity(capacity);
        let mut seen = HashSet::new();

        for record in rank_by(records, primary(metrics)) {
            if keep.len() >= best_quota {
                break;
            }
            if seen.insert(record.id.as_str()) {
                keep.push(record.id.clone());
            }
        }

        // Newest first; later insertion wins equal timestamps.
        let mut newest: Vec<&ProgramRecord> = records.iter().rev().copied().collect();
        newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for record in newest {
            if keep.len() >= capacity {
                break;
            }
            if seen.insert(record.id.as_str()) {
                keep.push(record.id.clone());
            }
        }

        keep
    }
}

fn primary(metrics: &[String]) -> &str {
    metrics.first().map(String::as_str).unwrap_or("fitness")
}

/// Sort records by a metric, descending. The sort is stable, so equal
/// scores keep their input order.
pub fn rank_by<'a>(records: &[&'a ProgramRecord], metric: &str) -> Vec<&'a ProgramRecord> {
    let mut ranked = records.to_vec();
    ranked.sort_by(|a, b| compare_desc(&a.scores, &b.scores, metric));
    ranked
}

/// Whether `a` is no worse than `b` on every metric (maximization).
/// Equal score vectors dominate each other.
pub fn dominates(a: &Scores, b: &Scores, metrics: &[String]) -> bool {
    metrics
        .iter()
        .all(|m| a.get_or_worst(m) >= b.get_or_worst(m))
}

/// Indices of records not dominated by any other record, in input order.
pub fn non_dominated(records: &[&ProgramRecord], metrics: &[String]) -> Vec<usize> {
    (0..records.len())
        .into_par_iter()
        .filter(|&i| {
            !records.iter().enumerate().any(|(j, other)| {
                j != i && dominates(&other.scores, &records[i].scores, metrics)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Map;

    fn record(id: &str, scores: Scores, age_secs: i64) -> ProgramRecord {
        ProgramRecord {
            id: id.to_string(),
            code: format!("# {id}"),
            scores,
            parent_id: None,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(age_secs),
            metadata: Map::new(),
        }
    }

    fn metrics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keep_best() {
        let records = [
            record("a", Scores::from([("acc", 0.5)]), 0),
            record("b", Scores::from([("acc", 0.8)]), 1),
            record("c", Scores::error(), 2),
            record("d", Scores::from([("acc", 0.9)]), 3),
        ];
        let refs: Vec<&ProgramRecord> = records.iter().collect();
        let keep = KeepBest.select(&refs, &metrics(&["acc"]), 2);
        assert_eq!(keep, vec!["d", "b"]);
    }

    #[test]
    fn test_dominance() {
        let m = metrics(&["acc", "speed"]);
        let a = Scores::from([("acc", 0.9), ("speed", 0.9)]);
        let b = Scores::from([("acc", 0.5), ("speed", 0.5)]);
        let c = Scores::from([("acc", 0.9)]);
        assert!(dominates(&a, &b, &m));
        assert!(!dominates(&b, &a, &m));
        assert!(dominates(&a, &c, &m));
        // Ties count as dominating.
        assert!(dominates(&a, &a.clone(), &m));
    }

    #[test]
    fn test_non_dominated_excludes_strictly_dominated() {
        let m = metrics(&["acc", "speed"]);
        let records = [
            record("fast", Scores::from([("acc", 0.2), ("speed", 0.9)]), 0),
            record("accurate", Scores::from([("acc", 0.9), ("speed", 0.2)]), 1),
            record("dominated", Scores::from([("acc", 0.1), ("speed", 0.1)]), 2),
            record("balanced", Scores::from([("acc", 0.6), ("speed", 0.6)]), 3),
        ];
        let refs: Vec<&ProgramRecord> = records.iter().collect();
        assert_eq!(non_dominated(&refs, &m), vec![0, 1, 3]);

        let keep = ParetoFront.select(&refs, &m, 3);
        assert_eq!(keep, vec!["fast", "accurate", "balanced"]);
    }

    #[test]
    fn test_pareto_fills_by_primary() {
        let m = metrics(&["acc", "speed"]);
        let records = [
            record("top", Scores::from([("acc", 0.9), ("speed", 0.9)]), 0),
            record("low", Scores::from([("acc", 0.1), ("speed", 0.1)]), 1),
            record("mid", Scores::from([("acc", 0.5), ("speed", 0.4)]), 2),
        ];
        let refs: Vec<&ProgramRecord> = records.iter().collect();
        let keep = ParetoFront.select(&refs, &m, 2);
        assert_eq!(keep, vec!["top", "mid"]);
    }

    #[test]
    fn test_pareto_truncates_large_front() {
        let m = metrics(&["x", "y"]);
        let records: Vec<ProgramRecord> = (0..5)
            .map(|i| {
                let x = i as f64;
                record(&format!("p{i}"), Scores::from([("x", x), ("y", 4.0 - x)]), i)
            })
            .collect();
        let refs: Vec<&ProgramRecord> = records.iter().collect();
        let keep = ParetoFront.select(&refs, &m, 3);
        assert_eq!(keep, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn test_best_and_newest() {
        let m = metrics(&["acc"]);
        let records = [
            record("old_best", Scores::from([("acc", 0.9)]), 0),
            record("old_good", Scores::from([("acc", 0.8)]), 1),
            record("old_bad", Scores::from([("acc", 0.1)]), 2),
            record("new_bad", Scores::from([("acc", 0.2)]), 3),
            record("newest_bad", Scores::from([("acc", 0.0)]), 4),
        ];
        let refs: Vec<&ProgramRecord> = records.iter().collect();
        let keep = BestAndNewest::default().select(&refs, &m, 4);
        assert_eq!(keep, vec!["old_best", "old_good", "newest_bad", "new_bad"]);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(RetentionKind::Best.policy().name(), "best");
        assert_eq!(RetentionKind::Pareto.policy().name(), "pareto");
        assert_eq!(RetentionKind::Diverse.policy().name(), "diverse");
    }
}
