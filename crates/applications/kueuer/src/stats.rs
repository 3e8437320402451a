//! Summary statistics over job timings

use chrono::{DateTime, Utc};
use kueuer_core::JobTiming;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistics of a cohort of completed jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingStatistics {
    /// Jobs that contributed (both timestamps and a duration)
    pub samples: usize,
    /// Earliest creation
    pub first_creation: DateTime<Utc>,
    /// Latest creation
    pub last_creation: DateTime<Utc>,
    /// Earliest completion
    pub first_completion: DateTime<Utc>,
    /// Latest completion
    pub last_completion: DateTime<Utc>,
    /// Mean creation-to-completion time
    pub mean_duration_secs: f64,
    /// Median creation-to-completion time
    pub median_duration_secs: f64,
    /// Sample standard deviation; zero below two samples
    pub std_dev_duration_secs: f64,
    /// Last completion minus first creation
    pub total_span_secs: f64,
}

/// Compute statistics over every entry with creation, completion and duration.
///
/// Returns `None` when no entry qualifies.
pub fn compute_statistics(timings: &BTreeMap<String, JobTiming>) -> Option<TimingStatistics> {
    let complete: Vec<(DateTime<Utc>, DateTime<Utc>, f64)> = timings
        .values()
        .filter_map(|t| Some((t.creation?, t.completion?, t.duration_secs?)))
        .collect();

    let first_creation = complete.iter().map(|c| c.0).min()?;
    let last_creation = complete.iter().map(|c| c.0).max()?;
    let first_completion = complete.iter().map(|c| c.1).min()?;
    let last_completion = complete.iter().map(|c| c.1).max()?;

    let mut durations: Vec<f64> = complete.iter().map(|c| c.2).collect();
    durations.sort_by(f64::total_cmp);

    let samples = durations.len();
    let mean = durations.iter().sum::<f64>() / samples as f64;
    let median = if samples % 2 == 0 {
        (durations[samples / 2 - 1] + durations[samples / 2]) / 2.0
    } else {
        durations[samples / 2]
    };
    let std_dev = if samples < 2 {
        0.0
    } else {
        let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>()
            / (samples - 1) as f64;
        variance.sqrt()
    };

    let total_span_secs = (last_completion - first_creation).num_milliseconds() as f64 / 1000.0;

    Some(TimingStatistics {
        samples,
        first_creation,
        last_creation,
        first_completion,
        last_completion,
        mean_duration_secs: mean,
        median_duration_secs: median,
        std_dev_duration_secs: std_dev,
        total_span_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::at;

    fn timing(created: i64, completed: i64) -> JobTiming {
        JobTiming::new(Some(at(created)), Some(at(completed)))
    }

    fn timings(entries: &[(&str, JobTiming)]) -> BTreeMap<String, JobTiming> {
        entries
            .iter()
            .map(|(name, t)| (name.to_string(), *t))
            .collect()
    }

    #[test]
    fn test_empty_map_has_no_statistics() {
        assert!(compute_statistics(&BTreeMap::new()).is_none());
    }

    #[test]
    fn test_incomplete_entries_are_skipped() {
        let map = timings(&[
            ("a", JobTiming::new(Some(at(0)), None)),
            ("b", JobTiming::new(None, Some(at(4)))),
        ]);
        assert!(compute_statistics(&map).is_none());

        let mut map = map;
        map.insert("c".to_string(), timing(1, 3));
        let stats = compute_statistics(&map).unwrap();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.mean_duration_secs, 2.0);
    }

    #[test]
    fn test_single_entry_has_zero_deviation() {
        let stats = compute_statistics(&timings(&[("a", timing(0, 5))])).unwrap();
        assert_eq!(stats.std_dev_duration_secs, 0.0);
        assert_eq!(stats.median_duration_secs, 5.0);
        assert_eq!(stats.total_span_secs, 5.0);
    }

    #[test]
    fn test_cohort_statistics() {
        let map = timings(&[
            ("a", timing(0, 2)),
            ("b", timing(1, 5)),
            ("c", timing(2, 8)),
            ("d", timing(3, 11)),
        ]);
        let stats = compute_statistics(&map).unwrap();

        assert_eq!(stats.samples, 4);
        assert_eq!(stats.first_creation, at(0));
        assert_eq!(stats.last_creation, at(3));
        assert_eq!(stats.first_completion, at(2));
        assert_eq!(stats.last_completion, at(11));
        // durations 2, 4, 6, 8
        assert_eq!(stats.mean_duration_secs, 5.0);
        assert_eq!(stats.median_duration_secs, 5.0);
        assert!((stats.std_dev_duration_secs - (20.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert_eq!(stats.total_span_secs, 11.0);
    }

    #[test]
    fn test_bounds_are_ordered() {
        let map = timings(&[
            ("x", timing(9, 10)),
            ("y", timing(0, 30)),
            ("z", timing(4, 7)),
        ]);
        let stats = compute_statistics(&map).unwrap();
        assert!(stats.first_creation <= stats.last_creation);
        assert!(stats.first_completion <= stats.last_completion);
        assert!(stats.total_span_secs >= 0.0);
        assert_eq!(stats.median_duration_secs, 3.0);
    }
}
