//! Hourly performance metric buckets.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use payrun_core::TenantId;

/// One terminal item observed by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedSample {
    pub succeeded: bool,
    pub processing_time_ms: Option<u64>,
}

/// One row per tenant per hour, upserted idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBucket {
    pub tenant_id: TenantId,
    /// UTC start of the hour this bucket covers
    pub hour_bucket: DateTime<Utc>,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub avg_processing_time_ms: f64,
    pub p50_processing_time_ms: u64,
    pub p95_processing_time_ms: u64,
    pub p99_processing_time_ms: u64,
}

impl MetricBucket {
    /// Roll a set of terminal items into one bucket.
    ///
    /// Pure and deterministic over its inputs, so re-running the aggregator
    /// for the same hour yields an identical row.
    pub fn compute(
        tenant_id: TenantId,
        hour_bucket: DateTime<Utc>,
        samples: &[CompletedSample],
    ) -> Self {
        let total_processed = samples.len() as u64;
        let total_succeeded = samples.iter().filter(|s| s.succeeded).count() as u64;
        let total_failed = total_processed - total_succeeded;

        let mut durations: Vec<u64> = samples
            .iter()
            .filter_map(|s| s.processing_time_ms)
            .collect();
        durations.sort_unstable();

        let avg = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        Self {
            tenant_id,
            hour_bucket,
            total_processed,
            total_succeeded,
            total_failed,
            avg_processing_time_ms: avg,
            p50_processing_time_ms: percentile_nearest_rank(&durations, 50),
            p95_processing_time_ms: percentile_nearest_rank(&durations, 95),
            p99_processing_time_ms: percentile_nearest_rank(&durations, 99),
        }
    }
}

/// Truncate a timestamp to the start of its UTC hour.
pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1))
        .unwrap_or(ts)
}

/// Nearest-rank percentile over a **sorted** slice of durations.
///
/// Rank `ceil(p/100 * n)`, 1-indexed. Chosen over linear interpolation for
/// predictable behavior at small sample sizes.
pub fn percentile_nearest_rank(sorted: &[u64], percentile: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len() as f64;
    let rank = ((percentile as f64 / 100.0) * n).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile_nearest_rank(&sorted, 50), 50);
        assert_eq!(percentile_nearest_rank(&sorted, 95), 95);
        assert_eq!(percentile_nearest_rank(&sorted, 99), 99);
    }

    #[test]
    fn nearest_rank_small_samples() {
        assert_eq!(percentile_nearest_rank(&[], 95), 0);
        assert_eq!(percentile_nearest_rank(&[42], 50), 42);
        assert_eq!(percentile_nearest_rank(&[42], 99), 42);
        // Two samples: p50 is the first, p95/p99 the second.
        assert_eq!(percentile_nearest_rank(&[10, 20], 50), 10);
        assert_eq!(percentile_nearest_rank(&[10, 20], 99), 20);
    }

    #[test]
    fn hour_floor_truncates_to_hour() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let floored = hour_floor(ts);
        assert_eq!(floored, Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap());
    }

    #[test]
    fn bucket_computation_is_deterministic() {
        let tenant = TenantId::new();
        let hour = hour_floor(Utc::now());
        let samples = vec![
            CompletedSample {
                succeeded: true,
                processing_time_ms: Some(120),
            },
            CompletedSample {
                succeeded: true,
                processing_time_ms: Some(80),
            },
            CompletedSample {
                succeeded: false,
                processing_time_ms: None,
            },
        ];

        let a = MetricBucket::compute(tenant, hour, &samples);
        let b = MetricBucket::compute(tenant, hour, &samples);
        assert_eq!(a, b);

        assert_eq!(a.total_processed, 3);
        assert_eq!(a.total_succeeded, 2);
        assert_eq!(a.total_failed, 1);
        assert_eq!(a.avg_processing_time_ms, 100.0);
        assert_eq!(a.p50_processing_time_ms, 80);
        assert_eq!(a.p99_processing_time_ms, 120);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: nearest-rank percentiles are always members of the
        /// sample and monotone in the percentile.
        #[test]
        fn percentiles_are_sample_members_and_monotone(
            mut samples in prop::collection::vec(0u64..100_000, 1..200)
        ) {
            samples.sort_unstable();
            let p50 = percentile_nearest_rank(&samples, 50);
            let p95 = percentile_nearest_rank(&samples, 95);
            let p99 = percentile_nearest_rank(&samples, 99);
            prop_assert!(samples.contains(&p50));
            prop_assert!(p50 <= p95);
            prop_assert!(p95 <= p99);
            prop_assert!(p99 <= *samples.last().unwrap());
        }
    }
}
