//! Canary decision policy
//!
//! Pure evaluation of one control-loop pass. Rollback criteria are checked
//! first and always win over promotion for the same sample.

use chrono::{DateTime, Utc};
use cygni_core::domain::canary::{CanaryMetricSample, CanaryPolicy, CanaryRelease};
use std::fmt;

/// The first threshold a sample breaches, with observed and limit values
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Breach {
    ErrorRate { observed: f64, limit: f64 },
    SuccessRate { observed: f64, limit: f64 },
    LatencyP95 { observed: f64, limit: f64 },
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breach::ErrorRate { observed, limit } => write!(
                f,
                "error rate exceeds threshold: observed {:.4} > limit {:.4}",
                observed, limit
            ),
            Breach::SuccessRate { observed, limit } => write!(
                f,
                "success rate below threshold: observed {:.4} < limit {:.4}",
                observed, limit
            ),
            Breach::LatencyP95 { observed, limit } => write!(
                f,
                "latency p95 exceeds threshold: observed {:.1}ms > limit {:.1}ms",
                observed, limit
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Rollback(Breach),
    Promote(String),
    /// Shift canary traffic to the next progressive step
    Advance(f64),
    Pause(String),
    Hold,
}

/// Rollback criteria in order: error rate, success rate, latency P95.
/// A window without traffic cannot breach.
pub fn check_breach(policy: &CanaryPolicy, sample: &CanaryMetricSample) -> Option<Breach> {
    if sample.request_count == 0 {
        return None;
    }
    if sample.error_rate > policy.max_error_rate {
        return Some(Breach::ErrorRate {
            observed: sample.error_rate,
            limit: policy.max_error_rate,
        });
    }
    if sample.success_rate < policy.min_success_rate {
        return Some(Breach::SuccessRate {
            observed: sample.success_rate,
            limit: policy.min_success_rate,
        });
    }
    if sample.latency_p95_ms > policy.max_latency_p95_ms {
        return Some(Breach::LatencyP95 {
            observed: sample.latency_p95_ms,
            limit: policy.max_latency_p95_ms,
        });
    }
    None
}

/// Decides one pass for a running release.
///
/// `recent` holds the newest samples first, the just-persisted one at index 0.
pub fn evaluate(release: &CanaryRelease, recent: &[CanaryMetricSample], now: DateTime<Utc>) -> Decision {
    let policy = &release.policy;
    let expired = now >= release.scheduled_end_at;

    let Some(latest) = recent.first() else {
        return if expired {
            Decision::Pause("duration elapsed without any metrics sample".to_string())
        } else {
            Decision::Hold
        };
    };

    if let Some(breach) = check_breach(policy, latest) {
        let needed = policy.rollback_after_breaches.max(1) as usize;
        let sustained = recent.len() >= needed
            && recent
                .iter()
                .take(needed)
                .all(|s| check_breach(policy, s).is_some());

        if policy.auto_rollback && sustained {
            return Decision::Rollback(breach);
        }
        // A breaching canary is never promoted, not even on expiry
        return if expired {
            Decision::Pause(format!("duration elapsed while breaching: {}", breach))
        } else {
            Decision::Hold
        };
    }

    let significant = latest.request_count >= policy.min_request_count;

    if significant && policy.auto_promote {
        if let Some(next) = policy.next_step(release.traffic_percentage) {
            if !expired {
                return Decision::Advance(next);
            }
        }
        return Decision::Promote(format!(
            "all thresholds within policy over {} requests (error rate {:.4}, success rate {:.4}, p95 {:.1}ms)",
            latest.request_count, latest.error_rate, latest.success_rate, latest.latency_p95_ms
        ));
    }

    if expired {
        return Decision::Pause(if policy.auto_promote {
            format!(
                "duration elapsed with {} requests, below the minimum of {}",
                latest.request_count, policy.min_request_count
            )
        } else {
            "duration elapsed; auto-promote disabled".to_string()
        });
    }

    Decision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use cygni_core::domain::canary::WindowedMetrics;
    use uuid::Uuid;

    fn release(policy: CanaryPolicy) -> CanaryRelease {
        CanaryRelease::new(Uuid::new_v4(), "shop".to_string(), Uuid::new_v4(), policy).unwrap()
    }

    fn sample(error_rate: f64, success_rate: f64, p95: f64, requests: u64) -> CanaryMetricSample {
        CanaryMetricSample::from_metrics(
            Uuid::new_v4(),
            Utc::now(),
            &WindowedMetrics {
                success_rate,
                error_rate,
                latency_p50_ms: p95 / 2.0,
                latency_p95_ms: p95,
                latency_p99_ms: p95 * 1.5,
                request_count: requests,
            },
        )
    }

    fn healthy(requests: u64) -> CanaryMetricSample {
        sample(0.001, 0.999, 120.0, requests)
    }

    #[test]
    fn test_breach_order_is_error_success_latency() {
        let policy = CanaryPolicy::default();
        // Breaches all three; error rate is reported
        let bad = sample(0.2, 0.5, 5000.0, 500);
        assert!(matches!(
            check_breach(&policy, &bad),
            Some(Breach::ErrorRate { .. })
        ));

        let slow_and_failing = sample(0.0, 0.5, 5000.0, 500);
        assert!(matches!(
            check_breach(&policy, &slow_and_failing),
            Some(Breach::SuccessRate { .. })
        ));

        let slow = sample(0.0, 1.0, 5000.0, 500);
        assert!(matches!(
            check_breach(&policy, &slow),
            Some(Breach::LatencyP95 { .. })
        ));
    }

    #[test]
    fn test_rollback_wins_over_promotion() {
        let r = release(CanaryPolicy::default());

        // Significant traffic, success rate and latency pass, error rate breaches
        let s = sample(0.05, 0.999, 100.0, 10_000);
        match evaluate(&r, &[s], Utc::now()) {
            Decision::Rollback(breach) => {
                assert!(breach.to_string().starts_with("error rate exceeds threshold"));
                assert!(breach.to_string().contains("0.0500 > limit 0.0100"));
            }
            other => panic!("expected rollback, got {:?}", other),
        }
    }

    #[test]
    fn test_no_promotion_below_minimum_requests() {
        let r = release(CanaryPolicy::default());
        for requests in [0, 1, 50, 99] {
            assert_eq!(evaluate(&r, &[healthy(requests)], Utc::now()), Decision::Hold);
        }
        // Not even at the scheduled end
        let after_end = r.scheduled_end_at + Duration::seconds(1);
        assert!(matches!(
            evaluate(&r, &[healthy(99)], after_end),
            Decision::Pause(_)
        ));
    }

    #[test]
    fn test_healthy_significant_sample_promotes() {
        let r = release(CanaryPolicy::default());
        assert!(matches!(
            evaluate(&r, &[healthy(100)], Utc::now()),
            Decision::Promote(_)
        ));
    }

    #[test]
    fn test_zero_traffic_never_rolls_back() {
        let r = release(CanaryPolicy::default());
        let empty = sample(0.0, 0.0, 0.0, 0);
        assert_eq!(evaluate(&r, &[empty], Utc::now()), Decision::Hold);
    }

    #[test]
    fn test_rollback_requires_consecutive_breaches() {
        let policy = CanaryPolicy {
            rollback_after_breaches: 3,
            ..CanaryPolicy::default()
        };
        let r = release(policy);
        let bad = || sample(0.05, 0.95, 100.0, 500);

        assert_eq!(evaluate(&r, &[bad(), bad()], Utc::now()), Decision::Hold);
        assert_eq!(
            evaluate(&r, &[bad(), healthy(500), bad()], Utc::now()),
            Decision::Hold
        );
        assert!(matches!(
            evaluate(&r, &[bad(), bad(), bad()], Utc::now()),
            Decision::Rollback(_)
        ));
    }

    #[test]
    fn test_breach_without_auto_rollback_holds() {
        let policy = CanaryPolicy {
            auto_rollback: false,
            ..CanaryPolicy::default()
        };
        let r = release(policy);
        assert_eq!(
            evaluate(&r, &[sample(0.5, 0.5, 100.0, 500)], Utc::now()),
            Decision::Hold
        );
    }

    #[test]
    fn test_expiry_without_auto_promote_pauses() {
        let policy = CanaryPolicy {
            auto_promote: false,
            ..CanaryPolicy::default()
        };
        let r = release(policy);

        assert_eq!(evaluate(&r, &[healthy(1000)], Utc::now()), Decision::Hold);
        let after_end = r.scheduled_end_at + Duration::seconds(1);
        assert!(matches!(
            evaluate(&r, &[healthy(1000)], after_end),
            Decision::Pause(_)
        ));
    }

    #[test]
    fn test_progressive_steps_advance_before_promotion() {
        let policy = CanaryPolicy {
            progressive_steps: vec![10.0, 25.0, 50.0, 75.0],
            ..CanaryPolicy::default()
        };
        let mut r = release(policy);

        assert_eq!(
            evaluate(&r, &[healthy(500)], Utc::now()),
            Decision::Advance(25.0)
        );
        r.traffic_percentage = 75.0;
        assert!(matches!(
            evaluate(&r, &[healthy(500)], Utc::now()),
            Decision::Promote(_)
        ));

        // Remaining steps are skipped once the duration budget is spent
        r.traffic_percentage = 25.0;
        let after_end = r.scheduled_end_at + Duration::seconds(1);
        assert!(matches!(
            evaluate(&r, &[healthy(500)], after_end),
            Decision::Promote(_)
        ));
    }
}
