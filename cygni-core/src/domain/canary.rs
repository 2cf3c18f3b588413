//! Canary release domain types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Minimum number of requests in a window before promotion may be considered
pub const DEFAULT_MIN_REQUEST_COUNT: u64 = 100;

/// Longest canary a policy may ask for (30 days)
pub const MAX_DURATION_SECONDS: u64 = 30 * 24 * 60 * 60;

/// Traffic schedule used by the original progressive rollout
pub const DEFAULT_PROGRESSIVE_STEPS: [f64; 4] = [10.0, 25.0, 50.0, 75.0];

/// Thresholds and flags governing one canary release
///
/// Rates are fractions in `[0, 1]`, latency is in milliseconds, traffic is a
/// percentage in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryPolicy {
    pub traffic_percentage: f64,
    pub min_success_rate: f64,
    pub max_error_rate: f64,
    pub max_latency_p95_ms: f64,
    pub duration_seconds: u64,
    pub auto_promote: bool,
    pub auto_rollback: bool,
    #[serde(default = "default_min_request_count")]
    pub min_request_count: u64,
    /// Number of most recent samples that must all breach before rollback
    #[serde(default = "default_rollback_after_breaches")]
    pub rollback_after_breaches: u32,
    /// Optional traffic steps the canary advances through while healthy
    #[serde(default)]
    pub progressive_steps: Vec<f64>,
}

fn default_min_request_count() -> u64 {
    DEFAULT_MIN_REQUEST_COUNT
}

fn default_rollback_after_breaches() -> u32 {
    1
}

impl Default for CanaryPolicy {
    fn default() -> Self {
        Self {
            traffic_percentage: 10.0,
            min_success_rate: 0.99,
            max_error_rate: 0.01,
            max_latency_p95_ms: 500.0,
            duration_seconds: 600,
            auto_promote: true,
            auto_rollback: true,
            min_request_count: DEFAULT_MIN_REQUEST_COUNT,
            rollback_after_breaches: 1,
            progressive_steps: Vec::new(),
        }
    }
}

impl CanaryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.traffic_percentage > 0.0 && self.traffic_percentage < 100.0) {
            return Err(format!(
                "traffic_percentage must be within (0, 100), got {}",
                self.traffic_percentage
            ));
        }
        for (name, value) in [
            ("min_success_rate", self.min_success_rate),
            ("max_error_rate", self.max_error_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.max_latency_p95_ms.is_nan() || self.max_latency_p95_ms <= 0.0 {
            return Err("max_latency_p95_ms must be greater than 0".to_string());
        }
        if self.duration_seconds == 0 || self.duration_seconds > MAX_DURATION_SECONDS {
            return Err(format!(
                "duration_seconds must be within [1, {}], got {}",
                MAX_DURATION_SECONDS, self.duration_seconds
            ));
        }
        if self.rollback_after_breaches == 0 {
            return Err("rollback_after_breaches must be at least 1".to_string());
        }

        let mut previous = self.traffic_percentage;
        for step in &self.progressive_steps {
            if !(*step > 0.0 && *step < 100.0) {
                return Err(format!("progressive step {} must be within (0, 100)", step));
            }
            if *step < previous {
                return Err("progressive_steps must be ascending from traffic_percentage".to_string());
            }
            previous = *step;
        }

        Ok(())
    }

    /// The next progressive step above the current traffic percentage, if any
    pub fn next_step(&self, current: f64) -> Option<f64> {
        self.progressive_steps
            .iter()
            .copied()
            .find(|step| *step > current + f64::EPSILON)
    }
}

/// A partial-traffic rollout of one deployment alongside the stable one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryRelease {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub project_id: String,
    /// Deployment receiving the remaining traffic, restored on rollback
    pub stable_deployment_id: Uuid,
    pub traffic_percentage: f64,
    pub policy: CanaryPolicy,
    pub status: CanaryStatus,
    /// Reason for the terminal or paused state
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub scheduled_end_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CanaryRelease {
    pub fn new(
        deployment_id: Uuid,
        project_id: String,
        stable_deployment_id: Uuid,
        policy: CanaryPolicy,
    ) -> Result<Self, String> {
        let started_at = Utc::now();
        let scheduled_end_at = i64::try_from(policy.duration_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|duration| started_at.checked_add_signed(duration))
            .ok_or_else(|| {
                format!(
                    "duration_seconds {} is out of range",
                    policy.duration_seconds
                )
            })?;
        Ok(Self {
            id: Uuid::new_v4(),
            deployment_id,
            project_id,
            stable_deployment_id,
            traffic_percentage: policy.traffic_percentage,
            policy,
            status: CanaryStatus::Running,
            reason: None,
            started_at,
            scheduled_end_at,
            completed_at: None,
        })
    }

    pub fn stable_percentage(&self) -> f64 {
        100.0 - self.traffic_percentage
    }
}

/// Canary release status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    Running,
    Promoted,
    RolledBack,
    Paused,
}

impl CanaryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CanaryStatus::Promoted | CanaryStatus::RolledBack)
    }

    /// Running and paused releases both count against the one-per-deployment limit
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CanaryStatus::Running => "running",
            CanaryStatus::Promoted => "promoted",
            CanaryStatus::RolledBack => "rolled_back",
            CanaryStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for CanaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanaryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(CanaryStatus::Running),
            "promoted" => Ok(CanaryStatus::Promoted),
            "rolled_back" => Ok(CanaryStatus::RolledBack),
            "paused" => Ok(CanaryStatus::Paused),
            other => Err(format!("unknown canary status '{}'", other)),
        }
    }
}

/// Windowed metrics for one deployment as returned by the metrics backend
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowedMetrics {
    pub success_rate: f64,
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub request_count: u64,
}

impl WindowedMetrics {
    /// Zeroed metrics for a window with no observed traffic
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_traffic(&self) -> bool {
        self.request_count > 0
    }

    /// Arithmetic mean of a set of samples
    pub fn average<'a>(samples: impl IntoIterator<Item = &'a CanaryMetricSample>) -> Option<Self> {
        let mut count = 0u64;
        let mut total = WindowedMetrics::empty();
        let mut requests = 0u64;

        for sample in samples {
            count += 1;
            total.success_rate += sample.success_rate;
            total.error_rate += sample.error_rate;
            total.latency_p50_ms += sample.latency_p50_ms;
            total.latency_p95_ms += sample.latency_p95_ms;
            total.latency_p99_ms += sample.latency_p99_ms;
            requests += sample.request_count;
        }

        if count == 0 {
            return None;
        }

        let n = count as f64;
        Some(Self {
            success_rate: total.success_rate / n,
            error_rate: total.error_rate / n,
            latency_p50_ms: total.latency_p50_ms / n,
            latency_p95_ms: total.latency_p95_ms / n,
            latency_p99_ms: total.latency_p99_ms / n,
            request_count: requests / count,
        })
    }
}

/// An immutable, append-only metrics observation for a canary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryMetricSample {
    pub canary_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub success_rate: f64,
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub request_count: u64,
}

impl CanaryMetricSample {
    pub fn from_metrics(canary_id: Uuid, timestamp: DateTime<Utc>, m: &WindowedMetrics) -> Self {
        Self {
            canary_id,
            timestamp,
            success_rate: m.success_rate,
            error_rate: m.error_rate,
            latency_p50_ms: m.latency_p50_ms,
            latency_p95_ms: m.latency_p95_ms,
            latency_p99_ms: m.latency_p99_ms,
            request_count: m.request_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(CanaryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_policy_rejects_out_of_range_values() {
        let mut policy = CanaryPolicy {
            traffic_percentage: 100.0,
            ..CanaryPolicy::default()
        };
        assert!(policy.validate().is_err());

        policy.traffic_percentage = 10.0;
        policy.max_error_rate = 1.5;
        assert!(policy.validate().is_err());

        policy.max_error_rate = 0.01;
        policy.rollback_after_breaches = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_duration_is_bounded() {
        let policy = CanaryPolicy {
            duration_seconds: 10_000_000_000_000,
            ..CanaryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = CanaryPolicy {
            duration_seconds: MAX_DURATION_SECONDS,
            ..CanaryPolicy::default()
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_release_rejects_unrepresentable_end() {
        let policy = CanaryPolicy {
            duration_seconds: u64::MAX,
            ..CanaryPolicy::default()
        };
        assert!(CanaryRelease::new(Uuid::new_v4(), "proj".to_string(), Uuid::new_v4(), policy).is_err());
    }

    #[test]
    fn test_progressive_steps_must_ascend() {
        let policy = CanaryPolicy {
            progressive_steps: vec![50.0, 25.0],
            ..CanaryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = CanaryPolicy {
            progressive_steps: DEFAULT_PROGRESSIVE_STEPS.to_vec(),
            ..CanaryPolicy::default()
        };
        assert!(policy.validate().is_ok());
        assert_eq!(policy.next_step(10.0), Some(25.0));
        assert_eq!(policy.next_step(75.0), None);
    }

    #[test]
    fn test_policy_defaults_when_omitted() {
        let json = serde_json::json!({
            "traffic_percentage": 10.0,
            "min_success_rate": 0.95,
            "max_error_rate": 0.01,
            "max_latency_p95_ms": 300.0,
            "duration_seconds": 600,
            "auto_promote": true,
            "auto_rollback": true
        });
        let policy: CanaryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy.min_request_count, DEFAULT_MIN_REQUEST_COUNT);
        assert_eq!(policy.rollback_after_breaches, 1);
        assert!(policy.progressive_steps.is_empty());
    }

    #[test]
    fn test_release_schedule() {
        let release = CanaryRelease::new(
            Uuid::new_v4(),
            "proj".to_string(),
            Uuid::new_v4(),
            CanaryPolicy::default(),
        )
        .unwrap();
        assert_eq!(release.status, CanaryStatus::Running);
        assert_eq!(
            release.scheduled_end_at - release.started_at,
            Duration::seconds(600)
        );
        assert_eq!(release.stable_percentage(), 90.0);
    }

    #[test]
    fn test_average_samples() {
        let id = Uuid::new_v4();
        let a = CanaryMetricSample::from_metrics(
            id,
            Utc::now(),
            &WindowedMetrics {
                success_rate: 1.0,
                error_rate: 0.0,
                latency_p50_ms: 10.0,
                latency_p95_ms: 100.0,
                latency_p99_ms: 200.0,
                request_count: 100,
            },
        );
        let b = CanaryMetricSample::from_metrics(
            id,
            Utc::now(),
            &WindowedMetrics {
                success_rate: 0.9,
                error_rate: 0.1,
                latency_p50_ms: 30.0,
                latency_p95_ms: 300.0,
                latency_p99_ms: 400.0,
                request_count: 300,
            },
        );

        let avg = WindowedMetrics::average([&a, &b]).unwrap();
        assert!((avg.success_rate - 0.95).abs() < 1e-9);
        assert!((avg.latency_p95_ms - 200.0).abs() < 1e-9);
        assert_eq!(avg.request_count, 200);
        assert!(WindowedMetrics::average(std::iter::empty()).is_none());
    }
}
