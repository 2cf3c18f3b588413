//! Canary DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::canary::{CanaryMetricSample, CanaryPolicy, CanaryRelease, WindowedMetrics};

/// Request to start a canary release for a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCanary {
    pub deployment_id: Uuid,
    #[serde(default)]
    pub policy: CanaryPolicy,
}

/// Current state of a canary release with its recent metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryView {
    #[serde(flatten)]
    pub release: CanaryRelease,
    pub latest_sample: Option<CanaryMetricSample>,
    /// Mean of the samples taken within the lookback window
    pub rolling_average: Option<WindowedMetrics>,
    pub sample_count: usize,
    pub elapsed_seconds: i64,
    pub remaining_seconds: i64,
}

/// Operator rollback request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackCanary {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Operator traffic change; the two percentages must sum to 100
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTraffic {
    pub canary_percentage: f64,
    pub stable_percentage: f64,
}
