//! Metrics Reader adapter
//!
//! Windowed request metrics for a deployment. A window with no traffic is a
//! valid zeroed result, never an error, so the controller's minimum sample
//! gate sees it as "not enough data".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cygni_core::domain::canary::WindowedMetrics;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{AdapterError, check_status};

#[async_trait]
pub trait MetricsReader: Send + Sync {
    async fn windowed_metrics(
        &self,
        deployment_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WindowedMetrics, AdapterError>;
}

/// Reads `cygni_http_requests_total` and `cygni_http_duration_seconds`
/// from the Prometheus instant query API, labelled by deployment id
pub struct PrometheusMetricsReader {
    base_url: String,
    client: Client,
}

impl PrometheusMetricsReader {
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// `None` when the query has no sample (empty vector or NaN)
    async fn query_scalar(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, AdapterError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("query", query.to_string()), ("time", at.timestamp().to_string())])
            .send()
            .await?;

        let body: PromResponse = check_status(response).await?.json().await?;
        scalar_from_response(body)
    }
}

#[async_trait]
impl MetricsReader for PrometheusMetricsReader {
    async fn windowed_metrics(
        &self,
        deployment_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WindowedMetrics, AdapterError> {
        let window = format!("{}s", (to - from).num_seconds().max(1));
        let selector = format!("deployment=\"{}\"", deployment_id);

        let requests = self
            .query_scalar(
                &format!(
                    "sum(increase(cygni_http_requests_total{{{}}}[{}]))",
                    selector, window
                ),
                to,
            )
            .await?
            .unwrap_or(0.0);

        if requests < 1.0 {
            return Ok(WindowedMetrics::empty());
        }

        let errors = self
            .query_scalar(
                &format!(
                    "sum(increase(cygni_http_requests_total{{{},status=~\"5..\"}}[{}]))",
                    selector, window
                ),
                to,
            )
            .await?
            .unwrap_or(0.0);

        let successes = self
            .query_scalar(
                &format!(
                    "sum(increase(cygni_http_requests_total{{{},status=~\"2..\"}}[{}]))",
                    selector, window
                ),
                to,
            )
            .await?
            .unwrap_or(0.0);

        // Traffic without a latency histogram cannot be judged
        let mut quantiles = [0.0; 3];
        for (slot, q) in quantiles.iter_mut().zip([0.50, 0.95, 0.99]) {
            let value = self
                .query_scalar(
                    &format!(
                        "histogram_quantile({}, sum by (le) (rate(cygni_http_duration_seconds_bucket{{{}}}[{}]))) * 1000",
                        q, selector, window
                    ),
                    to,
                )
                .await?;
            *slot = require_latency(value, q, requests)?;
        }

        Ok(WindowedMetrics {
            success_rate: successes / requests,
            error_rate: errors / requests,
            latency_p50_ms: quantiles[0],
            latency_p95_ms: quantiles[1],
            latency_p99_ms: quantiles[2],
            request_count: requests.round() as u64,
        })
    }
}

/// Reader used when no metrics backend is configured: every window is empty
pub struct EmptyMetricsReader;

#[async_trait]
impl MetricsReader for EmptyMetricsReader {
    async fn windowed_metrics(
        &self,
        _deployment_id: Uuid,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<WindowedMetrics, AdapterError> {
        Ok(WindowedMetrics::empty())
    }
}

// =============================================================================
// Prometheus response decoding
// =============================================================================

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromData {
    result_type: String,
    result: Value,
}

fn require_latency(value: Option<f64>, quantile: f64, requests: f64) -> Result<f64, AdapterError> {
    value.ok_or_else(|| {
        AdapterError::Malformed(format!(
            "no p{} latency data for {} requests",
            quantile * 100.0,
            requests.round()
        ))
    })
}

/// First value of a vector or scalar result; `None` for an empty vector or a
/// non-finite value
fn scalar_from_response(body: PromResponse) -> Result<Option<f64>, AdapterError> {
    if body.status != "success" {
        return Err(AdapterError::Malformed(
            body.error.unwrap_or_else(|| format!("query status '{}'", body.status)),
        ));
    }
    let data = body
        .data
        .ok_or_else(|| AdapterError::Malformed("missing data".to_string()))?;

    let pair = match data.result_type.as_str() {
        "vector" => match data.result.as_array().and_then(|v| v.first()) {
            Some(first) => first.get("value").cloned(),
            None => return Ok(None),
        },
        "scalar" => Some(data.result),
        other => {
            return Err(AdapterError::Malformed(format!(
                "unexpected result type '{}'",
                other
            )));
        }
    };

    let raw = pair
        .as_ref()
        .and_then(|p| p.get(1))
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Malformed("missing sample value".to_string()))?;

    let value: f64 = raw
        .parse()
        .map_err(|_| AdapterError::Malformed(format!("bad sample value '{}'", raw)))?;

    Ok(value.is_finite().then_some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Option<f64>, AdapterError> {
        scalar_from_response(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_vector_result() {
        let v = parse(
            r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000.1,"0.05"]}]}}"#,
        )
        .unwrap()
        .unwrap();
        assert!((v - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_vector_and_nan_have_no_value() {
        assert_eq!(
            parse(r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#).unwrap(),
            None
        );
        assert_eq!(
            parse(r#"{"status":"success","data":{"resultType":"scalar","result":[1700000000,"NaN"]}}"#)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_traffic_without_latency_is_an_error() {
        let err = require_latency(None, 0.95, 250.0).unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
        assert!(err.to_string().contains("p95"));
        assert_eq!(require_latency(Some(120.0), 0.95, 250.0).unwrap(), 120.0);
    }

    #[test]
    fn test_error_status() {
        let err = parse(r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[tokio::test]
    async fn test_empty_reader_returns_zeroed_metrics() {
        let now = Utc::now();
        let m = EmptyMetricsReader
            .windowed_metrics(Uuid::new_v4(), now - chrono::Duration::minutes(5), now)
            .await
            .unwrap();
        assert!(!m.has_traffic());
        assert_eq!(m, WindowedMetrics::empty());
    }
}
