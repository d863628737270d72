//! Read-only client for the time-series telemetry backend.
//!
//! Supplies current, rolling-window, and trend values to the layer detector
//! and the recommendation engine. The engine never writes metrics here.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::error::{EngineError, Result};

/// Query response envelope from the backend.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    #[allow(dead_code)]
    result_type: String,
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    metric: HashMap<String, String>,
    value: Option<(f64, String)>,
    values: Option<Vec<(f64, String)>>,
}

/// A single metric sample.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    /// Labels attached to the series.
    pub labels: HashMap<String, String>,
    /// Sample value.
    pub value: f64,
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Direction of a metric over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

/// Read-only telemetry client.
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    base_url: String,
    client: reqwest::Client,
}

impl TelemetryReader {
    /// Create a reader from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::unavailable("telemetry", e))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Execute an instant query.
    pub async fn query(&self, query: &str) -> Result<Vec<MetricSample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(query = %query, "Executing telemetry query");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| EngineError::unavailable("telemetry", e))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(EngineError::unavailable(
                "telemetry",
                format!("query returned HTTP {status}"),
            ));
        }

        let envelope: QueryResponse = response
            .json()
            .await
            .map_err(|e| EngineError::unavailable("telemetry", e))?;

        if envelope.status != "success" {
            return Err(EngineError::unavailable(
                "telemetry",
                format!("query status {}", envelope.status),
            ));
        }

        Ok(parse_instant(&envelope.data.result))
    }

    /// Execute a range query.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: &str,
    ) -> Result<Vec<MetricSample>> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        debug!(query = %query, start = %start, end = %end, "Executing telemetry range query");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query),
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("step", step),
            ])
            .send()
            .await
            .map_err(|e| EngineError::unavailable("telemetry", e))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(EngineError::unavailable(
                "telemetry",
                format!("range query returned HTTP {status}"),
            ));
        }

        let envelope: QueryResponse = response
            .json()
            .await
            .map_err(|e| EngineError::unavailable("telemetry", e))?;

        if envelope.status != "success" {
            return Err(EngineError::unavailable(
                "telemetry",
                format!("range query status {}", envelope.status),
            ));
        }

        Ok(parse_range(&envelope.data.result))
    }

    /// Current value of a metric, taking the first series that matches.
    pub async fn current_value(&self, query: &str) -> Result<Option<f64>> {
        let samples = self.query(query).await?;
        Ok(samples.first().map(|s| s.value))
    }

    /// Mean over a rolling window ending now.
    pub async fn rolling_avg(&self, query: &str, window: Duration) -> Result<Option<f64>> {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(window).unwrap_or_default();
        let samples = self.query_range(query, start, end, "60s").await?;
        if samples.is_empty() {
            return Ok(None);
        }
        let sum: f64 = samples.iter().map(|s| s.value).sum();
        Ok(Some(sum / samples.len() as f64))
    }

    /// Direction of a metric over a window, from the first and last samples.
    pub async fn trend(&self, query: &str, window: Duration) -> Result<Trend> {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(window).unwrap_or_default();
        let samples = self.query_range(query, start, end, "60s").await?;
        Ok(trend_of(&samples))
    }

    /// Probe backend liveness. Unreachable backends report unhealthy rather
    /// than erroring, so dependency summaries stay cheap.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/-/healthy", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Telemetry health check failed");
                false
            }
        }
    }
}

fn parse_instant(results: &[QueryResult]) -> Vec<MetricSample> {
    let mut samples = Vec::new();
    for result in results {
        if let Some((timestamp, value_str)) = &result.value {
            samples.push(MetricSample {
                labels: result.metric.clone(),
                value: value_str.parse().unwrap_or(0.0),
                timestamp: DateTime::from_timestamp(*timestamp as i64, 0).unwrap_or_else(Utc::now),
            });
        }
    }
    samples
}

fn parse_range(results: &[QueryResult]) -> Vec<MetricSample> {
    let mut samples = Vec::new();
    for result in results {
        if let Some(values) = &result.values {
            for (timestamp, value_str) in values {
                samples.push(MetricSample {
                    labels: result.metric.clone(),
                    value: value_str.parse().unwrap_or(0.0),
                    timestamp: DateTime::from_timestamp(*timestamp as i64, 0)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
    }
    samples
}

fn trend_of(samples: &[MetricSample]) -> Trend {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Trend::Flat;
    };
    let delta = last.value - first.value;
    // Deadband of 1% of the first sample filters scrape jitter.
    let band = (first.value.abs() * 0.01).max(f64::EPSILON);
    if delta > band {
        Trend::Rising
    } else if delta < -band {
        Trend::Falling
    } else {
        Trend::Flat
    }
}
