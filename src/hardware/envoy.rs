use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::MeterConfig;
use crate::domain::{Meter, MeterError, MeterReading};

/// Enphase Envoy gateway read through its local `/ivp/meters/readings` API.
///
/// The gateway serves a self-signed certificate, so certificate validation is
/// disabled for this client only.
#[derive(Clone)]
pub struct EnvoyMeter {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl EnvoyMeter {
    pub fn new(cfg: &MeterConfig) -> Result<Self> {
        Self::with_base_url(
            format!("https://{}", cfg.host),
            cfg.token.clone(),
            Duration::from_millis(cfg.timeout_ms),
        )
    }

    pub fn with_base_url(base_url: String, token: String, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pv-router/0.3"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn readings_url(&self) -> String {
        format!("{}/ivp/meters/readings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Meter for EnvoyMeter {
    async fn read_values(&self) -> Result<MeterReading> {
        let resp = self
            .client
            .get(self.readings_url())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| MeterError::Communication(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.context("envoy read failed")?;
        if !status.is_success() {
            return Err(MeterError::Communication(format!("HTTP {status}: {body}")).into());
        }

        let raw: Vec<RawMeterReading> = serde_json::from_str(&body)
            .map_err(|e| MeterError::MalformedReading(e.to_string()))?;
        // production channel first, then net consumption
        let [production, consumption, ..] = raw.as_slice() else {
            return Err(MeterError::MalformedReading(format!(
                "expected production and consumption channels, got {}",
                raw.len()
            ))
            .into());
        };
        debug!(
            production_w = production.instantaneous_demand,
            consumption_w = consumption.instantaneous_demand,
            "envoy reading"
        );
        Ok(MeterReading::new(
            production.instantaneous_demand,
            consumption.instantaneous_demand,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeterReading {
    instantaneous_demand: f64,
}
