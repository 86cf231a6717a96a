use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::DimmerConfig;
use crate::domain::{Dimmer, DimmerError, DimmerValue};

/// Wi-Fi dimmer driven over its plain HTTP interface
#[derive(Clone)]
pub struct WifiDimmer {
    base_url: String,
    client: reqwest::Client,
}

impl WifiDimmer {
    pub fn new(cfg: &DimmerConfig) -> Result<Self> {
        Self::with_base_url(
            format!("http://{}", cfg.host),
            Duration::from_millis(cfg.timeout_ms),
        )
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let resp = request
            .send()
            .await
            .map_err(|e| DimmerError::Communication(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DimmerError::Communication(e.to_string()))?;
        if !status.is_success() {
            return Err(DimmerError::Communication(format!("HTTP {status}: {body}")).into());
        }
        Ok(body)
    }
}

#[async_trait]
impl Dimmer for WifiDimmer {
    async fn read_values(&self) -> Result<DimmerValue> {
        let body = self.get(self.client.get(self.url("state"))).await?;
        let raw: RawDimmerState = serde_json::from_str(&body)
            .map_err(|e| DimmerError::Communication(format!("bad state payload: {e}")))?;
        Ok(raw.into())
    }

    async fn module_power(&self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(DimmerError::InvalidSetting(percent).into());
        }
        debug!(percent, "setting dimmer power");
        self.get(self.client.get(self.url("")).query(&[("POWER", percent)]))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawDimmerState {
    #[serde(default)]
    dimmer: Option<f64>,
    #[serde(default)]
    temperature: Option<RawTemperature>,
}

/// Firmwares disagree on whether the probe reading is a string or a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTemperature {
    Number(f64),
    Text(String),
}

impl From<RawDimmerState> for DimmerValue {
    fn from(raw: RawDimmerState) -> Self {
        let temperature_c = match raw.temperature {
            Some(RawTemperature::Number(t)) => Some(t),
            Some(RawTemperature::Text(t)) => t.trim().parse::<f64>().ok(),
            None => None,
        };
        DimmerValue {
            // an idle dimmer reports 0, which means "no setting"
            setting_percent: raw.dimmer.filter(|p| *p != 0.0),
            temperature_c,
        }
    }
}
