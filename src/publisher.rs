//! Home Assistant telemetry over the broker.
//!
//! Discovery entries are retained and re-sent on every connection; state is
//! sent once per cycle while the broker is up.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::TelemetryConfig;
use crate::domain::{Broker, PublishOptions};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

#[derive(Debug, Clone, Serialize)]
struct DeviceInfo {
    ids: String,
    name: String,
    sw: String,
    mdl: String,
    mf: String,
}

#[derive(Debug, Clone, Serialize)]
struct DiscoveryConfig<'a> {
    name: &'a str,
    #[serde(rename = "dev_cla", skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(rename = "unit_of_meas")]
    unit: &'a str,
    #[serde(rename = "stat_cla")]
    state_class: &'a str,
    state_topic: &'a str,
    #[serde(rename = "stat_t")]
    state_topic_short: &'a str,
    #[serde(rename = "avty_t")]
    availability_topic: &'a str,
    #[serde(rename = "uniq_id")]
    unique_id: String,
    value_template: String,
    dev: &'a DeviceInfo,
}

struct Sensor {
    name: &'static str,
    device_class: Option<&'static str>,
    unit: &'static str,
}

const SENSORS: [Sensor; 4] = [
    Sensor {
        name: "power_grid",
        device_class: Some("power"),
        unit: "W",
    },
    Sensor {
        name: "power_solar",
        device_class: Some("power"),
        unit: "W",
    },
    Sensor {
        name: "router_percent",
        device_class: None,
        unit: "%",
    },
    Sensor {
        name: "water_temperature",
        device_class: Some("temperature"),
        unit: "°C",
    },
];

/// Per-cycle state message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePayload {
    pub power_grid: f64,
    pub power_solar: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_temperature: Option<f64>,
}

pub struct TelemetryPublisher {
    broker: Arc<dyn Broker>,
    device: DeviceInfo,
    device_id: String,
    state_topic: String,
    availability_topic: String,
    config_prefix: String,
}

impl TelemetryPublisher {
    pub fn new(broker: Arc<dyn Broker>, cfg: &TelemetryConfig) -> Self {
        let base = cfg.sensor_base();
        Self {
            broker,
            device: DeviceInfo {
                ids: cfg.device_id.clone(),
                name: cfg.device_id.clone(),
                sw: "PV Router".into(),
                mdl: cfg.model.clone(),
                mf: cfg.manufacturer.clone(),
            },
            device_id: cfg.device_id.clone(),
            state_topic: format!("{base}/state"),
            availability_topic: cfg.availability_topic(),
            config_prefix: base,
        }
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn availability_topic(&self) -> &str {
        &self.availability_topic
    }

    pub fn config_topic(&self, sensor: &str) -> String {
        format!("{}/{}/config", self.config_prefix, sensor)
    }

    /// Register every sensor and mark the device online. Safe to repeat.
    pub async fn install_discovery(&self) -> Result<()> {
        info!(device = %self.device_id, "installing discovery entries");
        for sensor in &SENSORS {
            let entry = DiscoveryConfig {
                name: sensor.name,
                device_class: sensor.device_class,
                unit: sensor.unit,
                state_class: "measurement",
                state_topic: &self.state_topic,
                state_topic_short: &self.state_topic,
                availability_topic: &self.availability_topic,
                unique_id: format!("{}_{}", self.device_id, sensor.name),
                value_template: format!("{{{{ value_json.{} }}}}", sensor.name),
                dev: &self.device,
            };
            let payload = serde_json::to_string(&entry)?;
            self.broker
                .publish(
                    &self.config_topic(sensor.name),
                    &payload,
                    PublishOptions::retained(),
                )
                .await
                .with_context(|| format!("discovery for {} failed", sensor.name))?;
        }
        self.publish_availability(ONLINE).await?;
        info!(device = %self.device_id, "discovery configured");
        Ok(())
    }

    /// Returns `false` when skipped because the broker is not connected.
    pub async fn publish_state(&self, state: &StatePayload) -> Result<bool> {
        if !self.broker.is_ready() {
            debug!("not connected to the broker, skipping state");
            return Ok(false);
        }
        let payload = serde_json::to_string(state)?;
        self.broker
            .publish(&self.state_topic, &payload, PublishOptions::default())
            .await
            .context("state publish failed")?;
        Ok(true)
    }

    pub async fn publish_availability(&self, status: &str) -> Result<()> {
        self.broker
            .publish(&self.availability_topic, status, PublishOptions::retained())
            .await
            .with_context(|| format!("availability '{status}' publish failed"))
    }
}
