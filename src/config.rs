use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::{Uncased, UncasedStr},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration could not be read: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub load: LoadConfig,
    #[validate(nested)]
    pub router: RouterConfig,
    pub hardware: HardwareConfig,
    #[validate(nested)]
    pub meter: MeterConfig,
    #[validate(nested)]
    pub dimmer: DimmerConfig,
    #[validate(nested)]
    pub mqtt: MqttConfig,
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

/// The controlled resistive load
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct LoadConfig {
    /// Wattage drawn at a 100% setting
    #[validate(range(exclusive_min = 0.0))]
    pub load_power_w: f64,
    /// Highest setting the router may command, day and night
    #[validate(range(max = 100))]
    pub max_power_percent: u8,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            load_power_w: 100.0,
            max_power_percent: 50,
        }
    }
}

/// Night thermostat thresholds, in °C
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermostatConfig {
    pub water_low_range_c: f64,
    pub water_target_c: f64,
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            water_low_range_c: 55.0,
            water_target_c: 55.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RouterConfig {
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    #[validate(range(max = 23))]
    pub day_start_hour: u32,
    #[validate(range(max = 23))]
    pub night_start_hour: u32,
    /// IANA zone name, host local time when unset
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub thermostat: ThermostatConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 5,
            day_start_hour: 7,
            night_start_hour: 23,
            timezone: None,
            thermostat: ThermostatConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }

    pub fn parsed_timezone(&self) -> Result<Option<Tz>, ConfigError> {
        self.timezone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|e| ConfigError::Inconsistent(format!("timezone {name}: {e}")))
            })
            .transpose()
    }
}

/// Where the ports come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HardwareMode {
    /// In-process water tank, household meter and broker
    #[default]
    Simulated,
    /// Envoy meter, Wi-Fi dimmer and MQTT broker over the network
    Network,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub mode: HardwareMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MeterConfig {
    pub host: String,
    pub token: String,
    #[validate(range(min = 100))]
    pub timeout_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            token: String::new(),
            timeout_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DimmerConfig {
    pub host: String,
    #[validate(range(min = 100))]
    pub timeout_ms: u64,
}

impl Default for DimmerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            timeout_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[validate(length(min = 1))]
    pub client_id: String,
    #[validate(range(min = 1))]
    pub keep_alive_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "pv-router".into(),
            keep_alive_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TelemetryConfig {
    #[validate(length(min = 1))]
    pub discovery_prefix: String,
    #[validate(length(min = 1))]
    pub device_id: String,
    pub model: String,
    pub manufacturer: String,
}

impl TelemetryConfig {
    /// Topic root shared by every sensor of the device
    pub fn sensor_base(&self) -> String {
        format!("{}/sensor/{}", self.discovery_prefix, self.device_id)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.sensor_base())
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            discovery_prefix: "homeassistant".into(),
            device_id: "pv-router".into(),
            model: "Enphase Envoy".into(),
            manufacturer: "Dprslt".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub base_consumption_w: f64,
    pub base_production_w: f64,
    pub initial_water_temp_c: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            base_consumption_w: 300.0,
            base_production_w: 1200.0,
            initial_water_temp_c: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: Option<String>,
}

/// Flat variable names used by earlier deployments
fn legacy_env_key(key: &UncasedStr) -> Option<Uncased<'_>> {
    let mapped = match key.as_str().to_ascii_uppercase().as_str() {
        "LOAD_POWER" => "load.load_power_w",
        "MAX_PWR" => "load.max_power_percent",
        "MQTT_HOST" => "mqtt.host",
        "MQTT_USERNAME" => "mqtt.username",
        "MQTT_PASSWORD" => "mqtt.password",
        "DIMMER_HOSTNAME" => "dimmer.host",
        "ENVOY_HOSTNAME" => "meter.host",
        "TOKEN" => "meter.token",
        _ => return None,
    };
    Some(Uncased::from(mapped))
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::raw().filter_map(legacy_env_key))
            .merge(Env::prefixed("PV_ROUTER__").split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: Config = figment.extract()?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Field ranges plus the rules spanning several fields
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.router.day_start_hour == self.router.night_start_hour {
            return Err(ConfigError::Inconsistent(
                "day_start_hour and night_start_hour must differ".into(),
            ));
        }
        let thermostat = &self.router.thermostat;
        if thermostat.water_low_range_c > thermostat.water_target_c {
            return Err(ConfigError::Inconsistent(format!(
                "water_low_range_c ({}) is above water_target_c ({})",
                thermostat.water_low_range_c, thermostat.water_target_c
            )));
        }
        self.router.parsed_timezone()?;

        if self.hardware.mode == HardwareMode::Network {
            let missing: Vec<&str> = [
                ("meter.host", self.meter.host.as_str()),
                ("meter.token", self.meter.token.as_str()),
                ("dimmer.host", self.dimmer.host.as_str()),
                ("mqtt.host", self.mqtt.host.as_str()),
            ]
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect();
            if !missing.is_empty() {
                return Err(ConfigError::Inconsistent(format!(
                    "network mode requires {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }
}
