use anyhow::Result;
use std::sync::Arc;

use crate::config::{Config, HardwareMode};
use crate::domain::{InMemoryBroker, SimulatedDimmer, SimulatedMeter, SystemClock};
use crate::router::RouterPorts;

/// Publications kept by the in-process broker in simulated mode
const SIMULATED_BROKER_HISTORY: usize = 64;

/// Builds the router's ports for the configured [`HardwareMode`].
///
/// Network mode is only available with the `network` feature so a build
/// without it can never drive a real dimmer.
pub struct DeviceFactory {
    mode: HardwareMode,
    config: Config,
}

impl DeviceFactory {
    pub fn new(config: Config) -> Self {
        Self {
            mode: config.hardware.mode,
            config,
        }
    }

    pub fn mode(&self) -> HardwareMode {
        self.mode
    }

    pub fn create_ports(&self) -> Result<RouterPorts> {
        let router = &self.config.router;
        let clock = Arc::new(SystemClock::new(
            router.day_start_hour,
            router.night_start_hour,
            router.parsed_timezone()?,
        ));

        match self.mode {
            HardwareMode::Simulated => {
                let sim = &self.config.simulation;
                let dimmer = Arc::new(
                    SimulatedDimmer::water_tank(0, sim.initial_water_temp_c).with_auto_step(),
                );
                let meter = SimulatedMeter::new(
                    sim.base_consumption_w,
                    sim.base_production_w,
                    dimmer.clone(),
                    self.config.load.load_power_w,
                );
                tracing::info!(
                    base_consumption_w = sim.base_consumption_w,
                    base_production_w = sim.base_production_w,
                    "using simulated devices"
                );
                Ok(RouterPorts {
                    meter: Arc::new(meter),
                    dimmer,
                    broker: Arc::new(
                        InMemoryBroker::connected().with_history_limit(SIMULATED_BROKER_HISTORY),
                    ),
                    clock,
                })
            }
            #[cfg(feature = "network")]
            HardwareMode::Network => {
                use super::{EnvoyMeter, MqttBroker, WifiDimmer};

                let cfg = &self.config;
                tracing::info!(
                    meter = %cfg.meter.host,
                    dimmer = %cfg.dimmer.host,
                    broker = %cfg.mqtt.host,
                    "using network devices"
                );
                Ok(RouterPorts {
                    meter: Arc::new(EnvoyMeter::new(&cfg.meter)?),
                    dimmer: Arc::new(WifiDimmer::new(&cfg.dimmer)?),
                    broker: Arc::new(MqttBroker::connect(
                        &cfg.mqtt,
                        &cfg.telemetry.availability_topic(),
                    )),
                    clock,
                })
            }
            #[cfg(not(feature = "network"))]
            HardwareMode::Network => {
                anyhow::bail!("network hardware requested but built without the 'network' feature")
            }
        }
    }
}
