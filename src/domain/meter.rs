use anyhow::Result;
use async_trait::async_trait;
use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

use super::dimmer::SimulatedDimmer;

/// Meter-specific errors
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Malformed meter reading: {0}")]
    MalformedReading(String),
    #[error("Meter offline or unavailable")]
    Offline,
}

/// Instantaneous production and grid power, in watts.
///
/// `consumption` is the net grid flow: negative while exporting to the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub production: f64,
    pub consumption: f64,
}

impl MeterReading {
    pub fn new(production: f64, consumption: f64) -> Self {
        Self {
            production,
            consumption,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Meter: Send + Sync {
    async fn read_values(&self) -> Result<MeterReading>;
}

/// Household meter coupled to a [`SimulatedDimmer`].
///
/// The dimmer's draw is part of the household consumption, so routing power
/// into the load is visible on the next reading just like on a real site.
#[derive(Debug)]
pub struct SimulatedMeter {
    base: RwLock<MeterReading>,
    dimmer: Arc<SimulatedDimmer>,
    load_power_w: f64,
}

impl SimulatedMeter {
    /// `base_consumption` is the household draw without the routed load.
    pub fn new(
        base_consumption: f64,
        base_production: f64,
        dimmer: Arc<SimulatedDimmer>,
        load_power_w: f64,
    ) -> Self {
        Self {
            base: RwLock::new(MeterReading::new(base_production, base_consumption)),
            dimmer,
            load_power_w,
        }
    }

    pub async fn set_values(&self, base_consumption: f64, base_production: f64) {
        *self.base.write().await = MeterReading::new(base_production, base_consumption);
    }

    pub async fn base_consumption(&self) -> f64 {
        self.base.read().await.consumption
    }

    pub async fn base_production(&self) -> f64 {
        self.base.read().await.production
    }

    async fn total_consumption(&self) -> f64 {
        let drawn = self.dimmer.drawn_power_w(self.load_power_w).await;
        self.base.read().await.consumption + drawn
    }
}

#[async_trait]
impl Meter for SimulatedMeter {
    async fn read_values(&self) -> Result<MeterReading> {
        let production = self.base.read().await.production;
        let consumption = self.total_consumption().await - production;
        Ok(MeterReading::new(production, consumption))
    }
}

/// Meter replaying a fixed script of readings; an empty script reports the meter offline.
pub struct ScriptedMeter {
    readings: RwLock<VecDeque<Result<MeterReading, MeterError>>>,
}

impl ScriptedMeter {
    pub fn new(readings: impl IntoIterator<Item = MeterReading>) -> Self {
        Self {
            readings: RwLock::new(readings.into_iter().map(Ok).collect()),
        }
    }

    pub async fn push(&self, reading: Result<MeterReading, MeterError>) {
        self.readings.write().await.push_back(reading);
    }
}

#[async_trait]
impl Meter for ScriptedMeter {
    async fn read_values(&self) -> Result<MeterReading> {
        let mut q = self.readings.write().await;
        match q.pop_front() {
            Some(reading) => Ok(reading?),
            None => Err(MeterError::Offline.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dimmer;

    fn meter(base_consumption: f64, base_production: f64) -> (SimulatedMeter, Arc<SimulatedDimmer>) {
        let dimmer = Arc::new(SimulatedDimmer::water_tank(0, 45.0));
        let meter = SimulatedMeter::new(base_consumption, base_production, dimmer.clone(), 1000.0);
        (meter, dimmer)
    }

    #[tokio::test]
    async fn test_meter_sets_base_values() {
        let (meter, _) = meter(100.0, 200.0);
        assert_eq!(meter.base_consumption().await, 100.0);
        assert_eq!(meter.base_production().await, 200.0);

        meter.set_values(300.0, 500.0).await;
        assert_eq!(meter.base_consumption().await, 300.0);
        assert_eq!(meter.base_production().await, 500.0);
    }

    #[tokio::test]
    async fn test_meter_reports_net_grid_flow() {
        let (meter, _) = meter(100.0, 200.0);
        let reading = meter.read_values().await.unwrap();
        assert_eq!(reading.consumption, -100.0);
        assert_eq!(reading.production, 200.0);

        meter.set_values(300.0, 500.0).await;
        let reading = meter.read_values().await.unwrap();
        assert_eq!(reading.consumption, -200.0);
        assert_eq!(reading.production, 500.0);
    }

    #[tokio::test]
    async fn test_meter_includes_dimmer_draw() {
        let (meter, dimmer) = meter(100.0, 0.0);
        dimmer.module_power(50).await.unwrap();
        let reading = meter.read_values().await.unwrap();
        assert_eq!(reading.consumption, 600.0);
    }

    #[tokio::test]
    async fn test_scripted_meter_replays_then_goes_offline() {
        let meter = ScriptedMeter::new([MeterReading::new(1000.0, -1000.0)]);
        meter
            .push(Err(MeterError::Communication("timeout".into())))
            .await;

        assert_eq!(
            meter.read_values().await.unwrap(),
            MeterReading::new(1000.0, -1000.0)
        );
        let err = meter.read_values().await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        let err = meter.read_values().await.unwrap_err();
        assert!(err.to_string().contains("offline"));
    }
}
