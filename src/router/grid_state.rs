use chrono::{DateTime, Utc};

use crate::config::{LoadConfig, ThermostatConfig};
use crate::domain::{DayPeriod, DimmerValue, MeterReading};

/// Share of the load treated as noise: the dimmer cannot step finer than 1%.
pub const OVERFLOW_DEADBAND_RATIO: f64 = 0.01;

/// Snapshot of the site for one cycle.
///
/// Built from fresh readings and never mutated; every predicate is a pure
/// function of the snapshot and the thresholds captured at construction.
#[derive(Debug, Clone)]
pub struct GridState {
    /// Solar production (W)
    pub production: f64,
    /// Net grid flow (W), negative while exporting
    pub consumption: f64,
    /// Power exported to the grid (W), negative while importing
    pub overflow: f64,
    /// What the household actually uses (W)
    pub net_consumption: f64,
    /// Current dimmer setting (%), 0 when the dimmer did not report one
    pub dimmer_setting: f64,
    pub water_temp: Option<f64>,
    pub period: DayPeriod,
    pub timestamp: DateTime<Utc>,
    load: LoadConfig,
    thermostat: ThermostatConfig,
}

impl GridState {
    pub fn new(
        meter: MeterReading,
        dimmer: DimmerValue,
        period: DayPeriod,
        load: LoadConfig,
        thermostat: ThermostatConfig,
    ) -> Self {
        Self {
            production: meter.production,
            consumption: meter.consumption,
            overflow: -meter.consumption,
            net_consumption: meter.consumption + meter.production,
            dimmer_setting: dimmer.setting_percent.unwrap_or(0.0),
            water_temp: dimmer.temperature_c,
            period,
            timestamp: Utc::now(),
            load,
            thermostat,
        }
    }

    pub fn load(&self) -> &LoadConfig {
        &self.load
    }

    pub fn is_day(&self) -> bool {
        self.period == DayPeriod::Day
    }

    pub fn is_night(&self) -> bool {
        self.period == DayPeriod::Night
    }

    pub fn is_dimmer_inactive(&self) -> bool {
        self.dimmer_setting == 0.0
    }

    pub fn is_dimmer_active(&self) -> bool {
        !self.is_dimmer_inactive()
    }

    pub fn is_overflow_over_threshold(&self) -> bool {
        self.overflow > self.load.load_power_w * OVERFLOW_DEADBAND_RATIO
    }

    /// A missing probe never counts as cold water.
    pub fn is_water_under_low_range(&self) -> bool {
        self.water_temp
            .map_or(false, |t| t < self.thermostat.water_low_range_c)
    }

    /// A missing probe counts as hot water, so the load gets released.
    pub fn is_water_over_target(&self) -> bool {
        self.water_temp
            .map_or(true, |t| t >= self.thermostat.water_target_c)
    }

    /// Watts drawn by the load at `percent`
    pub fn load_power_at(&self, percent: u8) -> f64 {
        f64::from(percent) / 100.0 * self.load.load_power_w
    }
}
