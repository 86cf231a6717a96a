use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Dimmer-specific errors
#[derive(Debug, Error)]
pub enum DimmerError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Invalid power setting: {0}% (must be 0-100)")]
    InvalidSetting(u8),
    #[error("Dimmer offline or unavailable")]
    Offline,
}

/// What the dimmer reports about itself.
///
/// Both fields are optional: firmwares omit the setting while idle and the
/// temperature when no probe is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DimmerValue {
    pub setting_percent: Option<f64>,
    pub temperature_c: Option<f64>,
}

#[async_trait]
pub trait Dimmer: Send + Sync {
    async fn read_values(&self) -> Result<DimmerValue>;
    /// Command a new duty percentage. Callers pass a floored, capped value.
    async fn module_power(&self, percent: u8) -> Result<()>;
}

/// Commands remembered by [`SimulatedDimmer::commands`]
pub const COMMAND_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct TankState {
    power_percent: u8,
    temperature_c: f64,
}

/// Dimmer driving a simulated water tank.
///
/// Each [`step`](Self::step) the water gains 1°C when the load runs at 50% or
/// more, loses 1°C under 10%, and holds in between.
#[derive(Debug)]
pub struct SimulatedDimmer {
    state: RwLock<TankState>,
    commands: RwLock<VecDeque<u8>>,
    /// Advance the tank model on every read (used when running the binary in simulated mode)
    pub auto_step: bool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl SimulatedDimmer {
    pub fn water_tank(initial_percent: u8, initial_temp_c: f64) -> Self {
        Self {
            state: RwLock::new(TankState {
                power_percent: initial_percent.min(100),
                temperature_c: initial_temp_c,
            }),
            commands: RwLock::new(VecDeque::new()),
            auto_step: false,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_auto_step(mut self) -> Self {
        self.auto_step = true;
        self
    }

    pub async fn step(&self) {
        let mut st = self.state.write().await;
        if st.power_percent >= 50 {
            st.temperature_c += 1.0;
        } else if st.power_percent < 10 {
            st.temperature_c -= 1.0;
        }
    }

    pub async fn power_percent(&self) -> u8 {
        self.state.read().await.power_percent
    }

    pub async fn temperature_c(&self) -> f64 {
        self.state.read().await.temperature_c
    }

    pub async fn set_temperature(&self, temperature_c: f64) {
        self.state.write().await.temperature_c = temperature_c;
    }

    /// Overwrite the setting without recording a command, as if changed on the device itself.
    pub async fn force_power(&self, percent: u8) {
        self.state.write().await.power_percent = percent.min(100);
    }

    /// The latest [`COMMAND_HISTORY`] percentages commanded through
    /// [`Dimmer::module_power`], oldest first.
    pub async fn commands(&self) -> Vec<u8> {
        self.commands.read().await.iter().copied().collect()
    }

    pub async fn drawn_power_w(&self, load_power_w: f64) -> f64 {
        f64::from(self.power_percent().await) / 100.0 * load_power_w
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dimmer for SimulatedDimmer {
    async fn read_values(&self) -> Result<DimmerValue> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DimmerError::Offline.into());
        }
        if self.auto_step {
            self.step().await;
        }
        let st = self.state.read().await;
        Ok(DimmerValue {
            setting_percent: Some(f64::from(st.power_percent)),
            temperature_c: Some(st.temperature_c),
        })
    }

    async fn module_power(&self, percent: u8) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DimmerError::Communication("write rejected".into()).into());
        }
        if percent > 100 {
            return Err(DimmerError::InvalidSetting(percent).into());
        }
        self.state.write().await.power_percent = percent;
        let mut commands = self.commands.write().await;
        if commands.len() == COMMAND_HISTORY {
            commands.pop_front();
        }
        commands.push_back(percent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_module_power_changes_setting() {
        let dimmer = SimulatedDimmer::water_tank(30, 45.0);
        assert_eq!(dimmer.power_percent().await, 30);
        dimmer.module_power(50).await.unwrap();
        assert_eq!(dimmer.power_percent().await, 50);
        assert_eq!(dimmer.commands().await, vec![50]);
    }

    #[tokio::test]
    async fn test_tank_cools_when_not_powered() {
        let dimmer = SimulatedDimmer::water_tank(0, 45.0);
        dimmer.step().await;
        assert_eq!(dimmer.temperature_c().await, 44.0);
        dimmer.step().await;
        assert_eq!(dimmer.temperature_c().await, 43.0);
    }

    #[tokio::test]
    async fn test_tank_heats_when_powered() {
        let dimmer = SimulatedDimmer::water_tank(100, 45.0);
        dimmer.step().await;
        assert_eq!(dimmer.temperature_c().await, 46.0);
        dimmer.module_power(75).await.unwrap();
        dimmer.step().await;
        assert_eq!(dimmer.temperature_c().await, 47.0);
    }

    #[tokio::test]
    async fn test_tank_holds_when_lightly_powered() {
        let dimmer = SimulatedDimmer::water_tank(40, 45.0);
        dimmer.step().await;
        assert_eq!(dimmer.temperature_c().await, 45.0);
    }

    #[tokio::test]
    async fn test_auto_step_advances_on_read() {
        let dimmer = SimulatedDimmer::water_tank(100, 45.0).with_auto_step();
        let value = dimmer.read_values().await.unwrap();
        assert_eq!(value.temperature_c, Some(46.0));
        assert_eq!(value.setting_percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_command_history_is_bounded() {
        let dimmer = SimulatedDimmer::water_tank(0, 45.0);
        for i in 0..COMMAND_HISTORY + 10 {
            dimmer.module_power((i % 101) as u8).await.unwrap();
        }
        let commands = dimmer.commands().await;
        assert_eq!(commands.len(), COMMAND_HISTORY);
        assert_eq!(commands[0], 10);
        assert_eq!(*commands.last().unwrap(), ((COMMAND_HISTORY + 9) % 101) as u8);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_setting() {
        let dimmer = SimulatedDimmer::water_tank(0, 45.0);
        assert!(dimmer.module_power(101).await.is_err());
        assert!(dimmer.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let dimmer = SimulatedDimmer::water_tank(20, 45.0);
        dimmer.set_fail_reads(true);
        assert!(dimmer.read_values().await.is_err());
        // writes still go through so a fail-safe can land
        dimmer.module_power(0).await.unwrap();

        dimmer.set_fail_writes(true);
        assert!(dimmer.module_power(10).await.is_err());
        assert_eq!(dimmer.power_percent().await, 0);
    }
}
