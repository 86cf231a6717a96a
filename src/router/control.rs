//! Decision rules for one cycle.
//!
//! Pure functions of a [`GridState`]: the router applies whatever comes out.

use super::grid_state::GridState;
use crate::domain::DayPeriod;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Daytime re-balancing of the load against the current overflow
    Route { change_percent: f64, setting: u8 },
    /// Daytime, nothing exported and the load is already off
    NoProduction,
    /// Night thermostat; `command` is `None` when the dimmer is already right
    Thermostat { heating: bool, command: Option<u8> },
}

impl Decision {
    /// Setting to send to the dimmer this cycle, if any
    pub fn command(&self) -> Option<u8> {
        match *self {
            Decision::Route { setting, .. } => Some(setting),
            Decision::NoProduction => None,
            Decision::Thermostat { command, .. } => command,
        }
    }

    /// Setting the dimmer ends the cycle at
    pub fn resulting_setting(&self, state: &GridState) -> u8 {
        self.command()
            .unwrap_or_else(|| clamp_setting(state.dimmer_setting, 100))
    }
}

pub fn decide(state: &GridState) -> Decision {
    match state.period {
        DayPeriod::Day => route_surplus(state),
        DayPeriod::Night => thermostat(state),
    }
}

/// Proportional routing.
///
/// The previous setting is the baseline and the overflow, as a share of the
/// load, is the correction. A running load is always re-evaluated so it can
/// be wound down once the surplus is gone.
pub fn route_surplus(state: &GridState) -> Decision {
    if !state.is_overflow_over_threshold() && state.is_dimmer_inactive() {
        return Decision::NoProduction;
    }
    let load = state.load();
    let change_percent = state.overflow / load.load_power_w * 100.0;
    let setting = clamp_setting(
        state.dimmer_setting + change_percent,
        load.max_power_percent,
    );
    Decision::Route {
        change_percent,
        setting,
    }
}

/// Night heating: fully capped or off, never parked mid-range.
pub fn thermostat(state: &GridState) -> Decision {
    let max = state.load().max_power_percent;
    if state.is_water_under_low_range() {
        let command = (state.dimmer_setting < f64::from(max)).then_some(max);
        Decision::Thermostat {
            heating: true,
            command,
        }
    } else if state.is_water_over_target() && state.is_dimmer_active() {
        Decision::Thermostat {
            heating: false,
            command: Some(0),
        }
    } else {
        Decision::Thermostat {
            heating: state.is_dimmer_active(),
            command: None,
        }
    }
}

/// Floor to a whole percent within `[0, max]`
pub fn clamp_setting(percent: f64, max: u8) -> u8 {
    if percent.is_nan() {
        return 0;
    }
    percent.floor().clamp(0.0, f64::from(max)) as u8
}
