//! # PV router
//!
//! Routes surplus solar power into a dimmed resistive water heater during the
//! day and runs the same dimmer as a thermostat at night.
//!
//! The [`router::Router`] reads the [`domain::Meter`] and [`domain::Dimmer`]
//! once per cycle, classifies the situation as a [`router::GridState`], applies
//! the day or night rule and reports over a [`domain::Broker`]. Any failure in
//! a cycle switches the load off.

pub mod config;
pub mod domain;
pub mod hardware;
pub mod publisher;
pub mod router;
pub mod telemetry;
