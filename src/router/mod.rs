pub mod control;
pub mod grid_state;

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, LoadConfig, ThermostatConfig};
use crate::domain::{Broker, Clock, ConnectionEvent, Dimmer, Meter};
use crate::publisher::{StatePayload, TelemetryPublisher, OFFLINE};

pub use control::{clamp_setting, decide, Decision};
pub use grid_state::GridState;

/// Longest a cycle waits on telemetry; never more than the tick itself.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a cycle was abandoned. Every variant leaves the load switched off.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("meter read failed: {0:#}")]
    MeterRead(anyhow::Error),
    #[error("dimmer read failed: {0:#}")]
    DimmerRead(anyhow::Error),
    #[error("dimmer command failed: {0:#}")]
    Actuation(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RouterPhase {
    Idle,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

/// The four long-lived collaborators of the router
#[derive(Clone)]
pub struct RouterPorts {
    pub meter: Arc<dyn Meter>,
    pub dimmer: Arc<dyn Dimmer>,
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterSettings {
    pub load: LoadConfig,
    pub thermostat: ThermostatConfig,
    /// Pause between the end of one cycle and the start of the next
    pub tick: Duration,
}

impl RouterSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            load: cfg.load,
            thermostat: cfg.router.thermostat,
            tick: cfg.router.tick(),
        }
    }
}

pub struct Router {
    ports: RouterPorts,
    settings: RouterSettings,
    publisher: Arc<TelemetryPublisher>,
    phase: Mutex<RouterPhase>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn new(ports: RouterPorts, settings: RouterSettings, publisher: TelemetryPublisher) -> Self {
        Self {
            ports,
            settings,
            publisher: Arc::new(publisher),
            phase: Mutex::new(RouterPhase::Idle),
            connection_task: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> RouterPhase {
        *self.phase.lock()
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    fn publish_timeout(&self) -> Duration {
        self.settings.tick.min(PUBLISH_TIMEOUT)
    }

    /// Follow the broker's connection lifecycle and (re)install discovery on
    /// every connect. Must be called from within a tokio runtime.
    pub fn initialize(&self) {
        {
            let mut phase = self.phase.lock();
            if *phase != RouterPhase::Idle {
                return;
            }
            *phase = RouterPhase::Initialized;
        }

        let mut events = self.ports.broker.connection_events();
        let publisher = self.publisher.clone();
        let already_connected = self.ports.broker.is_ready();

        let handle = tokio::spawn(async move {
            if already_connected {
                install_discovery(&publisher).await;
            }
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => {
                        info!("broker connected");
                        install_discovery(&publisher).await;
                    }
                    Ok(ConnectionEvent::Disconnected) => warn!("broker connection lost"),
                    Ok(ConnectionEvent::Error(reason)) => error!(%reason, "broker error"),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "broker events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.connection_task.lock() = Some(handle);
    }

    /// One control cycle. On error the load has already been switched off.
    pub async fn loop_iteration(&self) -> Result<Decision, RouterError> {
        match self.cycle().await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(error = %e, "cycle failed, switching load off");
                self.fail_safe().await;
                Err(e)
            }
        }
    }

    async fn cycle(&self) -> Result<Decision, RouterError> {
        let (meter, dimmer) = tokio::join!(
            self.ports.meter.read_values(),
            self.ports.dimmer.read_values()
        );
        let meter = meter.map_err(RouterError::MeterRead)?;
        let dimmer = dimmer.map_err(RouterError::DimmerRead)?;

        let state = GridState::new(
            meter,
            dimmer,
            self.ports.clock.period(),
            self.settings.load,
            self.settings.thermostat,
        );
        let decision = decide(&state);

        let payload = StatePayload {
            power_grid: state.consumption,
            power_solar: state.production,
            router_percent: Some(decision.resulting_setting(&state)),
            water_temperature: state.water_temp,
        };
        let actuate = async {
            match decision.command() {
                Some(percent) => self.ports.dimmer.module_power(percent).await,
                None => Ok(()),
            }
        };
        let publish = tokio::time::timeout(
            self.publish_timeout(),
            self.publisher.publish_state(&payload),
        );
        let (actuated, published) = tokio::join!(actuate, publish);
        match published {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "telemetry publish failed"),
            Err(_) => warn!(
                timeout_ms = (self.publish_timeout().as_millis() as u64),
                "telemetry publish timed out"
            ),
        }
        actuated.map_err(RouterError::Actuation)?;

        log_cycle(&state, &decision);
        Ok(decision)
    }

    async fn fail_safe(&self) {
        if let Err(e) = self.ports.dimmer.module_power(0).await {
            error!(error = %format!("{e:#}"), "could not switch load off");
        }
    }

    /// Run cycles until `shutdown` fires, then [`stop`](Self::stop).
    ///
    /// A cycle in flight is never interrupted; the pause between cycles is.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.initialize();
        {
            let mut phase = self.phase.lock();
            if *phase != RouterPhase::Initialized {
                anyhow::bail!("router cannot run from phase {}", *phase);
            }
            *phase = RouterPhase::Running;
        }
        info!(
            tick_seconds = self.settings.tick.as_secs_f64(),
            load_power_w = self.settings.load.load_power_w,
            max_power_percent = self.settings.load.max_power_percent,
            "router started"
        );

        while !shutdown.is_cancelled() {
            // failures are contained and logged by loop_iteration
            let _ = self.loop_iteration().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.tick) => {}
            }
        }
        self.stop().await
    }

    /// Switch the load off and announce the device offline. Idempotent.
    ///
    /// The load is switched off even when the broker is unreachable; the
    /// returned error only reports a failed dimmer command.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, RouterPhase::Stopping | RouterPhase::Stopped) {
                return Ok(());
            }
            *phase = RouterPhase::Stopping;
        }
        info!("stopping, setting load to 0");

        if let Some(handle) = self.connection_task.lock().take() {
            handle.abort();
        }
        let zeroed = self.ports.dimmer.module_power(0).await;
        if let Err(e) = &zeroed {
            error!(error = %format!("{e:#}"), "could not switch load off on stop");
        }

        if self.ports.broker.is_ready() {
            let offline = tokio::time::timeout(
                self.publish_timeout(),
                self.publisher.publish_availability(OFFLINE),
            );
            match offline.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %format!("{e:#}"), "offline status not published"),
                Err(_) => warn!("offline status publish timed out"),
            }
        }

        *self.phase.lock() = RouterPhase::Stopped;
        info!("router stopped");
        zeroed
    }
}

async fn install_discovery(publisher: &TelemetryPublisher) {
    if let Err(e) = publisher.install_discovery().await {
        warn!(error = %format!("{e:#}"), "discovery not installed");
    }
}

fn log_cycle(state: &GridState, decision: &Decision) {
    match *decision {
        Decision::Route {
            change_percent,
            setting,
        } => info!(
            mode = %state.period,
            production_w = state.production,
            grid_w = state.consumption,
            used_w = state.net_consumption,
            overflow_w = state.overflow,
            water_temp_c = ?state.water_temp,
            dimmer_percent = state.dimmer_setting,
            change_percent,
            new_percent = setting,
            routed_w = state.load_power_at(setting).round(),
            "routing surplus"
        ),
        Decision::NoProduction => info!(
            mode = %state.period,
            production_w = state.production,
            grid_w = state.consumption,
            used_w = state.net_consumption,
            overflow_w = state.overflow,
            water_temp_c = ?state.water_temp,
            dimmer_percent = state.dimmer_setting,
            "no production to route"
        ),
        Decision::Thermostat { heating, command } => info!(
            mode = %state.period,
            production_w = state.production,
            grid_w = state.consumption,
            used_w = state.net_consumption,
            water_temp_c = ?state.water_temp,
            dimmer_percent = state.dimmer_setting,
            new_percent = ?command,
            heating,
            "night thermostat"
        ),
    }
}
