//! End-to-end router cycles against the in-process devices.

use std::sync::Arc;
use std::time::Duration;

use pv_router::config::{LoadConfig, TelemetryConfig, ThermostatConfig};
use pv_router::domain::{
    DayPeriod, Dimmer, FixedClock, InMemoryBroker, MeterError, MeterReading, ScriptedMeter,
    SimulatedDimmer, SimulatedMeter,
};
use pv_router::publisher::{TelemetryPublisher, OFFLINE, ONLINE};
use pv_router::router::{Decision, Router, RouterError, RouterPhase, RouterPorts, RouterSettings};
use tokio_util::sync::CancellationToken;

const STATE_TOPIC: &str = "homeassistant/sensor/pv-router/state";
const STATUS_TOPIC: &str = "homeassistant/sensor/pv-router/status";
const GRID_CONFIG_TOPIC: &str = "homeassistant/sensor/pv-router/power_grid/config";

struct Site {
    router: Arc<Router>,
    meter: Arc<SimulatedMeter>,
    dimmer: Arc<SimulatedDimmer>,
    broker: Arc<InMemoryBroker>,
    clock: Arc<FixedClock>,
}

fn settings(max_power_percent: u8) -> RouterSettings {
    RouterSettings {
        load: LoadConfig {
            load_power_w: 1000.0,
            max_power_percent,
        },
        thermostat: ThermostatConfig::default(),
        tick: Duration::from_secs(5),
    }
}

fn site(period: DayPeriod, max_power_percent: u8, water_temp_c: f64) -> Site {
    let dimmer = Arc::new(SimulatedDimmer::water_tank(0, water_temp_c));
    let meter = Arc::new(SimulatedMeter::new(0.0, 0.0, dimmer.clone(), 1000.0));
    let broker = Arc::new(InMemoryBroker::connected());
    let clock = Arc::new(FixedClock::new(period));
    let ports = RouterPorts {
        meter: meter.clone(),
        dimmer: dimmer.clone(),
        broker: broker.clone(),
        clock: clock.clone(),
    };
    let publisher = TelemetryPublisher::new(broker.clone(), &TelemetryConfig::default());
    Site {
        router: Arc::new(Router::new(ports, settings(max_power_percent), publisher)),
        meter,
        dimmer,
        broker,
        clock,
    }
}

/// Poll until `check` holds; the connection task runs concurrently.
async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_day_routes_surplus_then_winds_down() {
    let s = site(DayPeriod::Day, 100, 50.0);

    s.meter.set_values(0.0, 1000.0).await;
    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 100);
    assert_eq!(s.broker.messages_on(STATE_TOPIC).len(), 1);

    // production halves while the load still draws 1000 W
    s.meter.set_values(0.0, 500.0).await;
    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 50);
    assert_eq!(s.broker.messages_on(STATE_TOPIC).len(), 2);
    assert_eq!(s.dimmer.commands().await, vec![100, 50]);
}

#[tokio::test]
async fn test_day_balanced_site_keeps_load_off() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.meter.set_values(500.0, 500.0).await;

    let decision = s.router.loop_iteration().await.unwrap();
    assert_eq!(decision, Decision::NoProduction);
    assert_eq!(s.dimmer.power_percent().await, 0);
    assert!(s.dimmer.commands().await.is_empty());

    let state = &s.broker.messages_on(STATE_TOPIC)[0];
    assert_eq!(
        state.payload,
        r#"{"power_grid":0.0,"power_solar":500.0,"router_percent":0,"water_temperature":50.0}"#
    );
}

#[tokio::test]
async fn test_day_setting_respects_cap() {
    let s = site(DayPeriod::Day, 60, 50.0);
    s.meter.set_values(0.0, 3000.0).await;

    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 60);
}

#[tokio::test]
async fn test_day_settles_once_surplus_is_absorbed() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.meter.set_values(200.0, 700.0).await;

    for _ in 0..3 {
        s.router.loop_iteration().await.unwrap();
    }
    // 500 W of surplus is exactly 50% of the load, after which the grid reads 0
    assert_eq!(s.dimmer.commands().await, vec![50, 50, 50]);
}

#[tokio::test]
async fn test_night_thermostat_heats_then_releases() {
    let s = site(DayPeriod::Night, 80, 40.0);
    // night ignores any export
    s.meter.set_values(0.0, 2000.0).await;

    let decision = s.router.loop_iteration().await.unwrap();
    assert_eq!(
        decision,
        Decision::Thermostat {
            heating: true,
            command: Some(80)
        }
    );
    assert_eq!(s.dimmer.power_percent().await, 80);

    // already at the cap, nothing to send
    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.commands().await, vec![80]);

    s.dimmer.set_temperature(56.0).await;
    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 0);

    // hot and idle: leave it alone
    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.commands().await, vec![80, 0]);
}

#[tokio::test]
async fn test_switching_period_between_cycles() {
    let s = site(DayPeriod::Night, 100, 60.0);
    s.meter.set_values(0.0, 1000.0).await;

    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 0);

    s.clock.set_period(DayPeriod::Day);
    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 100);
}

#[tokio::test]
async fn test_meter_outage_switches_load_off() {
    let dimmer = Arc::new(SimulatedDimmer::water_tank(0, 50.0));
    let meter = Arc::new(ScriptedMeter::new([MeterReading::new(800.0, -800.0)]));
    meter
        .push(Err(MeterError::Communication("connection refused".into())))
        .await;
    let broker = Arc::new(InMemoryBroker::connected());
    let ports = RouterPorts {
        meter,
        dimmer: dimmer.clone(),
        broker: broker.clone(),
        clock: Arc::new(FixedClock::new(DayPeriod::Day)),
    };
    let publisher = TelemetryPublisher::new(broker.clone(), &TelemetryConfig::default());
    let router = Router::new(ports, settings(100), publisher);

    router.loop_iteration().await.unwrap();
    assert_eq!(dimmer.power_percent().await, 80);

    let err = router.loop_iteration().await.unwrap_err();
    assert!(matches!(err, RouterError::MeterRead(_)));
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(dimmer.power_percent().await, 0);

    // script exhausted: the meter reports offline
    let err = router.loop_iteration().await.unwrap_err();
    assert!(matches!(err, RouterError::MeterRead(_)));
    assert_eq!(dimmer.commands().await, vec![80, 0, 0]);
    assert_eq!(broker.messages_on(STATE_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_dimmer_read_failure_switches_load_off() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.meter.set_values(0.0, 1000.0).await;
    s.router.loop_iteration().await.unwrap();

    s.dimmer.set_fail_reads(true);
    let err = s.router.loop_iteration().await.unwrap_err();
    assert!(matches!(err, RouterError::DimmerRead(_)));
    assert_eq!(s.dimmer.power_percent().await, 0);
}

#[tokio::test]
async fn test_state_is_skipped_while_broker_is_down() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.broker.disconnect();
    s.meter.set_values(0.0, 1000.0).await;

    s.router.loop_iteration().await.unwrap();
    assert_eq!(s.dimmer.power_percent().await, 100);
    assert!(s.broker.messages().is_empty());
}

#[tokio::test]
async fn test_discovery_on_every_connection() {
    let dimmer = Arc::new(SimulatedDimmer::water_tank(0, 50.0));
    let broker = Arc::new(InMemoryBroker::new());
    let ports = RouterPorts {
        meter: Arc::new(SimulatedMeter::new(0.0, 0.0, dimmer.clone(), 1000.0)),
        dimmer,
        broker: broker.clone(),
        clock: Arc::new(FixedClock::new(DayPeriod::Day)),
    };
    let publisher = TelemetryPublisher::new(broker.clone(), &TelemetryConfig::default());
    let router = Router::new(ports, settings(100), publisher);

    router.initialize();
    assert_eq!(router.phase(), RouterPhase::Initialized);
    assert!(broker.messages().is_empty());

    broker.connect();
    eventually(|| broker.messages_on(STATUS_TOPIC).len() == 1).await;
    assert_eq!(broker.messages_on(GRID_CONFIG_TOPIC).len(), 1);
    assert_eq!(broker.messages_on(STATUS_TOPIC)[0].payload, ONLINE);

    broker.raise_error("keep-alive timeout");
    broker.disconnect();
    broker.connect();
    eventually(|| broker.messages_on(STATUS_TOPIC).len() == 2).await;
    assert_eq!(broker.messages_on(GRID_CONFIG_TOPIC).len(), 2);
}

#[tokio::test]
async fn test_discovery_when_already_connected() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.router.initialize();
    eventually(|| s.broker.messages_on(STATUS_TOPIC).len() == 1).await;
    assert!(s.broker.messages_on(GRID_CONFIG_TOPIC)[0].retain);
}

#[tokio::test(start_paused = true)]
async fn test_run_cycles_on_tick_until_cancelled() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.meter.set_values(0.0, 1000.0).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let router = s.router.clone();
        let shutdown = shutdown.clone();
        async move { router.run(shutdown).await }
    });

    // cycles at t = 0s, 5s and 10s
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(s.router.phase(), RouterPhase::Running);
    assert_eq!(s.broker.messages_on(STATE_TOPIC).len(), 3);

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(s.router.phase(), RouterPhase::Stopped);
    assert_eq!(s.dimmer.power_percent().await, 0);
    let status = s.broker.messages_on(STATUS_TOPIC);
    assert_eq!(status.first().map(|m| m.payload.as_str()), Some(ONLINE));
    assert_eq!(status.last().map(|m| m.payload.as_str()), Some(OFFLINE));
}

#[tokio::test]
async fn test_run_after_stop_is_refused() {
    let s = site(DayPeriod::Day, 100, 50.0);
    s.router.stop().await.unwrap();
    assert!(s.router.run(CancellationToken::new()).await.is_err());
    assert_eq!(s.dimmer.read_values().await.unwrap().setting_percent, Some(0.0));
}
