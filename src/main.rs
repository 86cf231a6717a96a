use anyhow::Result;
use pv_router::config::Config;
use pv_router::hardware::DeviceFactory;
use pv_router::publisher::TelemetryPublisher;
use pv_router::router::{Router, RouterSettings};
use pv_router::telemetry::{cancel_on_shutdown, init_tracing};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env file is fine
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    init_tracing(&cfg.logging);

    let factory = DeviceFactory::new(cfg.clone());
    info!(
        mode = %factory.mode(),
        load_power_w = cfg.load.load_power_w,
        max_power_percent = cfg.load.max_power_percent,
        "starting PV router"
    );

    let ports = factory.create_ports()?;
    let broker = ports.broker.clone();
    let publisher = TelemetryPublisher::new(broker.clone(), &cfg.telemetry);
    let router = Router::new(ports, RouterSettings::from_config(&cfg), publisher);

    let shutdown = CancellationToken::new();
    cancel_on_shutdown(shutdown.clone());

    let result = router.run(shutdown).await;
    if let Err(e) = broker.close().await {
        warn!(error = %format!("{e:#}"), "broker did not close cleanly");
    }

    warn!("shutdown complete");
    result
}
