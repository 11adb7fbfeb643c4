use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use slotsnipe::clock::{Clock, SystemClock};
use slotsnipe::config::Config;
use slotsnipe::monitor::SlotMonitor;
use slotsnipe::plan::Plan;
use slotsnipe::vendor::SimulatedVendor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env().validated();
    slotsnipe::observability::init(config.metrics_port);

    // The daemon runs against the in-process facility; a real client plugs in
    // through `VendorClient`.
    let sim = Arc::new(SimulatedVendor::new());
    let plan = match &config.plan {
        Some(path) => Some(Plan::load(path)?),
        None => None,
    };
    if let Some(plan) = &plan {
        plan.stock(&sim);
    }

    let clock = Arc::new(SystemClock);
    let monitor = SlotMonitor::open(config.clone(), sim, clock.clone())?;
    if let Some(plan) = &plan {
        plan.seed(&monitor, clock.now_ms()).await?;
    }

    let _events = monitor.register_callback(|event| {
        let payload = event.payload();
        info!(
            kind = payload.kind,
            job_id = %payload.job_id,
            account_id = ?payload.account_id,
            outcome = %payload.outcome,
            "snipe event"
        );
    });

    let recovered = monitor.start().await?;
    info!("slotsnipe running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  poll_interval: {:?}", config.poll_interval);
    info!("  cache_ttl: {:?}", config.cache_ttl);
    info!("  dispatch_horizon: {:?}", config.dispatch_horizon);
    info!("  recovered: {recovered}");
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop the loops on SIGTERM/ctrl-c, drain running snipes
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, draining running snipes...");
    monitor.shutdown(Duration::from_secs(10)).await;
    info!("slotsnipe stopped");
    Ok(())
}
