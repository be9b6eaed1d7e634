use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;

use tracing::{info, warn};

use hls_relay::{AppConfig, ApplicationServer, Logger};

// requests are orchestrated on one thread, decompression gets its own os threads
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // init logger and sentry, guards are kept alive to flush logs and maintain sentry connection
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger and env prepped...");

    // the json /metrics snapshot works without it, only /metrics/prometheus goes dark
    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let upkeep = handle.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5));
                loop {
                    interval.tick().await;
                    upkeep.run_upkeep();
                }
            });
            Some(handle)
        }
        Err(e) => {
            warn!("prometheus recorder not installed: {}", e);
            None
        }
    };

    ApplicationServer::serve(config, prometheus)
        .await
        .context("proxy server failed to start")?;

    Ok(())
}
