//! codex-bridge-server: HTTP front for a Codex app-server subprocess.

use std::sync::Arc;

use anyhow::Context;
use codex_bridge::transport::serve;
use codex_bridge::{BridgeConfig, BridgeService};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with RUST_LOG, CODEX_LOG_LEVEL and LOG_FORMAT support.
fn init_tracing(log_level: &str) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!(
            "codex_bridge={level},codex_bridge_server={level}",
            level = log_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_level);

    info!(
        codex_path = %config.codex_path.display(),
        host = %config.host,
        port = config.port,
        "Starting codex bridge"
    );

    let service = Arc::new(BridgeService::from_config(&config));
    service
        .start()
        .await
        .context("failed to start app-server")?;

    let monitor = service.spawn_health_monitor();

    serve(config.server_config(), Arc::clone(&service)).await?;

    join_monitor(monitor).await;

    Ok(())
}

/// Wait for the health loop to exit, logging a panic or cancellation.
async fn join_monitor(monitor: Option<JoinHandle<()>>) -> bool {
    let Some(monitor) = monitor else {
        return true;
    };
    match monitor.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Health monitor task failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_monitor_reports_panicked_loop() {
        let panicked = tokio::spawn(async { panic!("health loop bug") });
        assert!(!join_monitor(Some(panicked)).await);

        assert!(join_monitor(Some(tokio::spawn(async {}))).await);
        assert!(join_monitor(None).await);
    }
}
