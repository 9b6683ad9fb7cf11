#![forbid(unsafe_code)]

mod transport;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use vhost_ctrl::{Config, ConfigError, ControlLoop, LoadTable, Registry, ZeroBackend};

use crate::transport::UnixSocketTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Args(err)) => err.exit(),
        Err(err) => return Err(err).context("invalid configuration"),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let transport = Arc::new(UnixSocketTransport::new());
    let registry = Registry::new(transport, config.registry_config());
    let (mut control, handle) = ControlLoop::new(registry, LoadTable::new(), config.poll_interval);

    for controller in &config.controllers {
        let registered = control.registry_mut().register(
            &controller.name,
            controller.cpumask,
            Arc::new(ZeroBackend),
        );
        if let Err(err) = registered {
            // Tear down whatever was already registered before bailing out.
            handle.request_shutdown();
            control.run().await;
            return Err(err).with_context(|| format!("failed to create {}", controller.name));
        }
    }

    tracing::info!(
        controllers = config.controllers.len(),
        app_mask = %config.app_mask,
        socket_dir = %config.socket_dir,
        "vhostd running"
    );
    let control = tokio::spawn(control.run());

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }

    tracing::info!("shutdown signal received");
    handle.request_shutdown();
    let summary = control.await.context("control loop panicked")?;
    tracing::info!(removed = summary.removed, busy = summary.busy, "vhostd stopped");
    Ok(())
}
