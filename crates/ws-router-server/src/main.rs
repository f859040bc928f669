mod cli;
mod config;
mod rooms;
mod routes;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref method_name) = cli.method_name {
        cfg.websocket.method_name = method_name.clone();
    }
    if let Some(ref level) = cli.log_level {
        cfg.logging.level = level.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        method_name = %cfg.websocket.method_name,
        origins = cfg.origin_allowlist.len(),
        auth = cfg.auth.token.is_some(),
        "ws-router-server starting"
    );

    // 4. Build routes.
    let app = routes::build_app(&cfg)?;

    // 5. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        tracing::warn!(%err, "failed to register SIGTERM handler");
                        ctrl_c.await.ok();
                        let _ = shutdown_tx.send(());
                        return;
                    }
                };

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (ctrl-c)");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT (ctrl-c)");
        }

        let _ = shutdown_tx.send(());
    });

    // 6. Serve until shutdown.
    let listener = TcpListener::bind(&cfg.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.network.listen_addr))?;

    app.serve_with_shutdown(listener, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    info!("ws-router-server shutting down");
    Ok(())
}
