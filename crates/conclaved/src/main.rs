//! conclaved — Conclave shared-object server daemon.

use std::time::Duration;

use anyhow::{Context, Result};

use conclave_core::config::ConclaveConfig;
use conclave_net::DatagramEndpoint;
use conclave_server::dispatch::ServerHandler;
use conclave_server::serve::{serve_datagram, serve_tcp};
use conclave_server::state::ServerState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ConclaveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ConclaveConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ConclaveConfig::default()
    });

    let listen_addr = format!("{}:{}", config.network.listen_addr, config.network.port);
    let datagram_port = if config.network.datagram_port == 0 {
        config.network.port
    } else {
        config.network.datagram_port
    };
    let datagram_addr = format!("{}:{}", config.network.listen_addr, datagram_port);
    tracing::info!(%listen_addr, %datagram_addr, "conclaved starting");

    let state = ServerState::new(config.clone());

    // ── Shutdown channel ─────────────────────────────────────────────────
    // Fired by Ctrl-C or by a registry Stop request over the wire.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handler = ServerHandler::new(state.clone(), shutdown_tx.clone());

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────

    let endpoint = DatagramEndpoint::bind(&datagram_addr)
        .await
        .context("failed to bind datagram endpoint")?;
    state.set_datagram(endpoint.clone());

    let datagram_task = tokio::spawn(serve_datagram(
        handler.clone(),
        endpoint,
        shutdown_tx.subscribe(),
    ));

    let accept_task = {
        let handler = handler.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_tcp(handler, &listen_addr, shutdown).await {
                tracing::error!(error = %e, "stream accept loop failed");
            }
        })
    };

    let keep_alive = {
        let state = state.clone();
        let period = config.protocol.keep_alive_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            loop {
                interval.tick().await;
                tracing::info!(
                    connections = state.connections.len(),
                    sessions = state.session_count(),
                    "server snapshot"
                );
            }
        })
    };

    let auth_sweeper = {
        let handler = handler.clone();
        let period = config.protocol.cleanup_period_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            loop {
                interval.tick().await;
                handler.sweep_stale_authorizations().await;
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = accept_task        => tracing::error!("accept loop exited: {:?}", r),
        r = datagram_task      => tracing::error!("datagram task exited: {:?}", r),
        r = keep_alive         => tracing::error!("keep-alive task exited: {:?}", r),
        r = auth_sweeper       => tracing::error!("authorization sweeper exited: {:?}", r),
    }

    Ok(())
}
