use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod watch_logic;
use watch_logic::{config, presenter};

use lib_orderwatch::ingestors::SignalRConnector;
use lib_orderwatch::loggers::setup_logging;
use lib_orderwatch::retrieve::{ApiClient, OrderApi};
use lib_orderwatch::{ConnectionManager, ConnectionState, WatchSession};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    setup_logging(&log_dir, config.log_level.as_deref().unwrap_or("info"), "order_watch")?;

    let order_ids = config.order_ids()?;
    let watch_config = config.watch_config();
    watch_config.validate()?;

    // Hub connection first: a failed handshake is fatal and not retried.
    let mut connector = SignalRConnector::new();
    if let Some(token) = &config.token {
        connector = connector.with_access_token(token.clone());
    }
    let hub = config.hub_endpoint()?;
    let connection = ConnectionManager::new(Arc::new(connector), &watch_config)
        .connect(&hub)
        .await
        .with_context(|| format!("cannot reach the order hub at {}", hub))?;

    let client = ApiClient::new(
        config.api_url()?,
        config.token.clone(),
        config.http_retries.unwrap_or(3),
        watch_config.fetch_timeout(),
    )?;
    let session = WatchSession::new(connection.clone(), Arc::new(OrderApi::new(client)), watch_config)?;

    let shutdown = CancellationToken::new();
    let condition = config.poll_while.unwrap_or_default().condition();
    let presenters: Vec<_> = order_ids
        .into_iter()
        .map(|order_id| {
            let handle = session.open_watch(order_id, Arc::clone(&condition));
            tokio::spawn(presenter::present(handle, shutdown.clone()))
        })
        .collect();
    log::info!("Watching {} order(s) via {}", presenters.len(), hub);

    let mut states = connection.state_changes();

    // Wait for shutdown signal or a hub that is gone for good
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
        _ = states.wait_for(|state| *state == ConnectionState::Disconnected) => {
            match connection.connection_lost() {
                Some(err) => log::error!("{}. Order views are offline.", err),
                None => log::warn!("Hub connection closed."),
            }
        }
    }

    shutdown.cancel();
    for task in presenters {
        let _ = task.await;
    }
    session.close_all();
    connection.shutdown().await;

    log::info!("Shutdown complete.");
    match connection.connection_lost() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
