//! # Hub Watch Smoke Run
//!
//! Connects to a live order hub, watches one order and prints every view
//! change for a fixed time. Assign the order from the dashboard while this
//! runs to see the push path; leave it alone to see the poll path.

use clap::Parser;
use lib_orderwatch::ingestors::{hub_url, SignalRConnector, HUB_PATH};
use lib_orderwatch::retrieve::{ApiClient, OrderApi};
use lib_orderwatch::{ConnectionManager, Order, WatchConfig, WatchSession};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(about = "Watch one order over the live hub")]
struct Args {
    /// Order id to watch.
    order_id: String,

    #[clap(long, env = "ORDER_WATCH_API_URL", default_value = "http://localhost:5000")]
    api_url: String,

    #[clap(long, env = "ORDER_WATCH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[clap(long, default_value_t = 60, help = "How long to watch, in seconds.")]
    seconds: u64,

    #[clap(long, default_value_t = 5_000, help = "Poll fallback interval in milliseconds.")]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = WatchConfig {
        poll_interval_ms: args.poll_interval_ms,
        ..Default::default()
    };

    let hub = hub_url(&args.api_url, HUB_PATH)?;
    let mut connector = SignalRConnector::new();
    if let Some(token) = &args.token {
        connector = connector.with_access_token(token.clone());
    }

    println!("[*] Connecting to {}...", hub);
    let connection = ConnectionManager::new(Arc::new(connector), &config)
        .connect(hub.as_str())
        .await?;
    println!("[*] Connected: {:?}", connection.state());

    let api = OrderApi::new(ApiClient::new(&args.api_url, args.token.clone(), 2, None)?);
    let session = WatchSession::new(connection.clone(), Arc::new(api), config)?;
    let mut handle = session.open_watch(args.order_id.as_str(), Arc::new(|o: &Order| !o.is_assigned));

    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = handle.changed() => match next {
                Some(view) => println!(
                    "[VIEW] v{} loading={} polling={} assigned={:?} error={:?}",
                    view.version,
                    view.is_loading,
                    session.is_polling(handle.entity_id()),
                    view.payload.as_ref().map(|o| o.is_assigned),
                    view.error.as_ref().map(|e| e.to_string()),
                ),
                None => break,
            },
        }
    }

    println!(
        "[*] Done. Reconnects: {}, state: {:?}",
        connection.reconnect_count(),
        connection.state()
    );
    handle.close();
    connection.shutdown().await;
    Ok(())
}
