//! # Order API Live Test
//!
//! Loads one order from a running backend through `OrderApi` and prints the
//! decoded record.

use clap::Parser;
use lib_orderwatch::retrieve::{ApiClient, OrderApi};
use lib_orderwatch::EntityId;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(about = "Fetch one order from the backend")]
struct Args {
    /// Order id to load.
    order_id: String,

    #[clap(long, env = "ORDER_WATCH_API_URL", default_value = "http://localhost:5000")]
    api_url: String,

    #[clap(long, env = "ORDER_WATCH_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let api = OrderApi::new(ApiClient::new(&args.api_url, args.token, 2, Some(Duration::from_secs(10)))?);

    println!("[*] Requesting order {} from {}...", args.order_id, args.api_url);

    match api.get_order(&EntityId::new(args.order_id)).await {
        Ok(order) => {
            println!("\n[SUCCESS] Order received:");
            println!("-----------------------------------------------");
            println!("{}", serde_json::to_string_pretty(&order)?);
            println!("-----------------------------------------------");
            println!(
                "[INFO] Assigned: {} ({})",
                order.is_assigned,
                order.delivery_name().unwrap_or_else(|| "nobody".into())
            );
        }
        Err(e) => {
            eprintln!("\n[ERROR] Order retrieval failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
