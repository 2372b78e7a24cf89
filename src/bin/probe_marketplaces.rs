//! Probe: one-shot marketplace fetch
//!
//! Hits the OpenSea events endpoint and the Rarible activities endpoint for a
//! wallet over an explicit window and documents:
//! - The exact request URLs
//! - Latency per marketplace
//! - Labels returned by each source and the merged report payload

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use nft_wallet_monitor::aggregator::{encode_payload, merge};
use nft_wallet_monitor::api::MarketplaceClient;
use nft_wallet_monitor::config::{AppConfig, CONFIG_PATH};
use nft_wallet_monitor::types::{PollWindow, RaribleActivityType};
use nft_wallet_monitor::unix_now;

#[derive(Parser)]
#[command(name = "probe_marketplaces", about = "Fetch marketplace activity for a wallet once")]
struct Args {
    /// Wallet address to query
    #[arg(long)]
    wallet: String,

    /// Window start, unix seconds (default: one hour before --to)
    #[arg(long)]
    from: Option<u64>,

    /// Window end, unix seconds (default: now)
    #[arg(long)]
    to: Option<u64>,

    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = AppConfig::load_or_default(&args.config)?;
    let client = MarketplaceClient::new(&config)?;

    let to = args.to.unwrap_or_else(unix_now);
    let window = PollWindow::since(args.from.unwrap_or(to.saturating_sub(3600)), to);

    println!("=== Probe: marketplace activity ===");
    println!("Wallet: {}", args.wallet);
    println!("Window: ({}, {}]", window.from, window.to);
    println!();

    println!("--- 1. OpenSea ---");
    println!("URL: {}", client.opensea_events_url(&args.wallet, window)?);
    let start = Instant::now();
    let opensea = client.fetch_opensea_events(&args.wallet, window).await;
    println!("Latency: {:?}", start.elapsed());
    let opensea = match opensea {
        Ok(labels) => {
            println!("Events: {} {:?}", labels.len(), labels);
            labels
        }
        Err(e) => {
            println!("Failed: {e}");
            Vec::new()
        }
    };
    println!();

    println!("--- 2. Rarible ({} activity types) ---", RaribleActivityType::ALL.len());
    println!(
        "URL (first type): {}",
        client.rarible_activities_url(RaribleActivityType::ALL[0], &args.wallet, window)?
    );
    let start = Instant::now();
    let rarible = client.fetch_rarible_events(&args.wallet, window).await;
    println!("Latency: {:?}", start.elapsed());
    let rarible = match rarible {
        Ok(labels) => {
            println!("Activities: {} {:?}", labels.len(), labels);
            labels
        }
        Err(e) => {
            println!("Failed: {e}");
            Vec::new()
        }
    };
    println!();

    println!("--- 3. Report payload ---");
    println!("{}", encode_payload(&merge(opensea, rarible))?);

    Ok(())
}
