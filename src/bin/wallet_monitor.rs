use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use nft_wallet_monitor::api::MarketplaceClient;
use nft_wallet_monitor::config::{AppConfig, CONFIG_PATH};
use nft_wallet_monitor::handler::MonitorHandler;
use nft_wallet_monitor::network::relay::Relay;
use nft_wallet_monitor::network::{PeerIdentity, PeerNetwork, RelayClient, say_hello, start_monitor};
use nft_wallet_monitor::reporter;
use nft_wallet_monitor::retry::RetryPolicy;
use nft_wallet_monitor::scheduler::PollScheduler;
use nft_wallet_monitor::session::SessionHandle;
use nft_wallet_monitor::types::{EventKind, PeerAddress};

#[derive(Parser)]
#[command(name = "wallet-monitor", about = "NFT wallet activity monitor on a relayed peer network")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Relay to use: index into [network].relays, a configured peer id, or a ws:// address
    #[arg(long, global = true, default_value = "0")]
    relay: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and serve monitor requests, polling marketplaces until Ctrl+C
    Run {
        /// Seconds between polling ticks (overrides config)
        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Send a hello to a remote peer and print its greeting
    Hello {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        relay_id: String,
    },
    /// Ask a remote peer to monitor a wallet, then print its reports until Ctrl+C
    Monitor {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        relay_id: String,
        #[arg(long)]
        wallet: String,
    },
    /// List configured relays
    Relays,
    /// Run a local relay server
    Relay {
        #[arg(long, default_value = "127.0.0.1:9090")]
        listen: String,
        #[arg(long, default_value = "local-relay")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Command::Run { poll_interval } => run(config, &cli.relay, poll_interval).await,
        Command::Hello { peer, relay_id } => {
            let session = SessionHandle::new();
            let handler = MonitorHandler::reporter_only(session.clone());
            let (client, _) = connect(&config, &cli.relay, &session, handler).await?;
            let target = PeerAddress::new(peer, relay_id);
            let result = say_hello(client.as_ref(), &target).await;
            client.disconnect().await;
            println!("{}", result?);
            Ok(())
        }
        Command::Monitor {
            peer,
            relay_id,
            wallet,
        } => monitor(config, &cli.relay, PeerAddress::new(peer, relay_id), &wallet).await,
        Command::Relays => {
            if config.network.relays.is_empty() {
                warn!("No relays configured in {}", cli.config.display());
            }
            for (idx, relay) in config.network.relays.iter().enumerate() {
                println!("{idx}: {} {}", relay.peer_id, relay.address);
            }
            Ok(())
        }
        Command::Relay { listen, id } => {
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            info!("Relay {id} listening on ws://{listen}");
            Relay::new(id).serve(listener).await
        }
    }
}

/// Connect to the selected relay and install `handler` for inbound requests.
async fn connect(
    config: &AppConfig,
    selector: &str,
    session: &SessionHandle,
    handler: MonitorHandler,
) -> Result<(Arc<RelayClient>, PeerIdentity)> {
    let relay = config.network.select_relay(selector)?;
    let client = Arc::new(RelayClient::new(
        config.network.peer_id.clone(),
        config.network.call_timeout(),
    ));
    let identity = client.connect(&relay).await?;
    tokio::spawn(session.clone().follow_connection(client.connection_state()));
    client.register(Arc::new(handler));

    info!(
        "Connected as {} (relay {})",
        identity.peer_id, identity.relay_peer_id
    );
    reporter::report(EventKind::Connected {
        peer_id: identity.peer_id.clone(),
        relay_peer_id: identity.relay_peer_id.clone(),
    });
    Ok((client, identity))
}

async fn run(config: AppConfig, selector: &str, poll_interval: Option<u64>) -> Result<()> {
    let session = SessionHandle::new();
    let handler = MonitorHandler::new(session.clone());
    let (client, identity) = connect(&config, selector, &session, handler).await?;

    let feed = Arc::new(MarketplaceClient::new(&config)?);
    let relay_retry = RetryPolicy::new(
        config.settings.max_retries,
        config.settings.retry_base_delay(),
    );
    let scheduler = Arc::new(PollScheduler::new(
        session.clone(),
        feed,
        client.clone(),
        relay_retry,
    ));
    let period = poll_interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| config.settings.poll_interval());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_loop = tokio::spawn(scheduler.run(period, shutdown_rx));
    info!(
        "Ready for monitor requests at {} (Ctrl+C to stop)",
        identity.address()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.teardown();
    let _ = shutdown_tx.send(true);
    if let Err(e) = poll_loop.await {
        warn!("Poll loop ended abnormally: {e}");
    }
    client.disconnect().await;
    Ok(())
}

async fn monitor(config: AppConfig, selector: &str, target: PeerAddress, wallet: &str) -> Result<()> {
    let session = SessionHandle::new();
    let handler = MonitorHandler::reporter_only(session.clone());
    let (client, _) = connect(&config, selector, &session, handler).await?;

    match start_monitor(client.as_ref(), &target, wallet).await {
        Ok(true) => info!("Wallet {wallet} is being monitored"),
        Ok(false) => {
            client.disconnect().await;
            anyhow::bail!("{target} refused to monitor {wallet:?}");
        }
        Err(e) => {
            client.disconnect().await;
            return Err(e).context("Failed to request monitoring");
        }
    }

    info!("Waiting for reports from {target} (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await?;
    session.teardown();
    client.disconnect().await;
    Ok(())
}
