pub mod aggregator;
pub mod api;
pub mod config;
pub mod error;
pub mod handler;
pub mod network;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod types;

/// OpenSea testnets events API base URL
pub const OPENSEA_API_BASE: &str = "https://testnets-api.opensea.io";

/// Rarible staging API base URL (public, no key required)
pub const RARIBLE_API_BASE: &str = "https://api-staging.rarible.org";

/// Seconds between polling ticks.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
