use std::fmt;

use serde::{Deserialize, Serialize};

/// The two marketplaces polled every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marketplace {
    OpenSea,
    Rarible,
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marketplace::OpenSea => write!(f, "OpenSea"),
            Marketplace::Rarible => write!(f, "Rarible"),
        }
    }
}

/// Activity types queried one by one against the Rarible `byUser` endpoint.
///
/// Rarible has no single call returning every type for a wallet and time
/// range, so each tag gets its own request and labels the activities it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaribleActivityType {
    TransferFrom,
    TransferTo,
    Mint,
    Burn,
    MakeBid,
    GetBid,
    List,
    Buy,
    Sell,
    CancelList,
    CancelBid,
}

impl RaribleActivityType {
    /// Every tag, in request order.
    pub const ALL: [RaribleActivityType; 11] = [
        RaribleActivityType::TransferFrom,
        RaribleActivityType::TransferTo,
        RaribleActivityType::Mint,
        RaribleActivityType::Burn,
        RaribleActivityType::MakeBid,
        RaribleActivityType::GetBid,
        RaribleActivityType::List,
        RaribleActivityType::Buy,
        RaribleActivityType::Sell,
        RaribleActivityType::CancelList,
        RaribleActivityType::CancelBid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RaribleActivityType::TransferFrom => "TRANSFER_FROM",
            RaribleActivityType::TransferTo => "TRANSFER_TO",
            RaribleActivityType::Mint => "MINT",
            RaribleActivityType::Burn => "BURN",
            RaribleActivityType::MakeBid => "MAKE_BID",
            RaribleActivityType::GetBid => "GET_BID",
            RaribleActivityType::List => "LIST",
            RaribleActivityType::Buy => "BUY",
            RaribleActivityType::Sell => "SELL",
            RaribleActivityType::CancelList => "CANCEL_LIST",
            RaribleActivityType::CancelBid => "CANCEL_BID",
        }
    }
}

impl fmt::Display for RaribleActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open polling window `(from, to]` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollWindow {
    pub from: u64,
    pub to: u64,
}

impl PollWindow {
    /// Window from the watermark up to `now`. A clock that stepped backwards
    /// collapses the window to empty instead of inverting it.
    pub fn since(watermark: u64, now: u64) -> Self {
        Self {
            from: watermark,
            to: now.max(watermark),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

/// A peer reachable through a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub peer_id: String,
    pub relay_id: String,
}

impl PeerAddress {
    pub fn new(peer_id: impl Into<String>, relay_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            relay_id: relay_id.into(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.peer_id, self.relay_id)
    }
}

/// A known relay entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    pub peer_id: String,
    /// Websocket address of the relay, e.g. `wss://relay.example.org/ws`.
    pub address: String,
}

/// Operations a remote peer may invoke on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PeerRequest {
    /// Liveness check.
    Hello,
    /// Start monitoring `wallet_address`, reporting back to the caller.
    StartMonitor { wallet_address: String },
    /// An aggregated payload produced by a monitoring peer.
    Report { payload: String },
}

impl PeerRequest {
    pub fn label(&self) -> &'static str {
        match self {
            PeerRequest::Hello => "hello",
            PeerRequest::StartMonitor { .. } => "start_monitor",
            PeerRequest::Report { .. } => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PeerResponse {
    Greeting(String),
    Accepted(bool),
}

/// A diagnostic event emitted as a single JSON line on stdout.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl MonitorEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Connected {
        peer_id: String,
        relay_peer_id: String,
    },
    HelloReceived {
        from: String,
    },
    MonitorStarted {
        from: String,
        wallet_address: String,
    },
    ReportReceived {
        from: String,
        events: Vec<String>,
    },
    WatermarkSeeded {
        watermark: u64,
    },
    TickReported {
        window: PollWindow,
        events: Vec<String>,
        target: String,
    },
    TickFailed {
        window: PollWindow,
        reason: String,
    },
}
