//! Peer-to-peer session boundary.
//!
//! Peers never talk directly: each one holds a websocket to a relay and
//! addresses others by `(peer_id, relay_id)`. Three operations travel over
//! it (hello, start_monitor, report), each as a `Request` frame answered by a
//! `Response` or `Error` frame with the same id.

pub mod client;
pub mod relay;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MonitorError;
use crate::types::{PeerAddress, PeerRequest, PeerResponse, RelayNode};

pub use client::RelayClient;

/// Identity assigned once a relay accepted this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub relay_peer_id: String,
}

impl PeerIdentity {
    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(&self.peer_id, &self.relay_peer_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub peer_id: Option<String>,
    pub relay_peer_id: Option<String>,
}

/// Serves requests that remote peers invoke on this node.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, from: &PeerAddress, request: PeerRequest) -> PeerResponse;
}

/// Connection to the peer network.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    async fn connect(&self, relay: &RelayNode) -> Result<PeerIdentity, MonitorError>;

    fn status(&self) -> NetworkStatus;

    /// Install the handler for inbound requests, replacing any previous one.
    fn register(&self, handler: Arc<dyn RequestHandler>);

    /// Invoke `request` on `target` and wait for its answer.
    async fn call(&self, target: &PeerAddress, request: PeerRequest) -> Result<PeerResponse, MonitorError>;

    async fn disconnect(&self);
}

/// Wire frames exchanged between a peer and its relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register {
        peer_id: String,
    },
    Registered {
        relay_peer_id: String,
    },
    Request {
        id: Uuid,
        from: PeerAddress,
        to: PeerAddress,
        request: PeerRequest,
    },
    Response {
        id: Uuid,
        to: PeerAddress,
        response: PeerResponse,
    },
    Error {
        id: Option<Uuid>,
        /// Set when the error answers another peer's request and must be
        /// routed back to it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerAddress>,
        message: String,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String, MonitorError> {
        serde_json::to_string(self).map_err(|e| MonitorError::Payload(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, MonitorError> {
        serde_json::from_str(text).map_err(|e| MonitorError::Payload(e.to_string()))
    }
}

fn unexpected(op: &str, response: PeerResponse) -> MonitorError {
    MonitorError::relay(format!("unexpected response to {op}: {response:?}"))
}

/// Liveness check against a remote peer; returns its greeting.
pub async fn say_hello(net: &dyn PeerNetwork, target: &PeerAddress) -> Result<String, MonitorError> {
    match net.call(target, PeerRequest::Hello).await? {
        PeerResponse::Greeting(text) => Ok(text),
        other => Err(unexpected("hello", other)),
    }
}

/// Ask a remote peer to start monitoring `wallet_address` and report back here.
pub async fn start_monitor(
    net: &dyn PeerNetwork,
    target: &PeerAddress,
    wallet_address: &str,
) -> Result<bool, MonitorError> {
    let request = PeerRequest::StartMonitor {
        wallet_address: wallet_address.to_string(),
    };
    match net.call(target, request).await? {
        PeerResponse::Accepted(ok) => Ok(ok),
        other => Err(unexpected("start_monitor", other)),
    }
}

/// Forward an aggregated payload to a remote peer.
pub async fn report_msg(net: &dyn PeerNetwork, target: &PeerAddress, payload: String) -> Result<bool, MonitorError> {
    match net.call(target, PeerRequest::Report { payload }).await? {
        PeerResponse::Accepted(ok) => Ok(ok),
        other => Err(unexpected("report", other)),
    }
}
