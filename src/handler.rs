use async_trait::async_trait;
use tracing::{info, warn};

use crate::aggregator::decode_payload;
use crate::network::RequestHandler;
use crate::reporter;
use crate::session::SessionHandle;
use crate::types::{EventKind, PeerAddress, PeerRequest, PeerResponse};

/// Serves the three operations remote peers can invoke on a monitor node.
#[derive(Clone)]
pub struct MonitorHandler {
    session: SessionHandle,
    accepts_monitoring: bool,
}

impl MonitorHandler {
    /// Handler for a node that runs the poll scheduler.
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            accepts_monitoring: true,
        }
    }

    /// Handler for a node without a poll scheduler: it greets and receives
    /// reports but refuses `start_monitor`.
    pub fn reporter_only(session: SessionHandle) -> Self {
        Self {
            session,
            accepts_monitoring: false,
        }
    }

    fn hello(&self, from: &PeerAddress) -> PeerResponse {
        info!("Hello from {from}");
        reporter::report(EventKind::HelloReceived {
            from: from.peer_id.clone(),
        });
        PeerResponse::Greeting(format!("Hello back to you, \n{}", from.peer_id))
    }

    fn start_monitor(&self, from: &PeerAddress, wallet_address: &str) -> PeerResponse {
        if !self.accepts_monitoring {
            warn!("Refused monitor request from {from}: this node does not poll");
            return PeerResponse::Accepted(false);
        }
        let accepted = self.session.start_monitoring(wallet_address, from.clone());
        if accepted {
            info!("Monitoring {wallet_address} for {from}");
            reporter::report(EventKind::MonitorStarted {
                from: from.peer_id.clone(),
                wallet_address: wallet_address.trim().to_string(),
            });
        } else {
            warn!("Refused monitor request from {from} (wallet: {wallet_address:?})");
        }
        PeerResponse::Accepted(accepted)
    }

    fn report(&self, from: &PeerAddress, payload: &str) -> PeerResponse {
        match decode_payload(payload) {
            Ok(events) => {
                info!("Report from {from}: {} event(s)", events.len());
                reporter::report(EventKind::ReportReceived {
                    from: from.peer_id.clone(),
                    events,
                });
                PeerResponse::Accepted(true)
            }
            Err(e) => {
                warn!("Malformed report from {from}: {e}");
                PeerResponse::Accepted(false)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for MonitorHandler {
    async fn handle(&self, from: &PeerAddress, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::Hello => self.hello(from),
            PeerRequest::StartMonitor { wallet_address } => self.start_monitor(from, &wallet_address),
            PeerRequest::Report { payload } => self.report(from, &payload),
        }
    }
}
