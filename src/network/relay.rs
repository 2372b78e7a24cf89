use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::Frame;

/// Minimal relay: registers peers by id and forwards request/response frames
/// between them. Used for local runs and tests.
#[derive(Clone)]
pub struct Relay {
    relay_peer_id: String,
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>>,
}

impl Relay {
    pub fn new(relay_peer_id: impl Into<String>) -> Self {
        Self {
            relay_peer_id: relay_peer_id.into(),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Frame>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "Relay {} listening on {}",
            self.relay_peer_id,
            listener.local_addr()?
        );
        loop {
            let (stream, addr) = listener.accept().await?;
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream).await {
                    debug!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let ws = accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        let peer_id = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                    Ok(Frame::Register { peer_id }) if !peer_id.is_empty() => break peer_id,
                    _ => {
                        let reject = Frame::Error {
                            id: None,
                            to: None,
                            message: "expected register frame".into(),
                        };
                        write.send(Message::Text(reject.encode()?.into())).await?;
                        return Ok(());
                    }
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        if self.peers().insert(peer_id.clone(), tx.clone()).is_some() {
            warn!("Peer {peer_id} re-registered; replacing old connection");
        }
        info!("Peer {peer_id} registered");

        let ack = Frame::Registered {
            relay_peer_id: self.relay_peer_id.clone(),
        };
        write.send(Message::Text(ack.encode()?.into())).await?;

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Ok(text) = frame.encode() else { continue };
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = read.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            match Frame::decode(text.as_str()) {
                Ok(frame) => self.route(&peer_id, &tx, frame),
                Err(e) => warn!("Malformed frame from {peer_id}: {e}"),
            }
        }

        {
            let mut peers = self.peers();
            if peers.get(&peer_id).is_some_and(|current| current.same_channel(&tx)) {
                peers.remove(&peer_id);
            }
        }
        writer.abort();
        info!("Peer {peer_id} disconnected");
        Ok(())
    }

    fn route(&self, sender_id: &str, sender: &mpsc::UnboundedSender<Frame>, frame: Frame) {
        match frame {
            Frame::Request {
                id,
                mut from,
                to,
                request,
            } => {
                // The registered id is authoritative.
                from.peer_id = sender_id.to_string();
                from.relay_id = self.relay_peer_id.clone();
                if !to.relay_id.is_empty() && to.relay_id != self.relay_peer_id {
                    let _ = sender.send(Frame::Error {
                        id: Some(id),
                        to: None,
                        message: format!("unknown relay {}", to.relay_id),
                    });
                    return;
                }
                let forward = Frame::Request {
                    id,
                    from,
                    to: to.clone(),
                    request,
                };
                if !self.forward(&to.peer_id, forward) {
                    let _ = sender.send(Frame::Error {
                        id: Some(id),
                        to: None,
                        message: format!("peer {} is not connected", to.peer_id),
                    });
                }
            }
            Frame::Response { id, to, response } => {
                let target = to.peer_id.clone();
                if !self.forward(&target, Frame::Response { id, to, response }) {
                    debug!("Dropping response {id}: {target} gone");
                }
            }
            Frame::Error {
                id,
                to: Some(to),
                message,
            } => {
                let target = to.peer_id.clone();
                let error = Frame::Error {
                    id,
                    to: Some(to),
                    message,
                };
                if !self.forward(&target, error) {
                    debug!("Dropping error for {target}: peer gone");
                }
            }
            other => debug!("Ignoring {other:?} from {sender_id}"),
        }
    }

    fn forward(&self, peer_id: &str, frame: Frame) -> bool {
        match self.peers().get(peer_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::MonitorError;
    use crate::network::{
        PeerNetwork, RelayClient, RequestHandler, report_msg, say_hello, start_monitor,
    };
    use crate::types::{PeerAddress, PeerRequest, PeerResponse, RelayNode};

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, from: &PeerAddress, request: PeerRequest) -> PeerResponse {
            match request {
                PeerRequest::Hello => PeerResponse::Greeting(format!("hi {}", from.peer_id)),
                PeerRequest::StartMonitor { wallet_address } => {
                    PeerResponse::Accepted(!wallet_address.is_empty())
                }
                PeerRequest::Report { .. } => PeerResponse::Accepted(true),
            }
        }
    }

    async fn start_relay() -> RelayNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Relay::new("relay-test").serve(listener));
        RelayNode {
            peer_id: "relay-test".into(),
            address: format!("ws://{addr}"),
        }
    }

    fn client(id: &str) -> RelayClient {
        RelayClient::new(Some(id.to_string()), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn peers_call_each_other_through_relay() {
        let relay = start_relay().await;
        let alice = client("alice");
        let bob = client("bob");
        bob.register(Arc::new(Echo));

        let identity = alice.connect(&relay).await.unwrap();
        assert_eq!(identity.relay_peer_id, "relay-test");
        bob.connect(&relay).await.unwrap();
        assert!(alice.status().is_connected);

        let bob_addr = PeerAddress::new("bob", "relay-test");
        assert_eq!(say_hello(&alice, &bob_addr).await.unwrap(), "hi alice");
        assert!(start_monitor(&alice, &bob_addr, "0xABC").await.unwrap());
        assert!(!start_monitor(&alice, &bob_addr, "").await.unwrap());
        assert!(report_msg(&alice, &bob_addr, "[]".into()).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_peer_fails_fast() {
        let relay = start_relay().await;
        let alice = client("alice");
        alice.connect(&relay).await.unwrap();

        let err = say_hello(&alice, &PeerAddress::new("nobody", "relay-test"))
            .await
            .unwrap_err();
        match err {
            MonitorError::RelayCallFailed { reason, transient } => {
                assert!(reason.contains("not connected"));
                assert!(!transient);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn peer_without_handler_rejects() {
        let relay = start_relay().await;
        let alice = client("alice");
        let carol = client("carol");
        alice.connect(&relay).await.unwrap();
        carol.connect(&relay).await.unwrap();

        let err = say_hello(&alice, &PeerAddress::new("carol", "relay-test"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::RelayCallFailed { .. }));
    }

    #[tokio::test]
    async fn call_before_connect_fails() {
        let alice = client("alice");
        assert!(!alice.status().is_connected);
        let err = say_hello(&alice, &PeerAddress::new("bob", "relay-test"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::RelayCallFailed { .. }));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_connection_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let alice = client("alice");
        let err = alice
            .connect(&RelayNode {
                peer_id: String::new(),
                address: format!("ws://{addr}"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn disconnect_clears_status() {
        let relay = start_relay().await;
        let alice = client("alice");
        alice.connect(&relay).await.unwrap();
        alice.disconnect().await;
        let status = alice.status();
        assert!(!status.is_connected);
        assert!(status.relay_peer_id.is_none());
    }
}
