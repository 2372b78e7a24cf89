use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Frame, NetworkStatus, PeerIdentity, PeerNetwork, RequestHandler};
use crate::error::MonitorError;
use crate::types::{PeerAddress, PeerRequest, PeerResponse, RelayNode};

/// How long the relay has to acknowledge registration.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingCall = oneshot::Sender<Result<PeerResponse, String>>;

#[derive(Default)]
struct Connection {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    relay_peer_id: Option<String>,
    pending: HashMap<Uuid, PendingCall>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    peer_id: String,
    conn: Mutex<Connection>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn send(&self, frame: Frame) -> bool {
        match &self.conn().outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Forget the relay and fail every pending call.
    fn drop_connection(&self) {
        let mut conn = self.conn();
        conn.outbound = None;
        conn.relay_peer_id = None;
        conn.pending.clear();
        self.connected.send_replace(false);
    }
}

/// `PeerNetwork` over a websocket to a single relay.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
    call_timeout: Duration,
}

impl RelayClient {
    pub fn new(peer_id: Option<String>, call_timeout: Duration) -> Self {
        let peer_id = peer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            shared: Arc::new(Shared {
                peer_id,
                conn: Mutex::new(Connection::default()),
                handler: Mutex::new(None),
                connected: watch::Sender::new(false),
            }),
            call_timeout,
        }
    }

    /// Follows the relay link: true after `connect`, false once it drops or
    /// `disconnect` is called.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    fn own_address(&self) -> Option<PeerAddress> {
        let conn = self.shared.conn();
        let relay = conn.relay_peer_id.clone()?;
        Some(PeerAddress::new(&self.shared.peer_id, relay))
    }
}

#[async_trait]
impl PeerNetwork for RelayClient {
    async fn connect(&self, relay: &RelayNode) -> Result<PeerIdentity, MonitorError> {
        self.disconnect().await;

        info!("Connecting to relay {} ({})", relay.peer_id, relay.address);
        let (ws_stream, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(relay.address.as_str()))
            .await
            .map_err(|_| MonitorError::ConnectionFailed(format!("timed out connecting to {}", relay.address)))?
            .map_err(|e| MonitorError::ConnectionFailed(format!("{}: {e}", relay.address)))?;
        let (mut write, mut read) = ws_stream.split();

        let register = Frame::Register {
            peer_id: self.shared.peer_id.clone(),
        };
        write
            .send(Message::Text(register.encode()?.into()))
            .await
            .map_err(|e| MonitorError::ConnectionFailed(format!("register: {e}")))?;

        let relay_peer_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str())? {
                        Frame::Registered { relay_peer_id } => return Ok(relay_peer_id),
                        Frame::Error { message, .. } => {
                            return Err(MonitorError::ConnectionFailed(message));
                        }
                        other => debug!("Ignoring frame before registration: {other:?}"),
                    },
                    Ok(_) => {}
                    Err(e) => return Err(MonitorError::ConnectionFailed(e.to_string())),
                }
            }
            Err(MonitorError::ConnectionFailed("relay closed during handshake".into()))
        })
        .await
        .map_err(|_| MonitorError::ConnectionFailed("relay did not acknowledge registration".into()))??;

        if !relay.peer_id.is_empty() && relay.peer_id != relay_peer_id {
            warn!(
                "Relay announced id {relay_peer_id}, expected {}",
                relay.peer_id
            );
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match frame.encode() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay read failed: {e}");
                        break;
                    }
                };
                match Frame::decode(text.as_str()) {
                    Ok(frame) => dispatch(&shared, frame),
                    Err(e) => warn!("Ignoring malformed frame: {e}"),
                }
            }
            warn!("Relay connection closed");
            shared.drop_connection();
        });

        {
            let mut conn = self.shared.conn();
            conn.outbound = Some(tx);
            conn.relay_peer_id = Some(relay_peer_id.clone());
            conn.tasks = vec![writer, reader];
        }
        self.shared.connected.send_replace(true);

        Ok(PeerIdentity {
            peer_id: self.shared.peer_id.clone(),
            relay_peer_id,
        })
    }

    fn status(&self) -> NetworkStatus {
        let conn = self.shared.conn();
        let is_connected = conn.outbound.as_ref().is_some_and(|tx| !tx.is_closed());
        NetworkStatus {
            is_connected,
            peer_id: Some(self.shared.peer_id.clone()),
            relay_peer_id: conn.relay_peer_id.clone(),
        }
    }

    fn register(&self, handler: Arc<dyn RequestHandler>) {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    async fn call(&self, target: &PeerAddress, request: PeerRequest) -> Result<PeerResponse, MonitorError> {
        let from = self
            .own_address()
            .ok_or_else(|| MonitorError::relay("not connected"))?;
        let id = Uuid::new_v4();
        let op = request.label();
        let (tx, rx) = oneshot::channel();
        self.shared.conn().pending.insert(id, tx);

        let frame = Frame::Request {
            id,
            from,
            to: target.clone(),
            request,
        };
        if !self.shared.send(frame) {
            self.shared.conn().pending.remove(&id);
            return Err(MonitorError::relay("connection closed"));
        }
        debug!("Sent {op} to {target} ({id})");

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(message))) => Err(MonitorError::relay(message)),
            Ok(Err(_)) => Err(MonitorError::relay("connection closed before response")),
            Err(_) => {
                self.shared.conn().pending.remove(&id);
                Err(MonitorError::relay_transient(format!(
                    "{op} to {target} timed out after {:?}",
                    self.call_timeout
                )))
            }
        }
    }

    async fn disconnect(&self) {
        let tasks = {
            let mut conn = self.shared.conn();
            conn.outbound = None;
            conn.relay_peer_id = None;
            conn.pending.clear();
            std::mem::take(&mut conn.tasks)
        };
        self.shared.connected.send_replace(false);
        for task in tasks {
            task.abort();
        }
    }
}

fn dispatch(shared: &Arc<Shared>, frame: Frame) {
    match frame {
        Frame::Request {
            id,
            from,
            to: _,
            request,
        } => {
            let Some(handler) = shared.handler() else {
                warn!("No handler registered; rejecting {} from {from}", request.label());
                shared.send(Frame::Error {
                    id: Some(id),
                    to: Some(from),
                    message: "no handler registered".into(),
                });
                return;
            };
            let shared = shared.clone();
            tokio::spawn(async move {
                let response = handler.handle(&from, request).await;
                shared.send(Frame::Response {
                    id,
                    to: from,
                    response,
                });
            });
        }
        Frame::Response { id, response, .. } => {
            if let Some(tx) = shared.conn().pending.remove(&id) {
                let _ = tx.send(Ok(response));
            } else {
                debug!("Late or unknown response {id}");
            }
        }
        Frame::Error {
            id: Some(id),
            message,
            ..
        } => {
            if let Some(tx) = shared.conn().pending.remove(&id) {
                let _ = tx.send(Err(message));
            }
        }
        Frame::Error { id: None, message, .. } => warn!("Relay error: {message}"),
        Frame::Register { .. } | Frame::Registered { .. } => {
            debug!("Ignoring unexpected handshake frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    /// Relay stand-in that acknowledges registration and then hangs up.
    async fn spawn_dropping_relay() -> RelayNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(Frame::Register { .. }) = Frame::decode(text.as_str()) {
                        let ack = Frame::Registered {
                            relay_peer_id: "flaky".into(),
                        };
                        ws.send(Message::Text(ack.encode().unwrap().into())).await.unwrap();
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = ws.close(None).await;
        });
        RelayNode {
            peer_id: "flaky".into(),
            address: format!("ws://{addr}"),
        }
    }

    #[tokio::test]
    async fn connection_state_clears_when_relay_hangs_up() {
        let relay = spawn_dropping_relay().await;
        let client = RelayClient::new(Some("alice".into()), Duration::from_secs(1));
        let mut state = client.connection_state();
        assert!(!*state.borrow());

        client.connect(&relay).await.unwrap();
        assert!(*state.borrow_and_update());

        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|up| !*up))
            .await
            .expect("connection state never cleared")
            .unwrap();
        assert!(!client.status().is_connected);
        assert!(client.status().relay_peer_id.is_none());
    }

    #[tokio::test]
    async fn disconnect_clears_connection_state() {
        let relay = spawn_dropping_relay().await;
        let client = RelayClient::new(None, Duration::from_secs(1));
        client.connect(&relay).await.unwrap();
        let state = client.connection_state();
        assert!(*state.borrow());
        client.disconnect().await;
        assert!(!*state.borrow());
    }
}
