use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::types::{PeerAddress, PollWindow};

/// In-memory monitoring state. Nothing here outlives the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSession {
    pub is_connected: bool,
    pub is_monitoring: bool,
    pub wallet_address: String,
    /// Watermark: end of the last reported window (unix seconds).
    pub last_timestamp: Option<u64>,
    /// Peer that asked for monitoring; reports go back to it.
    pub report_target: Option<PeerAddress>,
    pub tick_in_flight: bool,
    pub torn_down: bool,
}

impl MonitorSession {
    fn is_active(&self) -> bool {
        self.is_monitoring
            && !self.wallet_address.is_empty()
            && self.report_target.is_some()
            && !self.torn_down
    }
}

/// What a polling tick should do, decided atomically against the session.
#[derive(Debug)]
pub enum TickPlan {
    /// Not monitoring, no wallet or torn down. Nothing was touched.
    Inert,
    /// A previous tick is still running.
    Busy,
    /// First active tick: the watermark was seeded and nothing else happens.
    Seeded(u64),
    /// Fetch and report this window. Dropping the guard releases the tick.
    Poll(TickGuard),
}

/// Shared handle to the single `MonitorSession`.
///
/// Both the timer loop and inbound peer handlers mutate the session; every
/// mutation goes through this handle and holds the lock only for the
/// duration of the state change, never across an await.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Mutex<MonitorSession>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorSession> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> MonitorSession {
        self.lock().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().is_connected = connected;
    }

    /// Mirror a network's connection state into `is_connected` until the
    /// sender goes away.
    pub async fn follow_connection(self, mut state: watch::Receiver<bool>) {
        loop {
            let connected = *state.borrow_and_update();
            self.set_connected(connected);
            if state.changed().await.is_err() {
                break;
            }
        }
    }

    /// Record the wallet to watch and who to report to. Returns whether the
    /// request was accepted; an empty address is refused.
    ///
    /// Switching monitoring on clears the watermark so the next tick seeds.
    /// While already monitoring, the watermark is kept and only the wallet and
    /// target change.
    pub fn start_monitoring(&self, wallet_address: &str, report_target: PeerAddress) -> bool {
        let wallet_address = wallet_address.trim();
        let mut session = self.lock();
        if wallet_address.is_empty() || session.torn_down {
            return false;
        }
        if !session.is_monitoring {
            session.last_timestamp = None;
        }
        session.wallet_address = wallet_address.to_string();
        session.report_target = Some(report_target);
        session.is_monitoring = true;
        true
    }

    /// Decide the next tick at time `now`.
    pub fn begin_tick(&self, now: u64) -> TickPlan {
        let mut session = self.lock();
        if !session.is_active() {
            return TickPlan::Inert;
        }
        if session.tick_in_flight {
            return TickPlan::Busy;
        }
        let (Some(watermark), Some(report_target)) =
            (session.last_timestamp, session.report_target.clone())
        else {
            session.last_timestamp = Some(now);
            return TickPlan::Seeded(now);
        };
        session.tick_in_flight = true;
        TickPlan::Poll(TickGuard {
            handle: self.clone(),
            wallet_address: session.wallet_address.clone(),
            report_target,
            window: PollWindow::since(watermark, now),
        })
    }

    /// Stop accepting work. Ticks still in flight finish without touching state.
    pub fn teardown(&self) {
        let mut session = self.lock();
        session.torn_down = true;
        session.is_monitoring = false;
        session.is_connected = false;
    }

    fn advance_watermark(&self, to: u64) -> bool {
        let mut session = self.lock();
        if session.torn_down {
            return false;
        }
        let next = session.last_timestamp.map_or(to, |current| current.max(to));
        session.last_timestamp = Some(next);
        true
    }

    fn release_tick(&self) {
        self.lock().tick_in_flight = false;
    }
}

/// Exclusive right to run one polling tick.
#[derive(Debug)]
pub struct TickGuard {
    handle: SessionHandle,
    pub wallet_address: String,
    pub report_target: PeerAddress,
    pub window: PollWindow,
}

impl TickGuard {
    /// Advance the watermark to the end of this window. Call only once the
    /// report has been delivered. Returns false if the session was torn down.
    pub fn commit(self) -> bool {
        self.handle.advance_watermark(self.window.to)
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.handle.release_tick();
    }
}
