use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::aggregator::{encode_payload, merge};
use crate::api::ActivityFeed;
use crate::error::MonitorError;
use crate::network::{PeerNetwork, report_msg};
use crate::reporter;
use crate::retry::{RetryPolicy, with_retry};
use crate::session::{SessionHandle, TickPlan};
use crate::types::{EventKind, Marketplace, PollWindow};

/// Result of one polling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not monitoring; nothing happened.
    Inert,
    /// Skipped because the previous tick is still running.
    Busy,
    /// Watermark seeded; no fetch this tick.
    Seeded(u64),
    /// Events delivered and watermark advanced to `window.to`.
    Reported { window: PollWindow, events: Vec<String> },
    /// Nothing delivered; the watermark stays so the next tick re-covers the window.
    Failed { window: PollWindow, reason: String },
    /// Delivered, but the session was torn down meanwhile.
    Discarded,
}

/// Fixed-period loop: fetch both marketplaces for the elapsed window, merge,
/// and report to the peer that requested monitoring.
pub struct PollScheduler {
    session: SessionHandle,
    feed: Arc<dyn ActivityFeed>,
    network: Arc<dyn PeerNetwork>,
    relay_retry: RetryPolicy,
}

impl PollScheduler {
    pub fn new(
        session: SessionHandle,
        feed: Arc<dyn ActivityFeed>,
        network: Arc<dyn PeerNetwork>,
        relay_retry: RetryPolicy,
    ) -> Self {
        Self {
            session,
            feed,
            network,
            relay_retry,
        }
    }

    /// Run one tick at unix time `now`.
    pub async fn tick(&self, now: u64) -> TickOutcome {
        let guard = match self.session.begin_tick(now) {
            TickPlan::Inert => return TickOutcome::Inert,
            TickPlan::Busy => {
                debug!("Previous tick still running, skipping");
                return TickOutcome::Busy;
            }
            TickPlan::Seeded(watermark) => {
                info!("Seeded watermark at {watermark}");
                reporter::report(EventKind::WatermarkSeeded { watermark });
                return TickOutcome::Seeded(watermark);
            }
            TickPlan::Poll(guard) => guard,
        };
        let window = guard.window;
        info!(
            "Fetching latest events for {}, window ({}, {}]",
            guard.wallet_address, window.from, window.to
        );

        let (opensea, rarible) = tokio::join!(
            self.feed
                .fetch_events(Marketplace::OpenSea, &guard.wallet_address, window),
            self.feed
                .fetch_events(Marketplace::Rarible, &guard.wallet_address, window),
        );
        if let (Err(os_err), Err(rb_err)) = (&opensea, &rarible) {
            return self.fail(window, format!("{os_err}; {rb_err}"));
        }
        let events = merge(
            source_labels(Marketplace::OpenSea, opensea),
            source_labels(Marketplace::Rarible, rarible),
        );

        let payload = match encode_payload(&events) {
            Ok(p) => p,
            Err(e) => return self.fail(window, e.to_string()),
        };
        let network = self.network.as_ref();
        let target = &guard.report_target;
        let payload = &payload;
        let sent = with_retry(self.relay_retry, "report", move || {
            report_msg(network, target, payload.clone())
        })
        .await;
        match sent {
            Ok(true) => {}
            Ok(false) => warn!("{target} refused report for window ({}, {}]", window.from, window.to),
            Err(e) => return self.fail(window, e.to_string()),
        }

        let target = target.to_string();
        if !guard.commit() {
            debug!("Session torn down during tick; discarding");
            return TickOutcome::Discarded;
        }
        info!("Reported {} event(s) to {target}", events.len());
        reporter::report(EventKind::TickReported {
            window,
            events: events.clone(),
            target,
        });
        TickOutcome::Reported { window, events }
    }

    fn fail(&self, window: PollWindow, reason: String) -> TickOutcome {
        warn!("Tick for window ({}, {}] failed: {reason}", window.from, window.to);
        reporter::report(EventKind::TickFailed {
            window,
            reason: reason.clone(),
        });
        TickOutcome::Failed { window, reason }
    }

    /// Tick every `period` until `shutdown` fires. Each tick runs on its own
    /// task; a tick that outlives the period makes the next one `Busy`.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Entering polling loop (interval: {period:?})");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Poll scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.tick(crate::unix_now()).await;
                    });
                }
            }
        }
    }
}

/// A failing source contributes nothing; the other one is still reported.
fn source_labels(source: Marketplace, result: Result<Vec<String>, MonitorError>) -> Vec<String> {
    match result {
        Ok(labels) => labels,
        Err(e) => {
            warn!("Skipping {source} this tick: {e}");
            Vec::new()
        }
    }
}
