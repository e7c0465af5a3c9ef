//! Application-level liveness checks for connected peers.
//!
//! Every tracked peer gets its own task that pings it once per
//! `ping_interval`, starting immediately. A check makes up to
//! `ping_interval / ping_timeout` attempts, each given a `ping_timeout`
//! slot, so a single dropped ping does not tear a healthy link down while a
//! peer that never answers is declared dead within one interval.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::LATENCY_HISTORY_LEN;
use crate::identity::PeerId;
use crate::metrics::PeerMetrics;
use crate::pseudonym::pseudonym;
use crate::transport::Transport;

type DeadCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct HeartbeatRecord {
    epoch: u64,
    task: AbortHandle,
    /// Round-trip times, newest first.
    latency: VecDeque<Duration>,
}

pub struct HeartbeatSupervisor {
    transport: Arc<dyn Transport>,
    ping_interval: Duration,
    ping_timeout: Duration,
    records: Mutex<HashMap<PeerId, HeartbeatRecord>>,
    next_epoch: AtomicU64,
    metrics: Arc<PeerMetrics>,
}

impl HeartbeatSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        ping_interval: Duration,
        ping_timeout: Duration,
        metrics: Arc<PeerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            ping_interval,
            ping_timeout,
            records: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
            metrics,
        })
    }

    /// Start tracking `peer`. `on_dead` runs once if the peer stops
    /// answering pings.
    ///
    /// Returns false and does nothing if the peer is already tracked.
    pub fn start<F, Fut>(self: &Arc<Self>, peer: PeerId, on_dead: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut records = self.records.lock();
        if records.contains_key(&peer) {
            return false;
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let on_dead: DeadCallback = Box::new(move || on_dead().boxed());
        let task = tokio::spawn(Self::run(Arc::downgrade(self), peer.clone(), epoch, on_dead))
            .abort_handle();

        debug!("Starting heartbeat for {peer} ({})", pseudonym(&peer));
        records.insert(
            peer,
            HeartbeatRecord {
                epoch,
                task,
                latency: VecDeque::with_capacity(LATENCY_HISTORY_LEN + 1),
            },
        );
        true
    }

    async fn run(this: Weak<Self>, peer: PeerId, epoch: u64, on_dead: DeadCallback) {
        let Some(period) = this.upgrade().map(|s| s.ping_interval) else {
            return;
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(supervisor) = this.upgrade() else {
                return;
            };
            if supervisor.validate_ping(&peer, epoch).await {
                continue;
            }

            supervisor.metrics.heartbeat_failures.inc();
            if supervisor.remove_if_current(&peer, epoch) {
                warn!("Not connected to peer {peer} ({})", pseudonym(&peer));
                tokio::spawn(on_dead());
            }
            return;
        }
    }

    /// One heartbeat check. True if any attempt got a pong.
    async fn validate_ping(&self, peer: &PeerId, epoch: u64) -> bool {
        let retries = self.retries();
        for attempt in 1..=retries {
            let started = Instant::now();
            match tokio::time::timeout(self.ping_timeout, self.transport.ping(peer)).await {
                Ok(Ok(latency)) => {
                    self.record_latency(peer, epoch, latency);
                    return true;
                }
                Ok(Err(e)) => debug!("Ping {attempt}/{retries} to {peer} failed: {e}"),
                Err(_) => debug!("Ping {attempt}/{retries} to {peer} timed out"),
            }
            if attempt < retries {
                tokio::time::sleep_until(started + self.ping_timeout).await;
            }
        }
        false
    }

    fn retries(&self) -> u32 {
        let ratio = self.ping_interval.as_nanos() / self.ping_timeout.as_nanos().max(1);
        (ratio as u32).max(1)
    }

    fn record_latency(&self, peer: &PeerId, epoch: u64, latency: Duration) {
        let mut records = self.records.lock();
        // A record replaced or removed mid-ping discards the sample.
        if let Some(record) = records.get_mut(peer).filter(|r| r.epoch == epoch) {
            record.latency.push_front(latency);
            record.latency.truncate(LATENCY_HISTORY_LEN);
        }
    }

    fn remove_if_current(&self, peer: &PeerId, epoch: u64) -> bool {
        let mut records = self.records.lock();
        if records.get(peer).is_some_and(|r| r.epoch == epoch) {
            records.remove(peer);
            true
        } else {
            false
        }
    }

    /// Stop tracking `peer`. An in-flight ping is discarded.
    pub fn stop(&self, peer: &PeerId) {
        if let Some(record) = self.records.lock().remove(peer) {
            record.task.abort();
            debug!("Stopped heartbeat for {peer} ({})", pseudonym(peer));
        }
    }

    pub fn stop_all(&self) {
        for (_, record) in self.records.lock().drain() {
            record.task.abort();
        }
    }

    /// Latency history in milliseconds, newest first. Empty if untracked.
    pub fn get_latency_data(&self, peer: &PeerId) -> Vec<u64> {
        self.records
            .lock()
            .get(peer)
            .map(|r| r.latency.iter().map(|d| d.as_millis() as u64).collect())
            .unwrap_or_default()
    }

    pub fn is_tracking(&self, peer: &PeerId) -> bool {
        self.records.lock().contains_key(peer)
    }

    pub fn tracked_peers(&self) -> Vec<PeerId> {
        self.records.lock().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNetwork, MemoryTransport};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    const INTERVAL: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn connected_pair() -> (MemoryNetwork, Arc<MemoryTransport>, PeerId) {
        let network = MemoryNetwork::new();
        let a = network.add_peer("peer-a");
        let b = network.add_peer("peer-b");
        a.dial(&b.listen_addrs()[0]).await.unwrap();
        (network, a, b.local_peer_id())
    }

    fn supervisor(transport: Arc<MemoryTransport>) -> Arc<HeartbeatSupervisor> {
        HeartbeatSupervisor::new(transport, INTERVAL, TIMEOUT, Arc::new(PeerMetrics::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (network, a, b) = connected_pair().await;
        let me = a.local_peer_id();
        let hb = supervisor(a);

        assert!(hb.start(b.clone(), || async {}));
        assert!(!hb.start(b.clone(), || async {}));

        sleep(Duration::from_millis(1)).await;
        assert_eq!(network.ping_count(&me, &b), 1);
        sleep(INTERVAL).await;
        assert_eq!(network.ping_count(&me, &b), 2);
        sleep(INTERVAL).await;
        assert_eq!(network.ping_count(&me, &b), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_history_is_bounded_newest_first() {
        let (network, a, b) = connected_pair().await;
        let me = a.local_peer_id();
        let hb = supervisor(a);

        network.set_ping_latency(&me, &b, Duration::from_millis(1));
        hb.start(b.clone(), || async {});
        for ms in 2..=7 {
            sleep(TIMEOUT).await;
            network.set_ping_latency(&me, &b, Duration::from_millis(ms));
            sleep(TIMEOUT).await;
        }
        sleep(Duration::from_secs(1)).await;

        assert_eq!(hb.get_latency_data(&b), vec![7, 6, 5, 4, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_peer_callback_runs_once() {
        let (network, a, b) = connected_pair().await;
        let me = a.local_peer_id();
        let hb = supervisor(a);
        network.set_ping_unreachable(&me, &b, true);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        hb.start(b.clone(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(INTERVAL * 3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!hb.is_tracking(&b));
        assert!(hb.get_latency_data(&b).is_empty());
        // Two attempts in the single failing window.
        assert_eq!(network.ping_count(&me, &b), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_dropped_ping_is_tolerated() {
        let (network, a, b) = connected_pair().await;
        let me = a.local_peer_id();
        let hb = supervisor(a);
        network.set_ping_unreachable(&me, &b, true);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        hb.start(b.clone(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_secs(3)).await;
        network.set_ping_unreachable(&me, &b, false);
        sleep(INTERVAL * 2).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(hb.is_tracking(&b));
        assert!(!hb.get_latency_data(&b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_is_safe_when_untracked() {
        let (network, a, b) = connected_pair().await;
        let me = a.local_peer_id();
        let hb = supervisor(a);

        hb.stop(&b);
        hb.start(b.clone(), || async {});
        sleep(Duration::from_millis(1)).await;
        hb.stop(&b);
        assert!(!hb.is_tracking(&b));

        sleep(INTERVAL * 3).await;
        assert_eq!(network.ping_count(&me, &b), 1);

        assert!(hb.start(b.clone(), || async {}));
        assert_eq!(hb.tracked_peers(), vec![b.clone()]);
        hb.stop_all();
        assert!(hb.tracked_peers().is_empty());
    }
}
