//! Chain-change notifier
//!
//! Decides *when* to re-read the node's mining state: on every block
//! announcement pushed by the node, or on a fixed timer when no push endpoint
//! is configured. Whether the chain actually moved is decided by the
//! [`MiningStateCache`].

use crate::state::MiningStateCache;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub mod zmq;

/// Delay between block announcement reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Events produced by a block announcement transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// Subscription (re)established
    Connected,
    /// Connecting failed or the connection dropped; another attempt follows
    Retrying { error: String },
    /// The node announced a new block
    Block,
}

/// Change detection strategy, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierMode {
    /// Subscribe to the node's block announcements
    Push { endpoint: String },
    /// Re-read the mining state on a fixed interval
    Poll { interval: Duration },
}

impl fmt::Display for NotifierMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifierMode::Push { endpoint } => write!(f, "push ({})", endpoint),
            NotifierMode::Poll { interval } => write!(f, "poll (every {:?})", interval),
        }
    }
}

/// Drives mining-state refreshes for the lifetime of the process
pub struct ChainChangeNotifier {
    cache: Arc<MiningStateCache>,
    mode: NotifierMode,
}

impl ChainChangeNotifier {
    /// Create a notifier for the given cache
    pub fn new(cache: Arc<MiningStateCache>, mode: NotifierMode) -> Self {
        Self { cache, mode }
    }

    /// Active mode
    pub fn mode(&self) -> &NotifierMode {
        &self.mode
    }

    /// Run forever; a push transport that ends is started again
    pub async fn run(self) {
        info!("Chain-change notifier running in {} mode", self.mode);

        match &self.mode {
            NotifierMode::Push { endpoint } => loop {
                let announcements = zmq::block_announcements(endpoint.clone(), RECONNECT_DELAY);
                run_push(&self.cache, announcements).await;
                tokio::time::sleep(RECONNECT_DELAY).await;
            },
            NotifierMode::Poll { interval } => run_poll(&self.cache, *interval).await,
        }
    }
}

/// Refresh once, then on every block announcement
///
/// A reconnect after a failure refreshes as well, since blocks announced
/// while disconnected were missed.
pub async fn run_push<S>(cache: &MiningStateCache, announcements: S)
where
    S: Stream<Item = Announcement>,
{
    futures::pin_mut!(announcements);

    refresh(cache).await;
    let mut disconnected = false;

    while let Some(announcement) = announcements.next().await {
        match announcement {
            Announcement::Connected => {
                info!("ZMQ connected");
                if std::mem::take(&mut disconnected) {
                    refresh(cache).await;
                }
            }
            Announcement::Retrying { error } => {
                disconnected = true;
                warn!("ZMQ unable to connect, retrying: {}", error)
            }
            Announcement::Block => {
                debug!("New block announced");
                refresh(cache).await;
            }
        }
    }

    warn!("Block announcement stream ended");
}

/// Refresh on a fixed interval, forever
pub async fn run_poll(cache: &MiningStateCache, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        refresh(cache).await;
    }
}

async fn refresh(cache: &MiningStateCache) {
    if let Err(e) = cache.refresh().await {
        warn!("Mining state refresh produced no update: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNode;
    use crate::state::RefreshPolicy;
    use std::sync::atomic::Ordering;

    fn quick_policy() -> RefreshPolicy {
        RefreshPolicy {
            attempts: 1,
            spacing: Duration::from_millis(1),
            stale_after: 3,
        }
    }

    #[tokio::test]
    async fn test_push_refreshes_on_each_block_only() {
        let node = Arc::new(MockNode::default());
        for h in [1, 1, 1, 2] {
            node.push_height(h);
        }
        let cache = MiningStateCache::new(node.clone(), quick_policy());

        let announcements = futures::stream::iter(vec![
            Announcement::Retrying {
                error: "connection refused".to_string(),
            },
            Announcement::Connected,
            Announcement::Block,
            Announcement::Block,
        ]);
        run_push(&cache, announcements).await;

        // initial refresh, one after reconnecting, one per block
        assert_eq!(node.mining_calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.height(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_picks_up_missed_block() {
        let node = Arc::new(MockNode::default());
        node.push_height(10);
        node.push_height(11);
        let cache = MiningStateCache::new(node.clone(), quick_policy());

        // block 11 was announced while the link was down
        let announcements = futures::stream::iter(vec![
            Announcement::Connected,
            Announcement::Retrying {
                error: "connection lost".to_string(),
            },
            Announcement::Connected,
        ]);
        run_push(&cache, announcements).await;

        assert_eq!(cache.height(), 11);
        assert_eq!(node.mining_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_push_survives_refresh_failures() {
        let node = Arc::new(MockNode::default());
        node.push_mining_error();
        node.push_height(7);
        let cache = MiningStateCache::new(node.clone(), quick_policy());

        run_push(&cache, futures::stream::iter(vec![Announcement::Block])).await;
        assert_eq!(cache.height(), 7);
    }

    #[tokio::test]
    async fn test_poll_refreshes_on_timer() {
        let node = Arc::new(MockNode::default());
        for h in 1..=20 {
            node.push_height(h);
        }
        let cache = MiningStateCache::new(node.clone(), quick_policy());

        let _ = tokio::time::timeout(
            Duration::from_millis(55),
            run_poll(&cache, Duration::from_millis(10)),
        )
        .await;

        assert!(cache.height() >= 2);
        assert!(cache.height() as usize <= node.mining_calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mode_display() {
        let push = NotifierMode::Push {
            endpoint: "tcp://127.0.0.1:28332".to_string(),
        };
        assert_eq!(push.to_string(), "push (tcp://127.0.0.1:28332)");
    }
}
