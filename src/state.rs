//! Mining-state cache
//!
//! Holds the last mining state seen on the node and publishes a new state to
//! subscribers only when the chain height strictly increases. The publication
//! channel keeps the latest value, so late subscribers start from it.

use crate::client::NodeRpc;
use crate::{ChainHealth, Error, Height, MiningState, Result};
use futures::Stream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Retry bounds for one refresh cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshPolicy {
    /// Mining-state queries per refresh
    pub attempts: usize,
    /// Fixed spacing between attempts
    pub spacing: Duration,
    /// Consecutive failed refreshes before the state is reported stale
    pub stale_after: u32,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            spacing: Duration::from_millis(100),
            stale_after: 3,
        }
    }
}

/// Last known mining state plus its change broadcast
pub struct MiningStateCache {
    node: Arc<dyn NodeRpc>,
    policy: RefreshPolicy,
    state_tx: watch::Sender<Option<MiningState>>,
    health_tx: watch::Sender<ChainHealth>,
    consecutive_failures: AtomicU32,
}

impl MiningStateCache {
    /// Create an empty cache (cached height 0)
    pub fn new(node: Arc<dyn NodeRpc>, policy: RefreshPolicy) -> Self {
        let (state_tx, _) = watch::channel(None);
        let (health_tx, _) = watch::channel(ChainHealth::Live);

        Self {
            node,
            policy,
            state_tx,
            health_tx,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Query the node and publish the state if the height increased
    ///
    /// Returns the published state, `None` when the height did not increase,
    /// or `Error::NodeUnavailable` when every attempt failed.
    pub async fn refresh(&self) -> Result<Option<MiningState>> {
        let state = match self.query_with_retry().await {
            Ok(state) => {
                self.mark_live();
                state
            }
            Err(e) => {
                self.mark_failed();
                return Err(e);
            }
        };

        Ok(self.publish_if_higher(state))
    }

    /// Most recently published state
    pub fn current(&self) -> Option<MiningState> {
        self.state_tx.borrow().clone()
    }

    /// Cached height, 0 before anything was published
    pub fn height(&self) -> Height {
        self.state_tx.borrow().as_ref().map_or(0, |s| s.height)
    }

    /// Subscribe to height increases, starting from the latest published state
    pub fn subscribe(&self) -> MiningStateSubscription {
        MiningStateSubscription {
            rx: self.state_tx.subscribe(),
            replay: true,
        }
    }

    /// Watch the freshness of the cached state
    pub fn health(&self) -> watch::Receiver<ChainHealth> {
        self.health_tx.subscribe()
    }

    async fn query_with_retry(&self) -> Result<MiningState> {
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            match self.node.mining_info().await {
                Ok(state) => {
                    debug!("getmininginfo: block height {}", state.height);
                    return Ok(state);
                }
                Err(e) => {
                    warn!(
                        "RETRY - getmininginfo (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    if attempt < attempts {
                        sleep(self.policy.spacing).await;
                    }
                }
            }
        }

        Err(Error::NodeUnavailable { attempts })
    }

    fn publish_if_higher(&self, state: MiningState) -> Option<MiningState> {
        let height = state.height;
        let published = self.state_tx.send_if_modified(|current| {
            let cached = current.as_ref().map_or(0, |c| c.height);
            if height > cached {
                *current = Some(state.clone());
                true
            } else {
                false
            }
        });

        if published {
            info!("Block height change: {}", height);
            Some(state)
        } else {
            None
        }
    }

    fn mark_live(&self) {
        let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
        let recovered = self.health_tx.send_if_modified(|health| {
            if *health == ChainHealth::Live {
                false
            } else {
                *health = ChainHealth::Live;
                true
            }
        });
        if recovered {
            info!("Node reachable again after {} failed refreshes", failures);
        }
    }

    fn mark_failed(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.policy.stale_after {
            return;
        }

        let newly_stale = self.health_tx.send_if_modified(|health| {
            let was_live = *health == ChainHealth::Live;
            *health = ChainHealth::Stale {
                consecutive_failures: failures,
            };
            was_live
        });
        if newly_stale {
            error!(
                "Mining state is stale: {} consecutive refreshes failed to reach the node",
                failures
            );
        }
    }
}

/// Receiver side of the mining-state broadcast
///
/// The first call to [`next`](Self::next) yields the latest state if one was
/// already published; afterwards only newer states are delivered.
pub struct MiningStateSubscription {
    rx: watch::Receiver<Option<MiningState>>,
    replay: bool,
}

impl MiningStateSubscription {
    /// Wait for the next unseen state; `None` once the cache is gone
    pub async fn next(&mut self) -> Option<MiningState> {
        if self.replay {
            self.replay = false;
            let latest = self.rx.borrow_and_update().clone();
            if latest.is_some() {
                return latest;
            }
        }

        loop {
            self.rx.changed().await.ok()?;
            let latest = self.rx.borrow_and_update().clone();
            if latest.is_some() {
                return latest;
            }
        }
    }

    /// Whether `next` would return immediately
    pub fn has_pending(&self) -> bool {
        if self.replay && self.rx.borrow().is_some() {
            return true;
        }
        self.rx.has_changed().unwrap_or(false)
    }

    /// Turn the subscription into a stream of states
    pub fn into_stream(self) -> impl Stream<Item = MiningState> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|state| (state, sub))
        })
    }
}
