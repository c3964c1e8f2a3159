//! Template coordinator
//!
//! Returns the block template for a height, fetching it from the node at most
//! once across every process sharing the template store:
//!
//! 1. a persisted payload is returned as is;
//! 2. otherwise the process tries to create the lease record for the height,
//!    and the winner fetches the template and persists it;
//! 3. everybody else polls the store until the payload appears.
//!
//! Leases carry an acquisition time. The holder renews it on every failed
//! fetch, and a waiter may take over a lease that has not been renewed for
//! longer than the configured TTL. A holder that exhausts its retry budget
//! releases the lease so another process can try.

use crate::client::NodeRpc;
use crate::store::TemplateStore;
use crate::utils::{lease_cutoff, BackoffPolicy};
use crate::{
    Error, Height, LockOutcome, ProcessIdentity, Result, TemplateRecord, TemplateRequest,
    WorkTemplate,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Tuning for fetch and wait loops
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Parameters sent with every template request
    pub request: TemplateRequest,
    /// Retry schedule of the lease holder's template fetch
    pub fetch_backoff: BackoffPolicy,
    /// Poll schedule of processes waiting for a persisted template
    pub wait_backoff: BackoffPolicy,
    /// Age after which an unrenewed lease may be taken over; `None` never expires
    pub lease_ttl: Option<Duration>,
    /// Heights kept in the store behind the chain tip; 0 keeps everything
    pub retain_heights: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request: TemplateRequest::default(),
            fetch_backoff: BackoffPolicy::default(),
            wait_backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier: 1.5,
                jitter: 0.1,
                give_up_after: Some(Duration::from_secs(600)),
            },
            lease_ttl: Some(Duration::from_secs(30)),
            retain_heights: 10,
        }
    }
}

/// Serves work templates by height
pub struct TemplateCoordinator {
    node: Arc<dyn NodeRpc>,
    store: Arc<dyn TemplateStore>,
    identity: Option<ProcessIdentity>,
    config: CoordinatorConfig,
}

impl TemplateCoordinator {
    /// Create a coordinator; without an identity no leases are taken
    pub fn new(
        node: Arc<dyn NodeRpc>,
        store: Arc<dyn TemplateStore>,
        identity: Option<ProcessIdentity>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            node,
            store,
            identity,
            config,
        }
    }

    /// Identity used for leases
    pub fn identity(&self) -> Option<&ProcessIdentity> {
        self.identity.as_ref()
    }

    /// Get the work template for `height`
    #[instrument(skip(self))]
    pub async fn get_template(&self, height: Height) -> Result<WorkTemplate> {
        let payload = self.get_payload(height).await?;
        let template = WorkTemplate::from_payload(&payload)?;
        info!("getblocktemplate tx count: {}", template.transactions.len());
        Ok(template)
    }

    /// Drop stored templates that fell out of the retention window behind `tip`
    pub async fn prune(&self, tip: Height) -> Result<usize> {
        if self.config.retain_heights == 0 {
            return Ok(0);
        }

        let keep_from = tip.saturating_sub(self.config.retain_heights - 1);
        let removed = self.store.prune_below(keep_from).await?;
        if removed > 0 {
            debug!("Pruned {} template records below height {}", removed, keep_from);
        }
        Ok(removed)
    }

    /// Get the persisted template payload for `height`, exactly as stored
    pub async fn get_payload(&self, height: Height) -> Result<String> {
        loop {
            match self.store.get_record(height).await? {
                Some(TemplateRecord {
                    payload: Some(payload),
                    ..
                }) => return Ok(payload),
                Some(_) => {
                    if let Some(payload) = self.wait_for_payload(height).await? {
                        return Ok(payload);
                    }
                }
                None => match &self.identity {
                    None => {
                        if let Some(payload) = self.fetch_and_persist(height, None).await? {
                            return Ok(payload);
                        }
                    }
                    Some(identity) => {
                        match self.store.create_lock(height, identity, Utc::now()).await? {
                            LockOutcome::Acquired => {
                                info!("Acquired template lease for height {}", height);
                                if let Some(payload) =
                                    self.fetch_and_persist(height, Some(identity)).await?
                                {
                                    return Ok(payload);
                                }
                            }
                            LockOutcome::AlreadyExists => {
                                debug!("Template lease for height {} held elsewhere", height);
                                if let Some(payload) = self.wait_for_payload(height).await? {
                                    return Ok(payload);
                                }
                            }
                        }
                    }
                },
            }
        }
    }

    /// Poll the store until the payload shows up
    ///
    /// Returns `None` when the record disappeared (its holder gave up), in
    /// which case the caller contends for the lease again.
    async fn wait_for_payload(&self, height: Height) -> Result<Option<String>> {
        let mut backoff = self.config.wait_backoff.start();

        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(Error::gave_up(
                    format!("waiting for template at height {}", height),
                    backoff.elapsed(),
                ));
            };
            sleep(delay).await;

            let record = match self.store.get_record(height).await? {
                None => {
                    warn!("Template lease for height {} released without a template", height);
                    return Ok(None);
                }
                Some(record) => record,
            };

            if let Some(payload) = record.payload {
                debug!("Template for height {} appeared after {:?}", height, backoff.elapsed());
                return Ok(Some(payload));
            }

            if let Some(payload) = self.try_take_over(&record).await? {
                return Ok(Some(payload));
            }

            debug!(
                "Still waiting for template at height {} (poll {})",
                height,
                backoff.attempt()
            );
        }
    }

    /// Take over an expired lease and fetch the template ourselves
    async fn try_take_over(&self, record: &TemplateRecord) -> Result<Option<String>> {
        let (Some(identity), Some(ttl)) = (&self.identity, self.config.lease_ttl) else {
            return Ok(None);
        };

        let now = Utc::now();
        let cutoff = lease_cutoff(now, ttl);
        if !record.lease_expired(cutoff) {
            return Ok(None);
        }

        match self
            .store
            .take_over_expired(record.height, identity, now, cutoff)
            .await?
        {
            LockOutcome::Acquired => {
                warn!(
                    "Took over expired template lease for height {} from {}",
                    record.height,
                    record.owner.as_deref().unwrap_or("unknown")
                );
                self.fetch_and_persist(record.height, Some(identity)).await
            }
            LockOutcome::AlreadyExists => Ok(None),
        }
    }

    /// Fetch from the node until a template is persisted
    ///
    /// Returns `None` when `owner`'s lease was taken over between attempts;
    /// the new holder fetches and this process goes back to waiting.
    async fn fetch_and_persist(
        &self,
        height: Height,
        owner: Option<&ProcessIdentity>,
    ) -> Result<Option<String>> {
        let mut backoff = self.config.fetch_backoff.start();

        loop {
            let error = match self.fetch_once(height).await {
                Ok(payload) => return Ok(Some(payload)),
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                error!(
                    "Giving up on getblocktemplate for height {} after {} attempts: {}",
                    height,
                    backoff.attempt() + 1,
                    error
                );
                if let Some(owner) = owner {
                    if let Err(e) = self.store.release_lock(height, owner).await {
                        warn!("Failed to release template lease for height {}: {}", height, e);
                    }
                }
                return Err(Error::gave_up(
                    format!("getblocktemplate for height {}", height),
                    backoff.elapsed(),
                ));
            };

            if error.is_retryable() {
                warn!(
                    "RETRY - getblocktemplate (height {}, attempt {}, next in {:?}): {}",
                    height,
                    backoff.attempt(),
                    delay,
                    error
                );
            } else {
                error!(
                    "RETRY - getblocktemplate (height {}, attempt {}, next in {:?}) after {} error: {}",
                    height,
                    backoff.attempt(),
                    delay,
                    error.category(),
                    error
                );
            }

            if let Some(owner) = owner {
                match self.store.renew_lease(height, owner, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            "Template lease for height {} was taken over, waiting for the new holder",
                            height
                        );
                        return Ok(None);
                    }
                    Err(e) => warn!("Failed to renew template lease for height {}: {}", height, e),
                }
            }

            sleep(delay).await;
        }
    }

    /// One fetch-and-persist attempt
    async fn fetch_once(&self, height: Height) -> Result<String> {
        let raw = self.node.block_template(&self.config.request).await?;
        let template: WorkTemplate = serde_json::from_value(raw.clone())?;
        if template.height != height {
            debug!(
                "Template for coordination height {} reports height {}",
                height, template.height
            );
        }

        let payload = serde_json::to_string(&raw)?;
        if self.store.save_record(height, &payload).await? {
            info!("Persisted template for height {}", height);
            return Ok(payload);
        }

        // someone else persisted first; their payload is authoritative
        match self.store.get_record(height).await? {
            Some(TemplateRecord {
                payload: Some(existing),
                ..
            }) => Ok(existing),
            _ => Err(Error::invalid_state(format!(
                "template for height {} was neither saved nor found",
                height
            ))),
        }
    }
}
