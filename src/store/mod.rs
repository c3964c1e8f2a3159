//! Shared template store
//!
//! Persisted template records keyed by height. The height is a uniqueness key:
//! creating a record is the cross-process mutual exclusion primitive for
//! template fetches.

use crate::{Height, LockOutcome, ProcessIdentity, Result, TemplateRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTemplateStore;
pub use sqlite::SqliteTemplateStore;

/// Persistence contract for template records
///
/// Implementations must make `create_lock` and `take_over_expired` atomic
/// across every process sharing the store, and must never overwrite a
/// non-null payload.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Read the record for a height
    async fn get_record(&self, height: Height) -> Result<Option<TemplateRecord>>;

    /// Create a lease record for a height; fails if any record exists
    async fn create_lock(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome>;

    /// Persist a payload, creating the record if needed
    ///
    /// Returns `false` when a payload was already present and left untouched.
    async fn save_record(&self, height: Height, payload: &str) -> Result<bool>;

    /// Refresh the acquisition time of a lease still held by `owner`
    async fn renew_lease(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Claim a lease acquired before `expired_before`
    async fn take_over_expired(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<LockOutcome>;

    /// Drop a payload-less lease held by `owner`
    async fn release_lock(&self, height: Height, owner: &ProcessIdentity) -> Result<()>;

    /// Delete every record below `height`, returning how many were removed
    async fn prune_below(&self, height: Height) -> Result<usize>;
}
