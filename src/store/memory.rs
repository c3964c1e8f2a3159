//! In-process template store
//!
//! Backed by a `DashMap`; atomicity comes from the per-shard entry API. Only
//! suitable when a single process talks to the node.

use super::TemplateStore;
use crate::{Height, LockOutcome, ProcessIdentity, Result, TemplateRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Template store living in process memory
#[derive(Debug, Default)]
pub struct MemoryTemplateStore {
    records: DashMap<Height, TemplateRecord>,
}

impl MemoryTemplateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn owned_by(record: &TemplateRecord, owner: &ProcessIdentity) -> bool {
    record.payload.is_none() && record.owner.as_deref() == Some(owner.as_str())
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn get_record(&self, height: Height) -> Result<Option<TemplateRecord>> {
        Ok(self.records.get(&height).map(|r| r.value().clone()))
    }

    async fn create_lock(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome> {
        match self.records.entry(height) {
            Entry::Occupied(_) => Ok(LockOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(TemplateRecord::lease(height, owner, now));
                Ok(LockOutcome::Acquired)
            }
        }
    }

    async fn save_record(&self, height: Height, payload: &str) -> Result<bool> {
        match self.records.entry(height) {
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if record.payload.is_some() {
                    return Ok(false);
                }
                record.payload = Some(payload.to_string());
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(TemplateRecord::with_payload(height, payload));
                Ok(true)
            }
        }
    }

    async fn renew_lease(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.records.get_mut(&height) {
            Some(mut record) if owned_by(&record, owner) => {
                record.acquired_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn take_over_expired(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<LockOutcome> {
        match self.records.get_mut(&height) {
            Some(mut record) if record.lease_expired(expired_before) => {
                *record = TemplateRecord::lease(height, owner, now);
                Ok(LockOutcome::Acquired)
            }
            _ => Ok(LockOutcome::AlreadyExists),
        }
    }

    async fn release_lock(&self, height: Height, owner: &ProcessIdentity) -> Result<()> {
        self.records
            .remove_if(&height, |_, record| owned_by(record, owner));
        Ok(())
    }

    async fn prune_below(&self, height: Height) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|h, _| *h >= height);
        Ok(before.saturating_sub(self.records.len()))
    }
}
