//! Core types for node coordination
//!
//! Mining state readings, work templates, persisted template records and the
//! outcomes the coordination layer hands back to its callers.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Chain height, the coordination key for templates
pub type Height = u64;

/// Node-reported mining state (`getmininginfo`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningState {
    /// Height of the most-work fully validated chain
    #[serde(rename = "blocks")]
    pub height: Height,
    /// Current network difficulty
    #[serde(default)]
    pub difficulty: f64,
    /// Estimated network hashes per second
    #[serde(rename = "networkhashps", default)]
    pub network_hash_ps: f64,
    /// Transactions in the node's mempool
    #[serde(rename = "pooledtx", default)]
    pub pooled_tx: u64,
    /// Chain name (main, test, signet, regtest)
    #[serde(default)]
    pub chain: String,
    /// Remaining node-supplied fields
    #[serde(flatten)]
    pub other: HashMap<String, serde_json::Value>,
}

impl MiningState {
    /// Build a bare state for a height, mostly useful in tests
    pub fn at_height(height: Height) -> Self {
        Self {
            height,
            difficulty: 0.0,
            network_hash_ps: 0.0,
            pooled_tx: 0,
            chain: String::new(),
            other: HashMap::new(),
        }
    }
}

/// Candidate transaction inside a work template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction, hex encoded
    pub data: String,
    pub txid: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: Option<u64>,
    #[serde(default)]
    pub weight: Option<u64>,
    #[serde(default)]
    pub depends: Vec<u32>,
}

/// Node-constructed block template (`getblocktemplate`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkTemplate {
    pub height: Height,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub transactions: Vec<TemplateTransaction>,
    #[serde(rename = "coinbasevalue", default)]
    pub coinbase_value: u64,
    #[serde(default)]
    pub bits: String,
    #[serde(default)]
    pub target: String,
    #[serde(rename = "curtime", default)]
    pub cur_time: u64,
    #[serde(flatten)]
    pub other: HashMap<String, serde_json::Value>,
}

impl WorkTemplate {
    /// Parse a template from its persisted payload
    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(Error::from)
    }
}

/// Parameters of a `getblocktemplate` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub rules: Vec<String>,
    pub mode: String,
    pub capabilities: Vec<String>,
}

impl Default for TemplateRequest {
    fn default() -> Self {
        Self {
            rules: vec!["segwit".to_string()],
            mode: "template".to_string(),
            capabilities: vec!["serverlist".to_string(), "proposal".to_string()],
        }
    }
}

/// Identifier of a cooperating pool-server process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity(String);

impl ProcessIdentity {
    /// Create a process identity, rejecting blank identifiers
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::config("Process identity cannot be empty"));
        }
        Ok(Self(id))
    }

    /// Get identity as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted template state for one height
///
/// A record without payload but with an owner is a fetch lease held by that
/// owner since `acquired_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    pub height: Height,
    pub payload: Option<String>,
    pub owner: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl TemplateRecord {
    /// Record holding a fetch lease
    pub fn lease(height: Height, owner: &ProcessIdentity, acquired_at: DateTime<Utc>) -> Self {
        Self {
            height,
            payload: None,
            owner: Some(owner.as_str().to_string()),
            acquired_at: Some(acquired_at),
        }
    }

    /// Record holding a persisted template
    pub fn with_payload(height: Height, payload: impl Into<String>) -> Self {
        Self {
            height,
            payload: Some(payload.into()),
            owner: None,
            acquired_at: None,
        }
    }

    /// Whether this record is a lease older than `expired_before`
    pub fn lease_expired(&self, expired_before: DateTime<Utc>) -> bool {
        self.payload.is_none() && self.acquired_at.is_some_and(|at| at < expired_before)
    }
}

/// Result of trying to acquire a fetch lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// This process now owns the lease
    Acquired,
    /// A record for the height already exists
    AlreadyExists,
}

/// Outcome of a block submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Node accepted the block
    Accepted,
    /// Node rejected the block, or the call itself failed
    Rejected { reason: String },
}

impl SubmitOutcome {
    /// Marker rendered for accepted blocks
    pub const ACCEPTED_MARKER: &'static str = "SUCCESS!";

    /// Check if the block was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOutcome::Accepted => write!(f, "{}", Self::ACCEPTED_MARKER),
            SubmitOutcome::Rejected { reason } => write!(f, "{}", reason),
        }
    }
}

/// Freshness of the cached mining state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainHealth {
    /// Last refresh reached the node
    Live,
    /// Several consecutive refreshes failed to reach the node
    Stale { consecutive_failures: u32 },
}
