//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use pool_node_coordinator::{
    client::NodeRpc,
    coordinator::CoordinatorConfig,
    utils::BackoffPolicy,
    Error, Height, MiningState, ProcessIdentity, Result, TemplateRequest,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

/// Node that serves a template for whatever height it is at
pub struct FakeNode {
    pub height: AtomicU64,
    pub template_calls: AtomicUsize,
    pub mining_calls: AtomicUsize,
    /// Template requests to fail before serving one
    pub failing_templates: AtomicUsize,
    /// Artificial latency of `getblocktemplate`
    pub fetch_delay: Duration,
    pub mining_down: std::sync::atomic::AtomicBool,
    pub submit_response: Mutex<Option<String>>,
}

impl FakeNode {
    pub fn at_height(height: Height) -> Self {
        Self {
            height: AtomicU64::new(height),
            template_calls: AtomicUsize::new(0),
            mining_calls: AtomicUsize::new(0),
            failing_templates: AtomicUsize::new(0),
            fetch_delay: Duration::from_millis(50),
            mining_down: std::sync::atomic::AtomicBool::new(false),
            submit_response: Mutex::new(None),
        }
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn advance(&self) -> Height {
        self.height.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn templates_fetched(&self) -> usize {
        self.template_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeRpc for FakeNode {
    async fn rpc_info(&self) -> Result<Value> {
        Ok(json!({"active_commands": [], "logpath": "/tmp/debug.log"}))
    }

    async fn mining_info(&self) -> Result<MiningState> {
        self.mining_calls.fetch_add(1, Ordering::SeqCst);
        if self.mining_down.load(Ordering::SeqCst) {
            return Err(Error::node("connection refused"));
        }
        Ok(MiningState::at_height(self.height.load(Ordering::SeqCst)))
    }

    async fn block_template(&self, request: &TemplateRequest) -> Result<Value> {
        assert_eq!(request, &TemplateRequest::default());
        self.template_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.fetch_delay).await;

        let failures_left = self.failing_templates.load(Ordering::SeqCst);
        if failures_left > 0 {
            self.failing_templates.store(failures_left - 1, Ordering::SeqCst);
            return Err(Error::rpc(-10, "Bitcoin Core is in initial sync"));
        }

        Ok(template_json(self.height.load(Ordering::SeqCst)))
    }

    async fn submit_block(&self, _block_hex: &str) -> Result<Option<String>> {
        Ok(self.submit_response.lock().unwrap().clone())
    }
}

/// Minimal `getblocktemplate` result for a height
pub fn template_json(height: Height) -> Value {
    json!({
        "version": 536870912,
        "height": height,
        "previousblockhash": format!("{:064x}", height - 1),
        "transactions": [
            {"data": "01000000", "txid": "aa", "fee": 150, "weight": 400, "depends": []},
            {"data": "02000000", "txid": "bb", "fee": 90, "weight": 560, "depends": [1]}
        ],
        "coinbasevalue": 312_500_000u64,
        "bits": "17034219",
        "target": "0000000000000000000342190000000000000000000000000000000000000000",
        "curtime": 1_700_000_000u64 + height,
    })
}

/// Short schedules so tests finish quickly
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        fetch_backoff: BackoffPolicy::fixed(Duration::from_millis(10))
            .with_give_up_after(Some(Duration::from_secs(5))),
        wait_backoff: BackoffPolicy::fixed(Duration::from_millis(10))
            .with_give_up_after(Some(Duration::from_secs(5))),
        lease_ttl: Some(Duration::from_secs(30)),
        ..CoordinatorConfig::default()
    }
}

pub fn instance(id: usize) -> ProcessIdentity {
    ProcessIdentity::new(id.to_string()).unwrap()
}
