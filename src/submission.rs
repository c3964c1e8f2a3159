//! Block submission gateway
//!
//! Forwards solved blocks to the node. Failures never propagate as errors:
//! every call ends in a [`SubmitOutcome`].

use crate::client::NodeRpc;
use crate::SubmitOutcome;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Hands solved blocks to the node
pub struct SubmissionGateway {
    node: Arc<dyn NodeRpc>,
}

impl SubmissionGateway {
    /// Create a gateway for the given node
    pub fn new(node: Arc<dyn NodeRpc>) -> Self {
        Self { node }
    }

    /// Submit a hex-serialized block
    #[instrument(skip(self, block_hex), fields(bytes = block_hex.len() / 2))]
    pub async fn submit(&self, block_hex: &str) -> SubmitOutcome {
        if let Err(e) = hex::decode(block_hex) {
            error!("BLOCK SUBMISSION REJECTED LOCALLY: invalid hex: {}", e);
            return SubmitOutcome::Rejected {
                reason: format!("invalid block hex: {}", e),
            };
        }

        let outcome = match self.node.submit_block(block_hex).await {
            Ok(None) => SubmitOutcome::Accepted,
            Ok(Some(reason)) if reason.is_empty() => SubmitOutcome::Accepted,
            Ok(Some(reason)) => SubmitOutcome::Rejected { reason },
            Err(e) => {
                error!("BLOCK SUBMISSION RESPONSE ERROR: {}", e);
                SubmitOutcome::Rejected {
                    reason: e.to_string(),
                }
            }
        };

        info!("BLOCK SUBMISSION RESPONSE: {}", outcome);
        debug!("submitted block: {}", block_hex);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNode;
    use crate::Error;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_null_response_is_success_marker() {
        let node = Arc::new(MockNode::default());
        node.push_submission(Ok(None));
        let gateway = SubmissionGateway::new(node);

        let outcome = gateway.submit("00ff").await;
        assert_eq!(outcome, SubmitOutcome::Accepted);
        assert_eq!(outcome.to_string(), SubmitOutcome::ACCEPTED_MARKER);
    }

    #[tokio::test]
    async fn test_empty_response_is_success() {
        let node = Arc::new(MockNode::default());
        node.push_submission(Ok(Some(String::new())));
        let gateway = SubmissionGateway::new(node);

        assert!(gateway.submit("00ff").await.is_accepted());
    }

    #[tokio::test]
    async fn test_rejection_reason_is_kept() {
        let node = Arc::new(MockNode::default());
        node.push_submission(Ok(Some("high-hash".to_string())));
        let gateway = SubmissionGateway::new(node);

        assert_eq!(
            gateway.submit("00ff").await,
            SubmitOutcome::Rejected {
                reason: "high-hash".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_node_fault_becomes_outcome() {
        let node = Arc::new(MockNode::default());
        node.push_submission(Err(Error::rpc(-22, "Block decode failed")));
        let gateway = SubmissionGateway::new(node);

        let outcome = gateway.submit("00ff").await;
        assert_eq!(outcome.to_string(), "RPC error -22: Block decode failed");
        assert!(!outcome.is_accepted());
    }

    #[tokio::test]
    async fn test_invalid_hex_never_reaches_node() {
        let node = Arc::new(MockNode::default());
        let gateway = SubmissionGateway::new(node.clone());

        let outcome = gateway.submit("not-hex").await;
        assert!(!outcome.is_accepted());
        assert_eq!(node.submit_calls.load(Ordering::SeqCst), 0);
    }
}
