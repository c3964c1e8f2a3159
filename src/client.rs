//! Node client for mining operations
//!
//! Talks JSON-RPC over HTTP to the full node: health check, mining state,
//! block templates and block submission.

use crate::{Error, MiningState, Result, TemplateRequest};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// Remote calls the coordination layer issues against the node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Cheap reachability check (`getrpcinfo`)
    async fn rpc_info(&self) -> Result<Value>;

    /// Current mining state (`getmininginfo`)
    async fn mining_info(&self) -> Result<MiningState>;

    /// Raw block template as returned by the node (`getblocktemplate`)
    async fn block_template(&self, request: &TemplateRequest) -> Result<Value>;

    /// Submit a serialized block; `None` means accepted, `Some(reason)` rejected
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>>;
}

/// Node connection settings
#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    pub url: Url,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC client for bitcoind-compatible nodes
pub struct BitcoinRpcClient {
    client: Client,
    endpoint: RpcEndpoint,
}

impl BitcoinRpcClient {
    /// Create a new node client
    pub fn new(endpoint: RpcEndpoint) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(endpoint.timeout)
            .build()
            .map_err(Error::from)?;

        Ok(Self { client, endpoint })
    }

    /// Endpoint this client talks to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint.url
    }

    /// Issue one JSON-RPC call and decode its result
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: uuid::Uuid::new_v4().to_string(),
            method,
            params,
        };

        let mut builder = self.client.post(self.endpoint.url.clone()).json(&request);
        if let Some(user) = &self.endpoint.user {
            builder = builder.basic_auth(user, self.endpoint.password.as_ref());
        }

        let response = builder.send().await.map_err(Error::from)?;
        let status = response.status();
        let body = response.text().await.map_err(Error::from)?;

        debug!("{} -> HTTP {} ({} bytes)", method, status, body.len());

        // bitcoind answers RPC errors with HTTP 500 and a JSON body
        let parsed: RpcResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) => {
                if status == reqwest::StatusCode::UNAUTHORIZED {
                    return Err(Error::node(format!(
                        "{} rejected: HTTP {} (check RPC user/password)",
                        method, status
                    )));
                }
                return Err(Error::node(format!("{} failed: HTTP {}", method, status)));
            }
        };

        if let Some(error) = parsed.error {
            return Err(Error::rpc(error.code, error.message));
        }

        serde_json::from_value(parsed.result).map_err(Error::from)
    }
}

#[async_trait]
impl NodeRpc for BitcoinRpcClient {
    #[instrument(skip(self))]
    async fn rpc_info(&self) -> Result<Value> {
        self.call("getrpcinfo", json!([])).await
    }

    #[instrument(skip(self))]
    async fn mining_info(&self) -> Result<MiningState> {
        self.call("getmininginfo", json!([])).await
    }

    #[instrument(skip(self))]
    async fn block_template(&self, request: &TemplateRequest) -> Result<Value> {
        let template: Value = self.call("getblocktemplate", json!([request])).await?;
        if !template.is_object() {
            return Err(Error::node("getblocktemplate returned a non-object result"));
        }
        Ok(template)
    }

    #[instrument(skip(self, block_hex), fields(bytes = block_hex.len() / 2))]
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>> {
        self.call("submitblock", json!([block_hex])).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> RpcEndpoint {
        RpcEndpoint {
            url: Url::parse("http://127.0.0.1:8332").unwrap(),
            user: Some("pool".to_string()),
            password: Some("secret".to_string()),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_client_creation() {
        let client = BitcoinRpcClient::new(endpoint()).unwrap();
        assert_eq!(client.endpoint().port(), Some(8332));
    }

    #[test]
    fn test_request_envelope() {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: "1".to_string(),
            method: "getblocktemplate",
            params: json!([TemplateRequest::default()]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "getblocktemplate");
        assert_eq!(value["params"][0]["rules"][0], "segwit");
        assert_eq!(value["params"][0]["capabilities"][1], "proposal");
    }

    #[test]
    fn test_response_decoding() {
        let ok: RpcResponse = serde_json::from_str(r#"{"result":null,"error":null,"id":"1"}"#).unwrap();
        assert!(ok.error.is_none());
        let accepted: Option<String> = serde_json::from_value(ok.result).unwrap();
        assert_eq!(accepted, None);

        let err: RpcResponse = serde_json::from_str(
            r#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":"1"}"#,
        )
        .unwrap();
        let error = err.error.unwrap();
        assert_eq!(error.code, -28);
        assert_eq!(error.message, "Loading block index...");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_retryable() {
        let client = BitcoinRpcClient::new(RpcEndpoint {
            url: Url::parse("http://127.0.0.1:1").unwrap(),
            user: None,
            password: None,
            timeout: Duration::from_millis(500),
        })
        .unwrap();

        let err = client.mining_info().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
