//! Provider seam between an endpoint and its RPC connection.
//!
//! Reads go through an alloy HTTP provider. The administrative reset is a
//! raw JSON-RPC POST because its payload is node-software specific
//! (`anvil_reset`, `hardhat_reset`, ...).

use crate::node::EndpointError;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::TransportError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// The read/admin surface one endpoint needs from its provider.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, EndpointError>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, EndpointError>;

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, EndpointError>;

    /// Re-point the node at a new upstream without recreating it.
    async fn reset_upstream(&self, upstream_url: &str) -> Result<(), EndpointError>;
}

/// `ChainClient` backed by alloy over HTTP.
pub struct AlloyChainClient {
    provider: DynProvider,
    rpc_url: String,
    reset_method: String,
    http: Client,
}

impl AlloyChainClient {
    pub async fn connect(rpc_url: &str, reset_method: &str) -> Result<Self, EndpointError> {
        let provider = ProviderBuilder::new()
            .connect(rpc_url)
            .await
            .map_err(map_transport_error)?
            .erased();

        Ok(Self {
            provider,
            rpc_url: rpc_url.to_string(),
            reset_method: reset_method.to_string(),
            http: Client::new(),
        })
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn block_number(&self) -> Result<u64, EndpointError> {
        self.provider
            .get_block_number()
            .await
            .map_err(map_transport_error)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, EndpointError> {
        let tx = TransactionRequest::default().with_to(to).with_input(data);
        self.provider.call(tx).await.map_err(map_transport_error)
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, EndpointError> {
        let value = self
            .provider
            .get_storage_at(address, U256::from_be_bytes(slot.0))
            .await
            .map_err(map_transport_error)?;
        Ok(B256::from(value.to_be_bytes::<32>()))
    }

    async fn reset_upstream(&self, upstream_url: &str) -> Result<(), EndpointError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": self.reset_method,
            "params": [{ "forking": { "jsonRpcUrl": upstream_url } }],
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EndpointError::Transport(format!("reset request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(EndpointError::Transport(format!(
                "reset returned status {}",
                resp.status()
            )));
        }

        let reply: JsonRpcReply = resp
            .json()
            .await
            .map_err(|e| EndpointError::Transport(format!("reset reply unreadable: {e}")))?;
        debug!(method = %self.reset_method, "reset reply received");
        reply.into_result()
    }
}

/// Minimal JSON-RPC reply envelope; only the error half matters for resets.
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcReply {
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

impl JsonRpcReply {
    pub(crate) fn into_result(self) -> Result<(), EndpointError> {
        match self.error {
            Some(err) => Err(EndpointError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(()),
        }
    }
}

fn map_transport_error(e: TransportError) -> EndpointError {
    match e.as_error_resp() {
        Some(payload) => EndpointError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
        None => EndpointError::Transport(e.to_string()),
    }
}
