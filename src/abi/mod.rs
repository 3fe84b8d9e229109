//! Contract ABI lookup.
//!
//! Rules need an ABI to encode view calls. `ExplorerAbiCache` fetches ABIs
//! from an Etherscan-compatible API once per address and keeps them for the
//! life of the process. `StaticAbiRepository` serves ABIs inlined in config.

use crate::config::AbiConfig;
use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AbiError {
    #[error("no ABI known for {0}")]
    NotFound(Address),
    #[error("explorer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("explorer returned status {0}")]
    Status(u16),
    #[error("explorer rejected lookup for {address}: {message}")]
    Explorer { address: Address, message: String },
    #[error("invalid ABI JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid address {0:?} in ABI config")]
    Address(String),
}

#[async_trait]
pub trait AbiRepository: Send + Sync {
    /// ABI JSON string for the contract at `address`.
    async fn abi_by_address(&self, address: Address) -> Result<String, AbiError>;
}

/// Parse an ABI JSON string.
pub fn parse_abi(json: &str) -> Result<JsonAbi, AbiError> {
    Ok(serde_json::from_str(json)?)
}

/// Fixed address → ABI map. Addresses are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticAbiRepository {
    abis: HashMap<Address, String>,
}

impl StaticAbiRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: Address, abi: impl Into<String>) -> Self {
        self.abis.insert(address, abi.into());
        self
    }

    pub fn from_config(config: &AbiConfig) -> Result<Self, AbiError> {
        let mut repo = Self::new();
        for (raw, abi) in &config.inline {
            let address =
                Address::from_str(raw.trim()).map_err(|_| AbiError::Address(raw.clone()))?;
            // Reject broken JSON at load time, not on first use.
            parse_abi(abi)?;
            repo.abis.insert(address, abi.clone());
        }
        Ok(repo)
    }

    pub fn len(&self) -> usize {
        self.abis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abis.is_empty()
    }
}

#[async_trait]
impl AbiRepository for StaticAbiRepository {
    async fn abi_by_address(&self, address: Address) -> Result<String, AbiError> {
        self.abis
            .get(&address)
            .cloned()
            .ok_or(AbiError::NotFound(address))
    }
}

/// Etherscan `getabi` response envelope.
#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: String,
}

/// Cache-aside ABI lookup over a block-explorer API.
#[derive(Clone)]
pub struct ExplorerAbiCache {
    /// address → ABI JSON
    by_address: Arc<DashMap<Address, String>>,
    base_url: String,
    api_key: String,
    http: Client,
}

impl ExplorerAbiCache {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, AbiError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            by_address: Arc::new(DashMap::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Build from config, pre-seeding the cache with any inline ABIs.
    pub fn from_config(config: &AbiConfig) -> Result<Self, AbiError> {
        let cache = Self::new(config.explorer_url.clone(), config.explorer_api_key.clone())?;
        let seeded = StaticAbiRepository::from_config(config)?;
        for (address, abi) in seeded.abis {
            cache.insert(address, abi);
        }
        info!(seeded = cache.len(), "abi cache initialised");
        Ok(cache)
    }

    pub fn insert(&self, address: Address, abi: String) {
        self.by_address.insert(address, abi);
    }

    pub fn get(&self, address: &Address) -> Option<String> {
        self.by_address.get(address).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    fn lookup_url(&self, address: Address) -> String {
        let mut url = format!(
            "{}?module=contract&action=getabi&address={}",
            self.base_url,
            address.to_checksum(None)
        );
        if !self.api_key.is_empty() {
            url.push_str("&apikey=");
            url.push_str(&self.api_key);
        }
        url
    }

    async fn fetch(&self, address: Address) -> Result<String, AbiError> {
        let resp = self.http.get(self.lookup_url(address)).send().await?;
        if !resp.status().is_success() {
            return Err(AbiError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        parse_explorer_response(address, &body)
    }
}

#[async_trait]
impl AbiRepository for ExplorerAbiCache {
    async fn abi_by_address(&self, address: Address) -> Result<String, AbiError> {
        if let Some(abi) = self.get(&address) {
            return Ok(abi);
        }
        if self.base_url.is_empty() {
            return Err(AbiError::NotFound(address));
        }

        let abi = self.fetch(address).await?;
        self.insert(address, abi.clone());
        debug!(address = %address, cached = self.len(), "abi fetched from explorer");
        Ok(abi)
    }
}

/// Pull the ABI string out of a `getabi` response, checking it parses.
fn parse_explorer_response(address: Address, body: &str) -> Result<String, AbiError> {
    let parsed: ExplorerResponse = serde_json::from_str(body)?;
    if parsed.status != "1" {
        let message = if parsed.result.is_empty() {
            parsed.message
        } else {
            parsed.result
        };
        return Err(AbiError::Explorer { address, message });
    }
    parse_abi(&parsed.result)?;
    Ok(parsed.result)
}
