//! Quorum reads over a fixed fleet of endpoints.
//!
//! Every logical read fans out to all endpoints at once. Individual
//! endpoint failures are dropped; the reader only fails when no endpoint
//! answered. Answers are reconciled by freshness: the result paired with
//! the highest observed block wins, ties go to the earlier endpoint in fleet
//! order. This is not a vote.

use crate::node::{EndpointError, NodeEndpoint, ProxyInfo};
use alloy::dyn_abi::DynSolValue;
use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("all nodes failed to retrieve block number")]
    BlockNumber,
    #[error("all nodes failed to call {method} on {address}")]
    ViewCall { address: Address, method: String },
    #[error("all nodes failed to retrieve proxy info for {0}")]
    ProxyInfo(Address),
    #[error("fleet must contain at least one endpoint")]
    EmptyFleet,
}

/// Ordered, fixed membership set of endpoints. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Fleet {
    endpoints: Arc<[Arc<NodeEndpoint>]>,
}

impl Fleet {
    pub fn new(endpoints: Vec<Arc<NodeEndpoint>>) -> Result<Self, ReaderError> {
        if endpoints.is_empty() {
            return Err(ReaderError::EmptyFleet);
        }
        Ok(Self {
            endpoints: endpoints.into(),
        })
    }

    pub fn endpoints(&self) -> &[Arc<NodeEndpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }
}

/// One endpoint's contribution to a quorum read. Built fresh per call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome<T> {
    pub endpoint_index: usize,
    pub value: Option<T>,
    pub observed_block_number: Option<u64>,
}

impl<T> ReadOutcome<T> {
    /// Pair an endpoint's value with its own block number; either half
    /// failing leaves that half absent.
    pub fn from_results(
        endpoint_index: usize,
        value: Result<T, EndpointError>,
        block: Result<u64, EndpointError>,
    ) -> Self {
        Self {
            endpoint_index,
            value: value.ok(),
            observed_block_number: block.ok(),
        }
    }
}

/// Keep only complete outcomes and return the freshest one.
///
/// Strictly-greater comparison keeps the first endpoint on ties, so the
/// choice is deterministic for a given set of responses.
pub fn select_freshest<T>(outcomes: Vec<ReadOutcome<T>>) -> Option<(usize, T, u64)> {
    let mut best: Option<(usize, T, u64)> = None;
    for outcome in outcomes {
        let (Some(value), Some(block)) = (outcome.value, outcome.observed_block_number) else {
            continue;
        };
        let fresher = match &best {
            None => true,
            Some((best_index, _, best_block)) => {
                block > *best_block || (block == *best_block && outcome.endpoint_index < *best_index)
            }
        };
        if fresher {
            best = Some((outcome.endpoint_index, value, block));
        }
    }
    best
}

/// Presents one logical view of the chain backed by the whole fleet.
pub struct QuorumReader {
    fleet: Fleet,
    /// Managed endpoints are re-pointed here on first start. Empty = skip.
    fork_url: RwLock<String>,
    started: OnceCell<()>,
}

impl QuorumReader {
    /// Construction is cheap; the fleet is started on first use.
    pub fn new(fleet: Fleet) -> Self {
        Self {
            fleet,
            fork_url: RwLock::new(String::new()),
            started: OnceCell::new(),
        }
    }

    pub fn with_fork_url(self, fork_url: impl Into<String>) -> Self {
        Self {
            fork_url: RwLock::new(fork_url.into()),
            ..self
        }
    }

    /// Point managed endpoints at a new upstream. Before the fleet has
    /// started this only records the URL for the lazy start; afterwards the
    /// managed endpoints are reset concurrently. Reset failures are logged
    /// and leave that endpoint unhealthy.
    pub async fn repoint_fork(&self, fork_url: &str) {
        *self.fork_url.write().await = fork_url.to_string();
        if !self.is_started() {
            debug!(fork_url = %fork_url, "fleet not started yet, fork URL recorded");
            return;
        }

        info!(fork_url = %fork_url, "resetting managed nodes to new fork URL");
        let resets = self
            .fleet
            .endpoints()
            .iter()
            .filter(|ep| ep.role().is_managed())
            .map(|ep| async move {
                if let Err(e) = ep.reset_node(fork_url).await {
                    warn!(endpoint = %ep.get_node_name(), error = %e, "node reset failed");
                }
            });
        join_all(resets).await;
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Highest block number any endpoint reports.
    pub async fn get_block_number(&self) -> Result<u64, ReaderError> {
        self.ensure_started().await;

        let results = join_all(self.fleet.endpoints().iter().map(|ep| ep.get_block_number())).await;

        let best = results
            .into_iter()
            .zip(self.fleet.endpoints())
            .filter_map(|(result, ep)| match result {
                Ok(block) => Some(block),
                Err(e) => {
                    debug!(endpoint = %ep.get_node_name(), error = %e, "block number read failed");
                    None
                }
            })
            .max();

        best.ok_or(ReaderError::BlockNumber)
    }

    /// Call a view function on every endpoint and return the result from the
    /// endpoint that observed the freshest block.
    pub async fn call_view_function(
        &self,
        address: Address,
        abi: &JsonAbi,
        method: &str,
        params: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>, ReaderError> {
        self.ensure_started().await;

        let reads = self.fleet.endpoints().iter().enumerate().map(|(index, ep)| async move {
            let (value, block) = futures::join!(
                ep.call_view_function(address, abi, method, params),
                ep.get_block_number(),
            );
            if let Err(e) = &value {
                debug!(endpoint = %ep.get_node_name(), method = %method, error = %e, "view call failed");
            }
            ReadOutcome::from_results(index, value, block)
        });
        let outcomes = join_all(reads).await;

        match select_freshest(outcomes) {
            Some((index, value, block)) => {
                debug!(
                    endpoint = %self.fleet.endpoints()[index].get_node_name(),
                    block,
                    method = %method,
                    "quorum read resolved"
                );
                Ok(value)
            }
            None => {
                warn!(address = %address, method = %method, "all nodes failed view call");
                Err(ReaderError::ViewCall {
                    address,
                    method: method.to_string(),
                })
            }
        }
    }

    /// First successful proxy answer in fleet order. Proxy wiring rarely
    /// changes, so freshness is not compared.
    pub async fn get_proxy_info_for_address(&self, address: Address) -> Result<ProxyInfo, ReaderError> {
        self.ensure_started().await;

        let results = join_all(
            self.fleet
                .endpoints()
                .iter()
                .map(|ep| ep.get_proxy_info_for_address(address)),
        )
        .await;

        for (result, ep) in results.into_iter().zip(self.fleet.endpoints()) {
            match result {
                Ok(info) => return Ok(info),
                Err(e) => {
                    debug!(endpoint = %ep.get_node_name(), error = %e, "proxy info read failed");
                }
            }
        }
        Err(ReaderError::ProxyInfo(address))
    }

    async fn ensure_started(&self) {
        self.started.get_or_init(|| self.start_fleet()).await;
    }

    // A start failure leaves that endpoint unhealthy for the health monitor;
    // it never fails the read that triggered it.
    async fn start_fleet(&self) {
        info!(endpoints = self.fleet.len(), "starting node fleet");
        let fork_url = self.fork_url.read().await.clone();
        let fork_url = fork_url.as_str();
        let starts = self.fleet.endpoints().iter().map(|ep| async move {
            if let Err(e) = ep.start_node().await {
                warn!(endpoint = %ep.get_node_name(), error = %e, "node failed to start");
                return;
            }
            if ep.role().is_managed() && !fork_url.is_empty() {
                if let Err(e) = ep.reset_node(fork_url).await {
                    warn!(endpoint = %ep.get_node_name(), error = %e, "node failed to fork upstream");
                }
            }
        });
        join_all(starts).await;
        info!(
            healthy = self.fleet.healthy_count(),
            total = self.fleet.len(),
            "node fleet started"
        );
    }
}
