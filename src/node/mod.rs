//! Upstream node endpoints.
//!
//! A `NodeEndpoint` wraps one RPC connection and keeps a health flag that
//! only it writes: every read sets the flag from its own outcome. An endpoint
//! is either *managed* (a local container this process starts, stops and
//! resets) or *unmanaged* (a remote RPC where lifecycle calls are no-ops and
//! recovery means waiting and probing again).
//!
//! Endpoint methods never swallow errors. Partial-failure tolerance belongs
//! to the callers (`QuorumReader`, `FleetHealthMonitor`).

pub mod client;
pub mod lifecycle;
pub mod proxy;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{AlloyChainClient, ChainClient};
pub use lifecycle::{DockerCli, ProcessManager};
pub use proxy::{resolve_proxy, ProxyInfo};

use crate::config::{EndpointTuning, PortMapping};
use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::{Address, B256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("not ready after maximum attempts ({attempts})")]
    NotReady { attempts: u32 },
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
    #[error("abi error: {0}")]
    Abi(String),
}

/// Timing knobs for readiness polling and recovery.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    pub recovery_backoff: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self::from(&EndpointTuning::default())
    }
}

impl From<&EndpointTuning> for EndpointSettings {
    fn from(tuning: &EndpointTuning) -> Self {
        Self {
            readiness_attempts: tuning.readiness_attempts.max(1),
            readiness_interval: tuning.readiness_interval(),
            recovery_backoff: tuning.recovery_backoff(),
        }
    }
}

/// A container this process owns.
pub struct ManagedProcess {
    pub container: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub args: Vec<String>,
    pub manager: Arc<dyn ProcessManager>,
}

impl ManagedProcess {
    /// Create the container unless one with the right port bindings is
    /// already running. A container with stale bindings is recreated.
    async fn ensure_running(&self) -> Result<(), EndpointError> {
        let exists = self.manager.exists(&self.container).await.map_err(lifecycle)?;

        if exists {
            let matches = self
                .manager
                .port_bindings_match(&self.container, &self.ports)
                .await
                .map_err(lifecycle)?;
            if matches {
                debug!(container = %self.container, "container already running, reusing");
                return Ok(());
            }
            warn!(container = %self.container, "port bindings changed, recreating container");
            self.manager.stop(&self.container).await.map_err(lifecycle)?;
        }

        info!(container = %self.container, image = %self.image, "starting container");
        self.manager
            .start(&self.container, &self.image, &self.ports, &self.args)
            .await
            .map_err(lifecycle)
    }
}

pub enum NodeRole {
    Unmanaged,
    Managed(ManagedProcess),
}

impl NodeRole {
    pub fn is_managed(&self) -> bool {
        matches!(self, NodeRole::Managed(_))
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Unmanaged => write!(f, "unmanaged"),
            NodeRole::Managed(_) => write!(f, "managed"),
        }
    }
}

/// One upstream data source.
pub struct NodeEndpoint {
    name: String,
    client: Arc<dyn ChainClient>,
    role: NodeRole,
    settings: EndpointSettings,
    /// Advisory hint, not a lock. Starts optimistic; the first read corrects it.
    healthy: AtomicBool,
}

impl NodeEndpoint {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ChainClient>,
        role: NodeRole,
        settings: EndpointSettings,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            role,
            settings,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn get_node_name(&self) -> &str {
        &self.name
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> &NodeRole {
        &self.role
    }

    pub async fn get_block_number(&self) -> Result<u64, EndpointError> {
        let result = self.client.block_number().await;
        self.track(result)
    }

    /// Call a view function and decode its outputs.
    ///
    /// Encoding problems surface as `EndpointError::Abi` before any network
    /// traffic and leave the health flag untouched.
    pub async fn call_view_function(
        &self,
        address: Address,
        abi: &JsonAbi,
        method: &str,
        params: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>, EndpointError> {
        let function = select_function(abi, method, params.len())?;
        let input = function
            .abi_encode_input(params)
            .map_err(|e| EndpointError::Abi(format!("{method}: {e}")))?;

        let result = self.client.call(address, input.into()).await;
        let output = self.track(result)?;

        function
            .abi_decode_output(&output)
            .map_err(|e| EndpointError::Abi(format!("{method} output: {e}")))
    }

    /// Read both implementation slots concurrently and apply the
    /// EIP-1967-first precedence.
    pub async fn get_proxy_info_for_address(
        &self,
        address: Address,
    ) -> Result<ProxyInfo, EndpointError> {
        let (eip1967, legacy) = futures::try_join!(
            self.storage_word(address, proxy::EIP1967_IMPLEMENTATION_SLOT),
            self.storage_word(address, proxy::LEGACY_IMPLEMENTATION_SLOT),
        )?;
        Ok(resolve_proxy(eip1967, legacy))
    }

    async fn storage_word(&self, address: Address, slot: B256) -> Result<B256, EndpointError> {
        let result = self.client.storage_at(address, slot).await;
        self.track(result)
    }

    /// Start the backing process (managed only) and wait for it to answer.
    pub async fn start_node(&self) -> Result<(), EndpointError> {
        let NodeRole::Managed(process) = &self.role else {
            return Ok(());
        };
        if let Err(e) = process.ensure_running().await {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.wait_until_ready().await.map(|_| ())
    }

    /// Stop the backing process (managed only).
    pub async fn stop_node(&self) -> Result<(), EndpointError> {
        let NodeRole::Managed(process) = &self.role else {
            return Ok(());
        };
        info!(endpoint = %self.name, container = %process.container, "stopping node");
        process
            .manager
            .stop(&process.container)
            .await
            .map_err(lifecycle)?;
        self.healthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Re-point the node at `new_upstream_url` (managed only) and wait until
    /// it answers again.
    pub async fn reset_node(&self, new_upstream_url: &str) -> Result<(), EndpointError> {
        let NodeRole::Managed(_) = &self.role else {
            return Ok(());
        };
        info!(endpoint = %self.name, upstream = %new_upstream_url, "resetting node upstream");
        self.client.reset_upstream(new_upstream_url).await?;
        self.wait_until_ready().await.map(|_| ())
    }

    /// Try to bring an unhealthy endpoint back.
    ///
    /// Already-healthy endpoints are left alone. Managed endpoints are
    /// restarted; unmanaged ones wait out the backoff and probe once.
    pub async fn recover_node(&self) -> Result<(), EndpointError> {
        if self.is_healthy() {
            debug!(endpoint = %self.name, "recover requested on healthy endpoint, skipping");
            return Ok(());
        }

        match &self.role {
            NodeRole::Managed(_) => {
                info!(endpoint = %self.name, "recovering managed node: restart");
                self.stop_node().await?;
                self.start_node().await?;
            }
            NodeRole::Unmanaged => {
                info!(
                    endpoint = %self.name,
                    backoff_ms = self.settings.recovery_backoff.as_millis() as u64,
                    "recovering remote node: waiting before probe"
                );
                tokio::time::sleep(self.settings.recovery_backoff).await;
                self.get_block_number().await?;
            }
        }

        self.healthy.store(true, Ordering::SeqCst);
        info!(endpoint = %self.name, "node recovered");
        Ok(())
    }

    /// Bounded readiness poll: `readiness_attempts` reads spaced by
    /// `readiness_interval`.
    async fn wait_until_ready(&self) -> Result<u64, EndpointError> {
        let attempts = self.settings.readiness_attempts.max(1);
        for attempt in 1..=attempts {
            match self.get_block_number().await {
                Ok(block) => {
                    info!(endpoint = %self.name, block, attempt, "node ready");
                    return Ok(block);
                }
                Err(e) => {
                    debug!(endpoint = %self.name, attempt, error = %e, "node not ready yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.readiness_interval).await;
                    }
                }
            }
        }
        warn!(endpoint = %self.name, attempts, "node not ready after maximum attempts");
        Err(EndpointError::NotReady { attempts })
    }

    // Single place the read paths write the health flag.
    fn track<T>(&self, result: Result<T, EndpointError>) -> Result<T, EndpointError> {
        match &result {
            Ok(_) => {
                self.healthy.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                if self.healthy.swap(false, Ordering::SeqCst) {
                    warn!(endpoint = %self.name, error = %e, "endpoint marked unhealthy");
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEndpoint")
            .field("name", &self.name)
            .field("role", &self.role.to_string())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Pick the overload of `method` taking `arity` inputs.
fn select_function<'a>(
    abi: &'a JsonAbi,
    method: &str,
    arity: usize,
) -> Result<&'a Function, EndpointError> {
    abi.function(method)
        .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arity))
        .ok_or_else(|| {
            EndpointError::Abi(format!("no function {method} taking {arity} parameters"))
        })
}

fn lifecycle(e: anyhow::Error) -> EndpointError {
    EndpointError::Lifecycle(e.to_string())
}
