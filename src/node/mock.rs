//! Scriptable stand-ins for the provider and process-manager seams.

use super::client::ChainClient;
use super::lifecycle::ProcessManager;
use super::EndpointError;
use crate::config::PortMapping;
use alloy::dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// ABI with `value() -> uint256`, `ids() -> uint256[]`, `check(uint256) -> bool`
/// and `act(uint256)`.
pub(crate) fn uint_abi() -> JsonAbi {
    serde_json::from_str(
        r#"[
        {"type":"function","name":"value","inputs":[],"outputs":[{"name":"","type":"uint256"}],"stateMutability":"view"},
        {"type":"function","name":"ids","inputs":[],"outputs":[{"name":"","type":"uint256[]"}],"stateMutability":"view"},
        {"type":"function","name":"check","inputs":[{"name":"id","type":"uint256"}],"outputs":[{"name":"","type":"bool"}],"stateMutability":"view"},
        {"type":"function","name":"act","inputs":[{"name":"id","type":"uint256"}],"outputs":[],"stateMutability":"nonpayable"}
    ]"#,
    )
    .expect("static test abi")
}

/// Calldata for `method` in `uint_abi`.
pub(crate) fn encode_input(method: &str, values: &[DynSolValue]) -> Vec<u8> {
    uint_abi().function(method).expect("known method")[0]
        .abi_encode_input(values)
        .expect("inputs encode")
}

/// Return data for `method` in `uint_abi`.
pub(crate) fn encode_output(method: &str, values: &[DynSolValue]) -> Vec<u8> {
    uint_abi().function(method).expect("known method")[0]
        .abi_encode_output(values)
        .expect("outputs encode")
}

pub(crate) fn uint_abi_json() -> String {
    serde_json::to_string(&uint_abi()).expect("abi serialises")
}

pub(crate) struct MockChainClient {
    block: AtomicU64,
    failing: AtomicBool,
    fail_next_blocks: AtomicUsize,
    call_value: Mutex<Bytes>,
    call_outputs: Mutex<HashMap<Bytes, Bytes>>,
    failing_calls: Mutex<HashSet<Bytes>>,
    slots: Mutex<HashMap<B256, B256>>,
    reset_error: AtomicBool,
    resets: Mutex<Vec<String>>,
    block_calls: AtomicUsize,
    call_count: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MockChainClient {
    pub(crate) fn at_block(block: u64) -> Self {
        Self {
            block: AtomicU64::new(block),
            failing: AtomicBool::new(false),
            fail_next_blocks: AtomicUsize::new(0),
            call_value: Mutex::new(Bytes::new()),
            call_outputs: Mutex::new(HashMap::new()),
            failing_calls: Mutex::new(HashSet::new()),
            slots: Mutex::new(HashMap::new()),
            reset_error: AtomicBool::new(false),
            resets: Mutex::new(Vec::new()),
            block_calls: AtomicUsize::new(0),
            call_count: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Every `call` returns `value` encoded as a single uint256.
    pub(crate) fn with_call_value(self, value: u64) -> Self {
        self.set_call_output(DynSolValue::Uint(U256::from(value), 256).abi_encode());
        self
    }

    pub(crate) fn set_call_output(&self, output: Vec<u8>) {
        *self.call_value.lock().unwrap() = output.into();
    }

    /// Answer calls whose calldata is exactly `calldata` with `output`.
    pub(crate) fn set_output_for(&self, calldata: Vec<u8>, output: Vec<u8>) {
        self.call_outputs
            .lock()
            .unwrap()
            .insert(calldata.into(), output.into());
    }

    /// Fail calls whose calldata is exactly `calldata`.
    pub(crate) fn fail_call(&self, calldata: Vec<u8>) {
        self.failing_calls.lock().unwrap().insert(calldata.into());
    }

    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_blocks(&self, n: usize) {
        self.fail_next_blocks.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_slot(&self, slot: B256, implementation: Address) {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(implementation.as_slice());
        self.slots.lock().unwrap().insert(slot, B256::from(word));
    }

    pub(crate) fn set_reset_error(&self, err: bool) {
        self.reset_error.store(err, Ordering::SeqCst);
    }

    pub(crate) fn resets(&self) -> Vec<String> {
        self.resets.lock().unwrap().clone()
    }

    pub(crate) fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn check(&self) -> Result<(), EndpointError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EndpointError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_number(&self) -> Result<u64, EndpointError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self
            .fail_next_blocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(EndpointError::Transport("not listening yet".to_string()));
        }
        self.check()?;
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes, EndpointError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check()?;
        if self.failing_calls.lock().unwrap().contains(&data) {
            return Err(EndpointError::Rpc {
                code: 3,
                message: "execution reverted".to_string(),
            });
        }
        if let Some(output) = self.call_outputs.lock().unwrap().get(&data) {
            return Ok(output.clone());
        }
        Ok(self.call_value.lock().unwrap().clone())
    }

    async fn storage_at(&self, _address: Address, slot: B256) -> Result<B256, EndpointError> {
        self.check()?;
        Ok(self
            .slots
            .lock()
            .unwrap()
            .get(&slot)
            .copied()
            .unwrap_or(B256::ZERO))
    }

    async fn reset_upstream(&self, upstream_url: &str) -> Result<(), EndpointError> {
        if self.reset_error.load(Ordering::SeqCst) {
            return Err(EndpointError::Rpc {
                code: -32000,
                message: "fork failed".to_string(),
            });
        }
        self.resets.lock().unwrap().push(upstream_url.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockProcessManager {
    exists: AtomicBool,
    ports_match: AtomicBool,
    fail_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockProcessManager {
    pub(crate) fn set_existing(&self, exists: bool, ports_match: bool) {
        self.exists.store(exists, Ordering::SeqCst);
        self.ports_match.store(ports_match, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn start(
        &self,
        _name: &str,
        _image: &str,
        _ports: &[PortMapping],
        _args: &[String],
    ) -> anyhow::Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("image pull failed");
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.exists.store(true, Ordering::SeqCst);
        self.ports_match.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _name: &str) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.exists.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, _name: &str) -> anyhow::Result<bool> {
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn port_bindings_match(&self, _name: &str, _ports: &[PortMapping]) -> anyhow::Result<bool> {
        Ok(self.ports_match.load(Ordering::SeqCst))
    }
}
