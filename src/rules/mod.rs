//! Rule loading, evaluation and transaction collection.
//!
//! Each cycle the engine builds fresh rules from config, evaluates them all
//! concurrently and drains their private queues into one ordered list. A rule
//! that errors or panics is counted as failed and contributes nothing; the
//! other rules are unaffected.

pub mod runner;
pub mod sweep;
pub mod threshold;

pub use runner::{BatchOutcome, BoundedTaskRunner};
pub use sweep::{PositionSweepRule, SweepParams};
pub use threshold::{Direction, ThresholdParams, ViewThresholdRule};

use crate::abi::{parse_abi, AbiRepository};
use crate::reader::QuorumReader;
use crate::tx::{OutboundTransaction, Urgency};
use alloy::dyn_abi::{DynSolValue, JsonAbiExt};
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

fn default_ttl_seconds() -> u64 {
    300
}

/// One `[[rules]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    /// Discriminator, e.g. `view_threshold`.
    pub kind: String,
    pub label: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub executor: String,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Kind-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Rule identity stamped onto every transaction it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMeta {
    pub label: String,
    pub urgency: Urgency,
    pub executor: String,
    pub ttl_seconds: u64,
}

impl From<&RuleConfig> for RuleMeta {
    fn from(config: &RuleConfig) -> Self {
        Self {
            label: config.label.clone(),
            urgency: config.urgency,
            executor: config.executor.clone(),
            ttl_seconds: config.ttl_seconds,
        }
    }
}

/// How a successful evaluation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    /// Candidates were examined; zero or more transactions queued.
    Completed,
    /// There was nothing to examine this cycle.
    NoCandidates,
}

/// A rule's private FIFO of outbound transactions.
#[derive(Debug)]
pub struct RuleOutput {
    meta: RuleMeta,
    queue: VecDeque<OutboundTransaction>,
}

impl RuleOutput {
    pub fn new(meta: RuleMeta) -> Self {
        Self {
            meta,
            queue: VecDeque::new(),
        }
    }

    pub fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    /// Queue a transaction with this rule's urgency, executor and TTL.
    pub fn push(&mut self, context: impl Into<String>, dedup_key: String, raw_transaction: TransactionRequest) {
        self.queue.push_back(OutboundTransaction {
            urgency: self.meta.urgency,
            executor: self.meta.executor.clone(),
            context: context.into(),
            dedup_key,
            ttl_seconds: self.meta.ttl_seconds,
            raw_transaction,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop front-to-back into `out`. Returns the number moved.
    pub fn drain_into(&mut self, out: &mut Vec<OutboundTransaction>) -> usize {
        let mut moved = 0;
        while let Some(tx) = self.queue.pop_front() {
            out.push(tx);
            moved += 1;
        }
        moved
    }

    /// Drop everything queued. Returns the number dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}

#[async_trait]
pub trait Rule: Send + Sync {
    fn meta(&self) -> &RuleMeta;

    /// Read state and queue zero or more transactions into `out`.
    async fn evaluate(&self, out: &mut RuleOutput) -> anyhow::Result<RuleStatus>;
}

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("unknown rule kind {kind:?} for rule {label}")]
    UnknownKind { kind: String, label: String },
    #[error("invalid params for rule {label}: {reason}")]
    InvalidParams { label: String, reason: String },
}

/// Closed set of rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    ViewThreshold,
    PositionSweep,
}

impl RuleKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "view_threshold" => Some(RuleKind::ViewThreshold),
            "position_sweep" => Some(RuleKind::PositionSweep),
            _ => None,
        }
    }
}

pub trait RuleFactory: Send + Sync {
    fn build(&self, config: &RuleConfig) -> Result<Box<dyn Rule>, FactoryError>;
}

/// Handles shared by every rule built in a cycle.
#[derive(Clone)]
pub struct RuleContext {
    pub reader: Arc<QuorumReader>,
    pub abis: Arc<dyn AbiRepository>,
}

impl RuleContext {
    pub fn new(reader: Arc<QuorumReader>, abis: Arc<dyn AbiRepository>) -> Self {
        Self { reader, abis }
    }

    pub async fn load_abi(&self, address: Address) -> anyhow::Result<JsonAbi> {
        load_abi(&self.reader, self.abis.as_ref(), address).await
    }
}

/// Fetch the ABI to use for calls to `address`. For a proxy that is the
/// implementation's ABI.
pub async fn load_abi(
    reader: &QuorumReader,
    abis: &dyn AbiRepository,
    address: Address,
) -> anyhow::Result<JsonAbi> {
    let info = reader.get_proxy_info_for_address(address).await?;
    let source = match info.implementation() {
        Some(implementation) => {
            debug!(proxy = %address, implementation = %implementation, "loading implementation abi");
            implementation
        }
        None => address,
    };
    let json = abis.abi_by_address(source).await?;
    Ok(parse_abi(&json)?)
}

/// Builds the rule kinds this crate ships.
pub struct StandardRuleFactory {
    context: RuleContext,
    runner: BoundedTaskRunner,
}

impl StandardRuleFactory {
    pub fn new(context: RuleContext, default_fan_out: usize) -> Self {
        Self {
            context,
            runner: BoundedTaskRunner::new(default_fan_out),
        }
    }
}

impl RuleFactory for StandardRuleFactory {
    fn build(&self, config: &RuleConfig) -> Result<Box<dyn Rule>, FactoryError> {
        let Some(kind) = RuleKind::parse(&config.kind) else {
            return Err(FactoryError::UnknownKind {
                kind: config.kind.clone(),
                label: config.label.clone(),
            });
        };
        let meta = RuleMeta::from(config);

        match kind {
            RuleKind::ViewThreshold => {
                let params: ThresholdParams = parse_params(config)?;
                Ok(Box::new(ViewThresholdRule::new(meta, params, self.context.clone())))
            }
            RuleKind::PositionSweep => {
                let params: SweepParams = parse_params(config)?;
                let runner = params
                    .concurrency
                    .map(BoundedTaskRunner::new)
                    .unwrap_or(self.runner);
                Ok(Box::new(PositionSweepRule::new(
                    meta,
                    params,
                    self.context.clone(),
                    runner,
                )))
            }
        }
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(config: &RuleConfig) -> Result<T, FactoryError> {
    serde_json::from_value(config.params.clone()).map_err(|e| FactoryError::InvalidParams {
        label: config.label.clone(),
        reason: e.to_string(),
    })
}

/// Per-cycle result of the engine.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Successful rules that had nothing to examine.
    pub idle: usize,
    /// Rule order, then FIFO order within each rule.
    pub transactions: Vec<OutboundTransaction>,
}

struct LoadedRule {
    rule: Box<dyn Rule>,
    output: RuleOutput,
}

pub struct RuleEngine {
    factory: Arc<dyn RuleFactory>,
    rules: Vec<LoadedRule>,
}

impl RuleEngine {
    pub fn new(factory: Arc<dyn RuleFactory>) -> Self {
        Self {
            factory,
            rules: Vec::new(),
        }
    }

    pub fn loaded(&self) -> usize {
        self.rules.len()
    }

    /// Replace the loaded rules with one per config record. Records that
    /// cannot be built are logged and skipped. Returns the number loaded.
    pub fn load_rules(&mut self, configs: &[RuleConfig]) -> usize {
        self.rules.clear();
        for config in configs {
            match self.factory.build(config) {
                Ok(rule) => {
                    let output = RuleOutput::new(rule.meta().clone());
                    self.rules.push(LoadedRule { rule, output });
                }
                Err(e) => warn!(rule = %config.label, error = %e, "skipping rule"),
            }
        }
        info!(loaded = self.rules.len(), configured = configs.len(), "rules loaded");
        self.rules.len()
    }

    /// Evaluate every loaded rule concurrently and collect their output.
    /// The loaded rules are consumed.
    pub async fn evaluate_and_collect(&mut self) -> CycleReport {
        let mut rules = std::mem::take(&mut self.rules);

        let results = join_all(rules.iter_mut().map(|loaded| {
            let LoadedRule { rule, output } = loaded;
            async move {
                match AssertUnwindSafe(rule.evaluate(output)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("rule panicked during evaluation")),
                }
            }
        }))
        .await;

        let mut report = CycleReport::default();
        for (loaded, result) in rules.iter_mut().zip(results) {
            let label = loaded.output.meta().label.clone();
            match result {
                Ok(status) => {
                    report.succeeded += 1;
                    if status == RuleStatus::NoCandidates {
                        report.idle += 1;
                    }
                    let moved = loaded.output.drain_into(&mut report.transactions);
                    debug!(rule = %label, transactions = moved, ?status, "rule evaluated");
                }
                Err(e) => {
                    report.failed += 1;
                    let dropped = loaded.output.discard();
                    error!(rule = %label, error = %e, dropped, "rule evaluation failed");
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            idle = report.idle,
            transactions = report.transactions.len(),
            "rule evaluation finished"
        );
        report
    }
}

/// Accepts a uint either as a JSON number or a decimal/`0x` string.
pub(crate) fn de_u256<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(U256::from(n)),
        Raw::Text(s) => U256::from_str(s.trim()).map_err(serde::de::Error::custom),
    }
}

/// First output word as a uint.
pub(crate) fn first_uint(values: &[DynSolValue]) -> anyhow::Result<U256> {
    match values.first() {
        Some(DynSolValue::Uint(v, _)) => Ok(*v),
        other => anyhow::bail!("expected uint output, got {other:?}"),
    }
}

/// Encode a call to `method`, passing `value` when the function takes one
/// argument and nothing when it takes none.
pub(crate) fn encode_action(abi: &JsonAbi, method: &str, value: U256) -> anyhow::Result<Vec<u8>> {
    let function = abi
        .function(method)
        .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() <= 1))
        .ok_or_else(|| anyhow::anyhow!("no callable {method} in abi"))?;
    let args = if function.inputs.is_empty() {
        Vec::new()
    } else {
        vec![DynSolValue::Uint(value, 256)]
    };
    Ok(function.abi_encode_input(&args)?)
}
