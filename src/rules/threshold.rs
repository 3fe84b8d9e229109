//! Single-read rule: act when a uint view crosses a threshold.

use super::{de_u256, encode_action, first_uint, Rule, RuleContext, RuleMeta, RuleOutput, RuleStatus};
use crate::tx::dedup_key;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Above,
    Below,
}

impl Direction {
    /// Strict comparison: sitting exactly on the threshold does not trigger.
    pub fn crossed(self, value: U256, threshold: U256) -> bool {
        match self {
            Direction::Above => value > threshold,
            Direction::Below => value < threshold,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Above => write!(f, "above"),
            Direction::Below => write!(f, "below"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdParams {
    /// Contract holding the view function.
    pub contract: Address,
    /// Zero-argument view returning a uint.
    pub method: String,
    #[serde(deserialize_with = "de_u256")]
    pub threshold: U256,
    #[serde(default)]
    pub direction: Direction,
    /// Contract to call when triggered. Defaults to `contract`.
    #[serde(default)]
    pub target: Option<Address>,
    /// Method on `target`; receives the observed value if it takes one arg.
    pub action: String,
}

pub struct ViewThresholdRule {
    meta: RuleMeta,
    params: ThresholdParams,
    context: RuleContext,
}

impl ViewThresholdRule {
    pub fn new(meta: RuleMeta, params: ThresholdParams, context: RuleContext) -> Self {
        Self {
            meta,
            params,
            context,
        }
    }
}

#[async_trait]
impl Rule for ViewThresholdRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    async fn evaluate(&self, out: &mut RuleOutput) -> anyhow::Result<RuleStatus> {
        let p = &self.params;
        let abi = self.context.load_abi(p.contract).await?;
        let values = self
            .context
            .reader
            .call_view_function(p.contract, &abi, &p.method, &[])
            .await?;
        let value = first_uint(&values)?;

        if !p.direction.crossed(value, p.threshold) {
            debug!(
                rule = %self.meta.label,
                value = %value,
                threshold = %p.threshold,
                "threshold not crossed"
            );
            return Ok(RuleStatus::Completed);
        }

        let target = p.target.unwrap_or(p.contract);
        let calldata = if target == p.contract {
            encode_action(&abi, &p.action, value)?
        } else {
            let target_abi = self.context.load_abi(target).await?;
            encode_action(&target_abi, &p.action, value)?
        };

        let key = dedup_key(&[
            self.meta.label.clone(),
            p.contract.to_checksum(None),
            p.method.clone(),
            value.to_string(),
        ]);
        info!(
            rule = %self.meta.label,
            value = %value,
            threshold = %p.threshold,
            direction = %p.direction,
            "threshold crossed, queueing {}",
            p.action
        );
        out.push(
            format!(
                "{}: {}={} {} {}",
                self.meta.label, p.method, value, p.direction, p.threshold
            ),
            key,
            TransactionRequest::default()
                .with_to(target)
                .with_input(calldata),
        );
        Ok(RuleStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::StaticAbiRepository;
    use crate::node::mock::{encode_input, uint_abi_json, MockChainClient};
    use crate::node::proxy::EIP1967_IMPLEMENTATION_SLOT;
    use crate::rules::tests::{context, meta};
    use crate::rules::{RuleConfig, RuleFactory, StandardRuleFactory};
    use alloy::dyn_abi::DynSolValue;
    use alloy::primitives::{address, TxKind};
    use std::sync::Arc;

    const VAULT: Address = address!("00000000000000000000000000000000000000aa");
    const KEEPER: Address = address!("00000000000000000000000000000000000000bb");
    const IMPL: Address = address!("00000000000000000000000000000000000000cc");

    fn params(direction: Direction, target: Option<Address>) -> ThresholdParams {
        ThresholdParams {
            contract: VAULT,
            method: "value".to_string(),
            threshold: U256::from(900),
            direction,
            target,
            action: "act".to_string(),
        }
    }

    fn repo() -> StaticAbiRepository {
        StaticAbiRepository::new()
            .with(VAULT, uint_abi_json())
            .with(KEEPER, uint_abi_json())
    }

    async fn run(rule: &ViewThresholdRule) -> (RuleStatus, RuleOutput) {
        let mut out = RuleOutput::new(rule.meta().clone());
        let status = rule.evaluate(&mut out).await.unwrap();
        (status, out)
    }

    #[test]
    fn test_direction_is_strict() {
        let t = U256::from(10);
        assert!(Direction::Above.crossed(U256::from(11), t));
        assert!(!Direction::Above.crossed(t, t));
        assert!(Direction::Below.crossed(U256::from(9), t));
        assert!(!Direction::Below.crossed(t, t));
    }

    #[tokio::test]
    async fn test_crossing_queues_action_on_target() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(1000));
        let rule = ViewThresholdRule::new(
            meta("utilisation"),
            params(Direction::Above, Some(KEEPER)),
            context(client, repo()),
        );

        let (status, mut out) = run(&rule).await;
        assert_eq!(status, RuleStatus::Completed);
        let mut txs = Vec::new();
        assert_eq!(out.drain_into(&mut txs), 1);

        let tx = &txs[0];
        assert_eq!(tx.raw_transaction.to, Some(TxKind::Call(KEEPER)));
        let expected = encode_input("act", &[DynSolValue::Uint(U256::from(1000), 256)]);
        assert_eq!(
            tx.raw_transaction.input.input().map(|b| b.to_vec()),
            Some(expected)
        );
        assert!(tx.context.contains("value=1000 above 900"));
    }

    #[tokio::test]
    async fn test_not_crossed_queues_nothing() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(500));
        let rule = ViewThresholdRule::new(
            meta("utilisation"),
            params(Direction::Above, None),
            context(client, repo()),
        );
        let (status, out) = run(&rule).await;
        assert_eq!(status, RuleStatus::Completed);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_below_direction() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(500));
        let rule = ViewThresholdRule::new(
            meta("reserves"),
            params(Direction::Below, None),
            context(client, repo()),
        );
        let (_, out) = run(&rule).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_key_stable_for_same_observation() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(1000));
        let rule = ViewThresholdRule::new(
            meta("utilisation"),
            params(Direction::Above, None),
            context(client.clone(), repo()),
        );
        let (_, mut first) = run(&rule).await;
        let (_, mut second) = run(&rule).await;
        let mut a = Vec::new();
        let mut b = Vec::new();
        first.drain_into(&mut a);
        second.drain_into(&mut b);
        assert_eq!(a[0].dedup_key, b[0].dedup_key);

        client.set_call_output(DynSolValue::Uint(U256::from(1001), 256).abi_encode());
        let (_, mut third) = run(&rule).await;
        let mut c = Vec::new();
        third.drain_into(&mut c);
        assert_ne!(a[0].dedup_key, c[0].dedup_key);
    }

    #[tokio::test]
    async fn test_proxy_contract_uses_implementation_abi() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(1000));
        client.set_slot(EIP1967_IMPLEMENTATION_SLOT, IMPL);
        let abis = StaticAbiRepository::new().with(IMPL, uint_abi_json());
        let rule = ViewThresholdRule::new(
            meta("proxied"),
            params(Direction::Above, None),
            context(client, abis),
        );
        let (_, out) = run(&rule).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_abi_fails_rule() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(1000));
        let rule = ViewThresholdRule::new(
            meta("unknown"),
            params(Direction::Above, None),
            context(client, StaticAbiRepository::new()),
        );
        let mut out = RuleOutput::new(rule.meta().clone());
        assert!(rule.evaluate(&mut out).await.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_factory_builds_from_config() {
        let client = Arc::new(MockChainClient::at_block(1).with_call_value(1000));
        let factory = StandardRuleFactory::new(context(client, repo()), 4);

        let config: RuleConfig = serde_json::from_value(serde_json::json!({
            "kind": "view_threshold",
            "label": "utilisation",
            "executor": "keeper-1",
            "params": {
                "contract": VAULT.to_checksum(None),
                "method": "value",
                "threshold": "900",
                "action": "act",
            },
        }))
        .unwrap();
        let rule = factory.build(&config).unwrap();
        let mut out = RuleOutput::new(rule.meta().clone());
        assert_eq!(rule.evaluate(&mut out).await.unwrap(), RuleStatus::Completed);
        assert_eq!(out.len(), 1);

        let mut broken = config.clone();
        broken.params = serde_json::json!({ "contract": "nope" });
        assert!(matches!(
            factory.build(&broken),
            Err(crate::rules::FactoryError::InvalidParams { .. })
        ));
    }
}
