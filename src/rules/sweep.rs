//! Fan-out rule: list candidate ids, check each one, act on those that pass.
//!
//! The per-id checks go through `BoundedTaskRunner`, so an unbounded
//! candidate list never opens more than `limit` concurrent reads.

use super::{encode_action, BoundedTaskRunner, Rule, RuleContext, RuleMeta, RuleOutput, RuleStatus};
use crate::tx::dedup_key;
use alloy::dyn_abi::DynSolValue;
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct SweepParams {
    pub contract: Address,
    /// Zero-argument view returning `uint256[]`.
    pub list_method: String,
    /// View taking one id and returning `bool`.
    pub check_method: String,
    /// Called once per passing id.
    pub action: String,
    /// Defaults to `contract`.
    #[serde(default)]
    pub target: Option<Address>,
    /// Overrides the configured fan-out ceiling.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

pub struct PositionSweepRule {
    meta: RuleMeta,
    params: SweepParams,
    context: RuleContext,
    runner: BoundedTaskRunner,
}

impl PositionSweepRule {
    pub fn new(
        meta: RuleMeta,
        params: SweepParams,
        context: RuleContext,
        runner: BoundedTaskRunner,
    ) -> Self {
        Self {
            meta,
            params,
            context,
            runner,
        }
    }
}

#[async_trait]
impl Rule for PositionSweepRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    async fn evaluate(&self, out: &mut RuleOutput) -> anyhow::Result<RuleStatus> {
        let p = &self.params;
        let abi = self.context.load_abi(p.contract).await?;
        let listed = self
            .context
            .reader
            .call_view_function(p.contract, &abi, &p.list_method, &[])
            .await?;
        let ids = uint_list(&listed)?;

        if ids.is_empty() {
            info!(rule = %self.meta.label, "no candidates listed");
            return Ok(RuleStatus::NoCandidates);
        }

        let abi_ref = &abi;
        let checks = ids.iter().copied().map(|id| async move {
            let result = self
                .context
                .reader
                .call_view_function(p.contract, abi_ref, &p.check_method, &[DynSolValue::Uint(id, 256)])
                .await?;
            match result.first() {
                Some(DynSolValue::Bool(passed)) => Ok::<_, anyhow::Error>((id, *passed)),
                other => anyhow::bail!("{} returned {other:?} for id {id}", p.check_method),
            }
        });
        let outcome = self.runner.run(&self.meta.label, checks).await;

        // Every check failing means we learned nothing about the candidates.
        if outcome.all_failed() {
            anyhow::bail!("all {} candidate checks failed", outcome.failed);
        }

        let target = p.target.unwrap_or(p.contract);
        let target_abi = if target == p.contract {
            abi.clone()
        } else {
            self.context.load_abi(target).await?
        };

        let contract = p.contract.to_checksum(None);
        let mut queued = 0;
        for (id, _) in outcome.succeeded.iter().filter(|(_, passed)| *passed) {
            let calldata = encode_action(&target_abi, &p.action, *id)?;
            out.push(
                format!("{}: {} id {}", self.meta.label, p.action, id),
                dedup_key(&[self.meta.label.clone(), contract.clone(), id.to_string()]),
                TransactionRequest::default()
                    .with_to(target)
                    .with_input(calldata),
            );
            queued += 1;
        }

        if outcome.failed > 0 {
            warn!(
                rule = %self.meta.label,
                failed = outcome.failed,
                checked = outcome.total(),
                "some candidate checks failed"
            );
        }
        info!(
            rule = %self.meta.label,
            candidates = ids.len(),
            queued,
            limit = self.runner.limit(),
            "sweep finished"
        );
        Ok(RuleStatus::Completed)
    }
}

fn uint_list(values: &[DynSolValue]) -> anyhow::Result<Vec<U256>> {
    let Some(DynSolValue::Array(items)) = values.first() else {
        anyhow::bail!("expected uint256[] output, got {:?}", values.first());
    };
    items
        .iter()
        .map(|item| match item {
            DynSolValue::Uint(v, _) => Ok(*v),
            other => anyhow::bail!("expected uint list item, got {other:?}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::StaticAbiRepository;
    use crate::node::mock::{encode_input, encode_output, uint_abi_json, MockChainClient};
    use crate::rules::tests::{context, meta};
    use crate::rules::{RuleConfig, RuleFactory, StandardRuleFactory};
    use alloy::primitives::address;
    use std::sync::Arc;

    const POOL: Address = address!("00000000000000000000000000000000000000dd");

    fn uint(v: u64) -> DynSolValue {
        DynSolValue::Uint(U256::from(v), 256)
    }

    /// `ids()` lists `ids`; `check(id)` answers from `passing`.
    fn client(ids: &[u64], passing: &[u64]) -> Arc<MockChainClient> {
        let client = Arc::new(MockChainClient::at_block(1));
        let list = DynSolValue::Array(ids.iter().map(|&id| uint(id)).collect());
        client.set_output_for(encode_input("ids", &[]), encode_output("ids", &[list]));
        for &id in ids {
            client.set_output_for(
                encode_input("check", &[uint(id)]),
                encode_output("check", &[DynSolValue::Bool(passing.contains(&id))]),
            );
        }
        client
    }

    fn rule(client: Arc<MockChainClient>, limit: usize) -> PositionSweepRule {
        PositionSweepRule::new(
            meta("sweep"),
            SweepParams {
                contract: POOL,
                list_method: "ids".to_string(),
                check_method: "check".to_string(),
                action: "act".to_string(),
                target: None,
                concurrency: None,
            },
            context(client, StaticAbiRepository::new().with(POOL, uint_abi_json())),
            BoundedTaskRunner::new(limit),
        )
    }

    fn drained(mut out: RuleOutput) -> Vec<crate::tx::OutboundTransaction> {
        let mut txs = Vec::new();
        out.drain_into(&mut txs);
        txs
    }

    #[tokio::test]
    async fn test_queues_passing_ids_in_candidate_order() {
        let client = client(&[7, 3, 9, 4], &[9, 7, 4]);
        let rule = rule(client, 2);
        let mut out = RuleOutput::new(rule.meta().clone());

        assert_eq!(rule.evaluate(&mut out).await.unwrap(), RuleStatus::Completed);
        let txs = drained(out);
        let inputs: Vec<Vec<u8>> = txs
            .iter()
            .map(|t| t.raw_transaction.input.input().map(|b| b.to_vec()).unwrap_or_default())
            .collect();
        assert_eq!(
            inputs,
            vec![
                encode_input("act", &[uint(7)]),
                encode_input("act", &[uint(9)]),
                encode_input("act", &[uint(4)]),
            ]
        );
        assert_eq!(
            txs[0].dedup_key,
            dedup_key(&["sweep".to_string(), POOL.to_checksum(None), "7".to_string()])
        );
    }

    #[tokio::test]
    async fn test_empty_candidate_list_is_reported_as_no_candidates() {
        let rule = rule(client(&[], &[]), 2);
        let mut out = RuleOutput::new(rule.meta().clone());
        assert_eq!(rule.evaluate(&mut out).await.unwrap(), RuleStatus::NoCandidates);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_none_passing_is_completed_with_no_transactions() {
        let rule = rule(client(&[1, 2], &[]), 2);
        let mut out = RuleOutput::new(rule.meta().clone());
        assert_eq!(rule.evaluate(&mut out).await.unwrap(), RuleStatus::Completed);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_failed_check_skips_only_that_id() {
        let client = client(&[1, 2, 3], &[1, 2, 3]);
        client.fail_call(encode_input("check", &[uint(2)]));
        let rule = rule(client, 3);
        let mut out = RuleOutput::new(rule.meta().clone());

        rule.evaluate(&mut out).await.unwrap();
        let txs = drained(out);
        assert_eq!(txs.len(), 2);
        assert!(txs[1].context.ends_with("id 3"));
    }

    #[tokio::test]
    async fn test_all_checks_failing_fails_rule() {
        let client = client(&[1, 2], &[1, 2]);
        client.fail_call(encode_input("check", &[uint(1)]));
        client.fail_call(encode_input("check", &[uint(2)]));
        let rule = rule(client, 2);
        let mut out = RuleOutput::new(rule.meta().clone());
        assert!(rule.evaluate(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_applies_concurrency_override() {
        let factory = StandardRuleFactory::new(
            context(
                client(&[5], &[5]),
                StaticAbiRepository::new().with(POOL, uint_abi_json()),
            ),
            8,
        );
        let config: RuleConfig = serde_json::from_value(serde_json::json!({
            "kind": "position_sweep",
            "label": "sweep",
            "params": {
                "contract": POOL.to_checksum(None),
                "list_method": "ids",
                "check_method": "check",
                "action": "act",
                "concurrency": 1,
            },
        }))
        .unwrap();
        let rule = factory.build(&config).unwrap();
        let mut out = RuleOutput::new(rule.meta().clone());
        rule.evaluate(&mut out).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_uint_list_rejects_wrong_shape() {
        assert!(uint_list(&[uint(1)]).is_err());
        assert!(uint_list(&[DynSolValue::Array(vec![DynSolValue::Bool(true)])]).is_err());
        assert_eq!(
            uint_list(&[DynSolValue::Array(vec![uint(1), uint(2)])]).unwrap(),
            vec![U256::from(1), U256::from(2)]
        );
    }
}
