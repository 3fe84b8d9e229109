//! Outbound transaction candidates and the sink that accepts them.
//!
//! This crate never signs or broadcasts. It produces candidates with a
//! stable dedup key and hands them to a `TransactionSink`; deduplication and
//! persistence are the sink's business.

use alloy::primitives::keccak256;
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundTransaction {
    pub urgency: Urgency,
    /// Which signer/executor should send this.
    pub executor: String,
    /// Human-readable reason, e.g. the rule label and decision.
    pub context: String,
    /// Deterministic for identical decision inputs.
    pub dedup_key: String,
    pub ttl_seconds: u64,
    pub raw_transaction: TransactionRequest,
}

/// `0x`-prefixed keccak256 over the parts joined with the unit separator.
/// The separator keeps ("ab", "c") and ("a", "bc") distinct.
pub fn dedup_key<S: AsRef<str>>(parts: &[S]) -> String {
    let joined = parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&str>>()
        .join("\u{1f}");
    keccak256(joined.as_bytes()).to_string()
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Accepts one transaction at a time and reports success per transaction.
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn accept(&self, tx: &OutboundTransaction) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to a local queue file. Concurrent
/// accepts are serialised so lines never interleave.
pub struct JsonlQueueSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlQueueSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TransactionSink for JsonlQueueSink {
    async fn accept(&self, tx: &OutboundTransaction) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(tx)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(dedup_key = %tx.dedup_key, path = %self.path.display(), "transaction queued");
        Ok(())
    }
}
