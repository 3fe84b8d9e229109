//! Heartbeat and critical-failure signals.
//!
//! Signals are fire-and-forget: `emit` logs a failed delivery and returns.
//! Nothing here is allowed to change the outcome of a cycle.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Start,
    End,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStage::Start => write!(f, "start"),
            CycleStage::End => write!(f, "end"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Heartbeat { stage: CycleStage },
    CriticalFailure { reason: String },
    CycleCompleted { elapsed_ms: u64 },
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Heartbeat { stage } => write!(f, "Heartbeat({stage})"),
            Signal::CriticalFailure { reason } => write!(f, "CriticalFailure({reason})"),
            Signal::CycleCompleted { elapsed_ms } => write!(f, "CycleCompleted({elapsed_ms}ms)"),
        }
    }
}

#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, signal: &Signal) -> anyhow::Result<()>;
}

/// Deliver a signal, logging instead of propagating a delivery failure.
pub async fn emit(sink: &dyn SignalSink, signal: Signal) {
    if let Err(e) = sink.send(&signal).await {
        warn!(signal = %signal, error = %e, "signal delivery failed");
    }
}

/// Log-only sink, used when no heartbeat URL is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingSignalSink;

#[async_trait]
impl SignalSink for TracingSignalSink {
    async fn send(&self, signal: &Signal) -> anyhow::Result<()> {
        match signal {
            Signal::CriticalFailure { reason } => error!(reason = %reason, "CRITICAL: cycle health"),
            Signal::CycleCompleted { elapsed_ms } => info!(elapsed_ms, "cycle completed"),
            Signal::Heartbeat { stage } => debug!(stage = %stage, "heartbeat"),
        }
        Ok(())
    }
}

/// Healthchecks-style pinger: `{url}/start` on cycle start, `{url}` on
/// cycle end, `{url}/fail` with the reason as body on critical failure.
#[derive(Debug, Clone)]
pub struct HttpSignalSink {
    base_url: String,
    http: Client,
}

impl HttpSignalSink {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// The request a signal maps onto, or None if it is log-only.
    pub fn route(&self, signal: &Signal) -> Option<(String, Option<String>)> {
        match signal {
            Signal::Heartbeat {
                stage: CycleStage::Start,
            } => Some((format!("{}/start", self.base_url), None)),
            Signal::Heartbeat {
                stage: CycleStage::End,
            } => Some((self.base_url.clone(), None)),
            Signal::CriticalFailure { reason } => {
                Some((format!("{}/fail", self.base_url), Some(reason.clone())))
            }
            Signal::CycleCompleted { .. } => None,
        }
    }
}

#[async_trait]
impl SignalSink for HttpSignalSink {
    async fn send(&self, signal: &Signal) -> anyhow::Result<()> {
        let Some((url, body)) = self.route(signal) else {
            debug!(signal = %signal, "signal not routed over http");
            return Ok(());
        };

        let resp = match body {
            Some(body) => self.http.post(&url).body(body).send().await?,
            None => self.http.get(&url).send().await?,
        };

        if !resp.status().is_success() {
            anyhow::bail!("signal endpoint returned status {}", resp.status());
        }
        Ok(())
    }
}
