//! Fleet health checks run around every evaluation cycle.
//!
//! `FleetHealthMonitor` tries to recover unhealthy endpoints in parallel and
//! escalates only when every attempt failed. `CycleHealthMonitor` wraps a
//! cycle with heartbeats and turns that escalation into a critical signal
//! instead of an error, so rule evaluation still runs on whatever is left.

use crate::reader::Fleet;
use crate::signals::{emit, CycleStage, Signal, SignalSink};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetHealthError {
    #[error("nodes are down, none recovered ({attempted} attempted: {names})")]
    NoneRecovered { attempted: usize, names: String },
}

/// Outcome of one health pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub unhealthy: usize,
    pub recovered: usize,
    pub failed: usize,
}

pub struct FleetHealthMonitor {
    fleet: Fleet,
}

impl FleetHealthMonitor {
    pub fn new(fleet: Fleet) -> Self {
        Self { fleet }
    }

    /// Recover every unhealthy endpoint concurrently. One endpoint's failure
    /// never cancels another's attempt. Errors only when all attempts failed.
    pub async fn check_and_recover(&self) -> Result<HealthReport, FleetHealthError> {
        let unhealthy: Vec<_> = self
            .fleet
            .endpoints()
            .iter()
            .filter(|ep| !ep.is_healthy())
            .collect();

        if unhealthy.is_empty() {
            return Ok(HealthReport::default());
        }

        warn!(
            unhealthy = unhealthy.len(),
            total = self.fleet.len(),
            "unhealthy nodes detected, attempting recovery"
        );

        let attempts = join_all(unhealthy.iter().map(|ep| async move {
            let result = ep.recover_node().await;
            if let Err(e) = &result {
                warn!(endpoint = %ep.get_node_name(), error = %e, "node recovery failed");
            }
            (ep.get_node_name().to_string(), result.is_ok())
        }))
        .await;

        let failed_names: Vec<String> = attempts
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name.clone())
            .collect();

        let report = HealthReport {
            unhealthy: unhealthy.len(),
            recovered: unhealthy.len() - failed_names.len(),
            failed: failed_names.len(),
        };

        if report.failed == report.unhealthy {
            return Err(FleetHealthError::NoneRecovered {
                attempted: report.unhealthy,
                names: failed_names.join(", "),
            });
        }

        info!(
            recovered = report.recovered,
            still_down = report.failed,
            "fleet recovery finished"
        );
        Ok(report)
    }
}

/// Cycle start marker. Returned by `start_of_cycle_sequence` and handed back
/// to `end_of_cycle_sequence`.
#[derive(Debug, Clone, Copy)]
pub struct CycleStart {
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl CycleStart {
    pub fn now() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub struct CycleHealthMonitor {
    fleet_monitor: FleetHealthMonitor,
    signals: Arc<dyn SignalSink>,
}

impl CycleHealthMonitor {
    pub fn new(fleet_monitor: FleetHealthMonitor, signals: Arc<dyn SignalSink>) -> Self {
        Self {
            fleet_monitor,
            signals,
        }
    }

    /// Heartbeat, then a fleet health pass. Total fleet loss becomes a
    /// critical signal; the cycle continues either way.
    pub async fn start_of_cycle_sequence(&self) -> CycleStart {
        let start = CycleStart::now();
        info!(started_at = %start.started_at.to_rfc3339(), "cycle start");

        emit(
            self.signals.as_ref(),
            Signal::Heartbeat {
                stage: CycleStage::Start,
            },
        )
        .await;

        if let Err(e) = self.fleet_monitor.check_and_recover().await {
            error!(error = %e, "fleet health escalation");
            emit(
                self.signals.as_ref(),
                Signal::CriticalFailure {
                    reason: e.to_string(),
                },
            )
            .await;
        }

        start
    }

    /// Report the cycle's elapsed time and send the closing heartbeat.
    pub async fn end_of_cycle_sequence(&self, start: CycleStart) -> Duration {
        let elapsed = start.started.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "cycle end");

        emit(
            self.signals.as_ref(),
            Signal::CycleCompleted {
                elapsed_ms: elapsed.as_millis() as u64,
            },
        )
        .await;
        emit(
            self.signals.as_ref(),
            Signal::Heartbeat {
                stage: CycleStage::End,
            },
        )
        .await;

        elapsed
    }
}
