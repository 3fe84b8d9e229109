//! Bounded fan-out for rules that issue one sub-call per candidate.
//!
//! At most `limit` tasks are in flight at once. Each task succeeds or fails
//! on its own; a failure is logged and counted, never cancels siblings.

use futures::future::join_all;
use std::future::Future;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Results of one fan-out batch. `succeeded` keeps task submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: usize,
}

impl<T> BatchOutcome<T> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed
    }

    /// True when there was work and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.succeeded.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedTaskRunner {
    limit: usize,
}

impl BoundedTaskRunner {
    /// A zero ceiling is raised to one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn run<T, F, I>(&self, label: &str, tasks: I) -> BatchOutcome<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = anyhow::Result<T>>,
    {
        let permits = Semaphore::new(self.limit);
        let gated = tasks.into_iter().enumerate().map(|(index, task)| {
            let permits = &permits;
            async move {
                let result = match permits.acquire().await {
                    Ok(_permit) => task.await,
                    Err(e) => Err(anyhow::anyhow!("fan-out permit: {e}")),
                };
                (index, result)
            }
        });
        let results = join_all(gated).await;

        let mut outcome = BatchOutcome {
            succeeded: Vec::with_capacity(results.len()),
            failed: 0,
        };
        for (index, result) in results {
            match result {
                Ok(value) => outcome.succeeded.push(value),
                Err(e) => {
                    warn!(rule = %label, task = index, error = %e, "fan-out task failed");
                    outcome.failed += 1;
                }
            }
        }
        debug!(
            rule = %label,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed,
            limit = self.limit,
            "fan-out batch finished"
        );
        outcome
    }
}
