//! Waits for the quality gate to finish processing a scan.

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{GateProbe, GateStatus, QualityGateClient};
use crate::config::PollConfig;
use crate::error::{AnalysisError, Result};

const STAGE: &str = "quality gate polling";

#[derive(Debug, Clone)]
pub struct QualityGatePoller {
    client: QualityGateClient,
    config: PollConfig,
}

impl QualityGatePoller {
    pub fn new(client: QualityGateClient, config: PollConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &QualityGateClient {
        &self.client
    }

    /// Poll until the gate reports a verdict.
    ///
    /// Not-ready answers and transient failures are retried with exponential
    /// backoff, bounded by both `max_attempts` and the overall timeout. An
    /// explicit error from the service ends the wait immediately.
    pub async fn wait_for_gate(
        &self,
        project_key: &str,
        cancel: &CancellationToken,
    ) -> Result<GateStatus> {
        let started = Instant::now();
        let timeout = self.config.timeout();
        let max_backoff = self.config.max_backoff();
        let mut backoff = self.config.initial_backoff();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            attempt = attempt.saturating_add(1);

            let probe = tokio::select! {
                probe = self.client.project_status(project_key) => probe,
                _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            };
            match probe {
                Ok(GateProbe::Ready(status)) => {
                    info!(project = %project_key, gate = %status.status, attempt, "quality gate ready");
                    return Ok(status);
                }
                Ok(GateProbe::NotReady) => {
                    debug!(project = %project_key, attempt, "quality gate not ready");
                }
                Err(e) if e.is_transient() => {
                    warn!(project = %project_key, attempt, error = %e, "transient quality gate failure");
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if attempt >= self.config.max_attempts || elapsed >= timeout {
                warn!(project = %project_key, attempt, ?elapsed, "giving up on quality gate");
                return Err(AnalysisError::Timeout {
                    stage: STAGE,
                    elapsed,
                });
            }

            let wait = backoff.min(timeout.saturating_sub(elapsed));
            debug!(project = %project_key, ?wait, "backing off");
            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            }
            backoff = (backoff * 2).min(max_backoff);
        }
    }
}
