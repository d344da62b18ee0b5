//! Startup readiness gate.
//!
//! The backend is single-tenant and stateful: switching its loaded model
//! while another request runs corrupts that request. The worker therefore
//! refuses to consume jobs until the backend reports zero outstanding
//! jobs. [`wait_until_ready`] failing is fatal to startup.

use std::time::Duration;

use crate::api::{SdWebUiApi, SdWebUiError};

/// Tunables for the readiness poll.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Sleep before the first poll (backend warm-up).
    pub initial_delay: Duration,
    /// Wait between polls while the backend reports work in progress.
    pub poll_interval: Duration,
    /// Busy polls tolerated before giving up.
    pub max_polls: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            poll_interval: Duration::from_secs(5),
            max_polls: 60,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    /// The status endpoint failed past the transport's retry budget.
    #[error("Backend unreachable: {0}")]
    Unreachable(#[from] SdWebUiError),

    /// The backend stayed busy for every allowed poll.
    #[error("Backend still busy after {polls} polls ({job_count} jobs outstanding)")]
    Busy { polls: u32, job_count: i64 },
}

/// Block until the backend reports an idle queue.
///
/// Transport-level retries happen inside each poll; this loop only
/// re-polls while the backend answers but is busy.
pub async fn wait_until_ready(
    api: &SdWebUiApi,
    config: &ReadinessConfig,
) -> Result<(), ReadinessError> {
    if !config.initial_delay.is_zero() {
        tracing::info!(
            delay_ms = config.initial_delay.as_millis() as u64,
            "Waiting before first readiness check",
        );
        tokio::time::sleep(config.initial_delay).await;
    }

    let max_polls = config.max_polls.max(1);
    let mut polls = 0u32;

    loop {
        polls += 1;
        let progress = api.progress().await?;

        if progress.is_idle() {
            tracing::info!(polls, url = %api.transport().base_url(), "Backend is ready");
            return Ok(());
        }

        let job_count = progress.state.job_count;
        if polls >= max_polls {
            return Err(ReadinessError::Busy { polls, job_count });
        }

        tracing::info!(polls, job_count, "Backend busy, waiting for idle");
        tokio::time::sleep(config.poll_interval).await;
    }
}
