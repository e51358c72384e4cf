//! Budget-aware upstream call wrapper.
//!
//! Every Grok call goes through here. The timeout is derived from remaining
//! budget, never a blind constant. Running out of time is control flow, not
//! an error: the primary stage converts it into an `Accepted` signal (the
//! caller should return an accepted/async response), downstream stages get
//! a typed retryable error instead.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use grok_client::{ChatRequest, GrokCallError, GrokResponse};
use originmap_common::Stage;

use crate::budget::BudgetTracker;
use crate::traits::Upstream;

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 60_000;
pub const MIN_STAGE_REMAINING_MS: u64 = 4_000;
pub const DEADLINE_SAFETY_BUFFER_MS: u64 = 1_500;
pub const UPSTREAM_TIMEOUT_MARGIN_MS: u64 = 1_200;
pub const STAGE_TIMEOUT_FLOOR_MS: u64 = 2_500;
pub const STAGE_RETRY_BACKOFF_MS: [u64; 4] = [0, 2_000, 5_000, 10_000];

/// Per-stage upstream call ceilings. Expand is deliberately tight — it runs
/// last, against whatever budget the other stages left behind.
pub fn stage_cap_ms(stage: Stage) -> u64 {
    match stage {
        Stage::Primary => 60_000,
        Stage::Keywords => 60_000,
        Stage::Reviews => 90_000,
        Stage::Location => 60_000,
        Stage::Expand => 8_000,
    }
}

/// Checkpoint name for a stage's fetch, used in session beacons.
pub fn fetch_beacon(stage: Stage) -> String {
    format!("{stage}_fetch_start")
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 421 | 429) || (500..=599).contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptedReason {
    RemainingBudgetLow,
    InsufficientTimeForFetch,
    UpstreamTimeout,
}

impl std::fmt::Display for AcceptedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptedReason::RemainingBudgetLow => write!(f, "remaining_budget_low"),
            AcceptedReason::InsufficientTimeForFetch => write!(f, "insufficient_time_for_fetch"),
            AcceptedReason::UpstreamTimeout => write!(f, "upstream_timeout"),
        }
    }
}

/// "Abort remaining stages and answer the caller with accepted/async now."
#[derive(Debug, Clone)]
pub struct AcceptedSignal {
    pub stage: Stage,
    pub stage_beacon: String,
    pub reason: AcceptedReason,
    pub inline_budget_ms: u64,
}

/// Tagged result threaded through the pipeline in place of exception-based
/// control flow: either keep going with the value, or stop and return the
/// accepted response.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Continue(T),
    Accepted(AcceptedSignal),
}

#[derive(Debug, Error)]
pub enum StageCallError {
    #[error("insufficient time for upstream fetch (stage {stage}, {remaining_ms}ms remaining)")]
    InsufficientTime { stage: Stage, remaining_ms: u64 },

    #[error("upstream timeout (stage {stage}, {timeout_ms}ms)")]
    UpstreamTimeout { stage: Stage, timeout_ms: u64 },

    #[error("invalid outbound payload: {0}")]
    InvalidPayload(String),

    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl StageCallError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageCallError::InsufficientTime { .. } | StageCallError::UpstreamTimeout { .. }
        )
    }
}

pub struct StageCaller<'a> {
    upstream: &'a dyn Upstream,
    budget: &'a BudgetTracker,
}

impl<'a> StageCaller<'a> {
    pub fn new(upstream: &'a dyn Upstream, budget: &'a BudgetTracker) -> Self {
        Self { upstream, budget }
    }

    fn accepted(&self, stage: Stage, reason: AcceptedReason) -> AcceptedSignal {
        AcceptedSignal {
            stage,
            stage_beacon: fetch_beacon(stage),
            reason,
            inline_budget_ms: self.budget.total_ms(),
        }
    }

    /// One bounded call. See module docs for the control-flow contract.
    pub async fn call(
        &self,
        stage: Stage,
        request: &ChatRequest,
        stage_cap_override_ms: Option<u64>,
    ) -> Result<StageOutcome<GrokResponse>, StageCallError> {
        let remaining_ms = self.budget.remaining_ms();

        if remaining_ms < MIN_STAGE_REMAINING_MS && stage == Stage::Primary {
            return Ok(StageOutcome::Accepted(
                self.accepted(stage, AcceptedReason::RemainingBudgetLow),
            ));
        }

        let cap_base = stage_cap_ms(stage);
        let cap = match stage_cap_override_ms.filter(|&ms| ms > 0) {
            Some(ms) => ms.min(cap_base),
            None => cap_base,
        };

        let safety = DEADLINE_SAFETY_BUFFER_MS + UPSTREAM_TIMEOUT_MARGIN_MS;
        let timeout_ms = self
            .budget
            .clamp_stage_timeout_ms(STAGE_TIMEOUT_FLOOR_MS, cap, safety);

        let min_required = safety + STAGE_TIMEOUT_FLOOR_MS;
        if remaining_ms < min_required {
            if stage == Stage::Primary {
                return Ok(StageOutcome::Accepted(
                    self.accepted(stage, AcceptedReason::InsufficientTimeForFetch),
                ));
            }
            return Err(StageCallError::InsufficientTime { stage, remaining_ms });
        }

        debug!(%stage, remaining_ms, timeout_ms, "upstream fetch begin");

        match self
            .upstream
            .chat(request, Duration::from_millis(timeout_ms))
            .await
        {
            Ok(response) => {
                debug!(%stage, status = response.status, "upstream fetch end");
                Ok(StageOutcome::Continue(response))
            }
            Err(GrokCallError::Timeout) => {
                if stage == Stage::Primary {
                    return Ok(StageOutcome::Accepted(
                        self.accepted(stage, AcceptedReason::UpstreamTimeout),
                    ));
                }
                Err(StageCallError::UpstreamTimeout { stage, timeout_ms })
            }
            Err(GrokCallError::InvalidPayload(msg)) => Err(StageCallError::InvalidPayload(msg)),
            Err(GrokCallError::Transport(e)) => Err(StageCallError::Transport(e.to_string())),
        }
    }

    /// Retry wrapper: retryable statuses (408/421/429/5xx) and retryable
    /// typed errors get up to 4 attempts with backoff, but a backoff delay
    /// is only taken when the remaining budget covers it plus the safety
    /// buffer. An `Accepted` outcome always propagates immediately.
    pub async fn call_with_retry(
        &self,
        stage: Stage,
        request: &ChatRequest,
        stage_cap_override_ms: Option<u64>,
    ) -> Result<StageOutcome<GrokResponse>, StageCallError> {
        let attempts = STAGE_RETRY_BACKOFF_MS.len();

        for (attempt, &delay_ms) in STAGE_RETRY_BACKOFF_MS.iter().enumerate() {
            if delay_ms > 0 {
                if self.budget.remaining_ms() < delay_ms + DEADLINE_SAFETY_BUFFER_MS {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            match self.call(stage, request, stage_cap_override_ms).await {
                Ok(StageOutcome::Accepted(signal)) => return Ok(StageOutcome::Accepted(signal)),
                Ok(StageOutcome::Continue(response)) => {
                    if is_retryable_status(response.status) && attempt < attempts - 1 {
                        warn!(%stage, status = response.status, attempt, "retryable upstream status");
                        continue;
                    }
                    return Ok(StageOutcome::Continue(response));
                }
                Err(e) if e.is_retryable() && attempt < attempts - 1 => {
                    warn!(%stage, error = %e, attempt, "retryable upstream error");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        // Budget cut the backoff schedule short; one last direct attempt.
        self.call(stage, request, stage_cap_override_ms).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for status in [408, 421, 429, 500, 503, 599] {
            assert!(is_retryable_status(status), "{status} should be retryable");
        }
        for status in [200, 201, 400, 401, 404, 422] {
            assert!(!is_retryable_status(status), "{status} should not be retryable");
        }
    }

    #[test]
    fn typed_errors_carry_retryability() {
        assert!(StageCallError::UpstreamTimeout {
            stage: Stage::Keywords,
            timeout_ms: 5_000
        }
        .is_retryable());
        assert!(StageCallError::InsufficientTime {
            stage: Stage::Reviews,
            remaining_ms: 100
        }
        .is_retryable());
        assert!(!StageCallError::InvalidPayload("empty".into()).is_retryable());
        assert!(!StageCallError::Transport("dns".into()).is_retryable());
    }

    #[test]
    fn expand_cap_is_tight() {
        assert_eq!(stage_cap_ms(Stage::Expand), 8_000);
        assert_eq!(stage_cap_ms(Stage::Reviews), 90_000);
    }

    #[test]
    fn beacons_name_the_stage() {
        assert_eq!(fetch_beacon(Stage::Primary), "primary_fetch_start");
        assert_eq!(fetch_beacon(Stage::Expand), "expand_fetch_start");
    }
}
