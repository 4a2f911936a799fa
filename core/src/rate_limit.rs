//! Per-session request throttling.
//!
//! Counters are derived from the store on every check rather than cached in
//! memory, so concurrent creators in different processes see the same
//! numbers. The limiter never sleeps, even under the `queue` action; the
//! caller decides what to do with a disallowed decision.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use slb_protocol::Result;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;

use crate::store::Store;

/// What `check` does when a cap is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    /// Return a [`SlbErr::RateLimited`] error.
    Reject,
    /// Return `allowed = false` without an error; the caller buffers.
    Queue,
    /// Allow the request but attach a warning message.
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_pending_per_session: u32,
    pub max_per_minute: u32,
    pub action: RateLimitAction,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_pending_per_session: 5,
            max_per_minute: 10,
            action: RateLimitAction::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining_pending: u32,
    pub remaining_per_minute: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }

    pub async fn check(
        &self,
        store: &dyn Store,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let reset_at_stored = store.rate_limit_reset_at(session_id).await?;
        let mut window_start = now - Duration::seconds(60);
        if let Some(reset_at) = reset_at_stored
            && reset_at > window_start
        {
            window_start = reset_at;
        }

        let pending = store.count_pending_by_session(session_id).await?;
        let recent = store.count_requests_since(session_id, window_start).await?;

        let pending_ok = pending < self.config.max_pending_per_session;
        let minute_ok = recent < self.config.max_per_minute;
        if pending_ok && minute_ok {
            return Ok(RateDecision {
                allowed: true,
                remaining_pending: self.config.max_pending_per_session - pending,
                remaining_per_minute: self.config.max_per_minute - recent,
                reset_at: reset_at_stored,
                message: None,
            });
        }

        let reset_at = store
            .oldest_request_created_at_since(session_id, window_start)
            .await?
            .map(|oldest| oldest + Duration::seconds(60))
            .unwrap_or(now);

        match self.config.action {
            RateLimitAction::Reject => Err(SlbErr::RateLimited {
                pending,
                max_pending: self.config.max_pending_per_session,
                recent,
                max_per_minute: self.config.max_per_minute,
                reset_at,
            }),
            RateLimitAction::Queue => Ok(RateDecision {
                allowed: false,
                remaining_pending: self.config.max_pending_per_session.saturating_sub(pending),
                remaining_per_minute: self.config.max_per_minute.saturating_sub(recent),
                reset_at: Some(reset_at),
                message: None,
            }),
            RateLimitAction::Warn => Ok(RateDecision {
                allowed: true,
                remaining_pending: self.config.max_pending_per_session.saturating_sub(pending),
                remaining_per_minute: self.config.max_per_minute.saturating_sub(recent),
                reset_at: Some(reset_at),
                message: Some(format!("rate limit reached; window resets at {reset_at}")),
            }),
        }
    }

    /// Start a fresh window for the session; returns the stored reset time.
    pub async fn reset(
        &self,
        store: &dyn Store,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        store.reset_rate_limits(session_id, now).await
    }
}
