//! Engine configuration.
//!
//! These structs are the contract with the driver; loading them from a TOML
//! file (or anywhere else) is the driver's business. Every field has a
//! default so a partial configuration deserializes cleanly.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::attachment::AttachmentLimits;
use crate::rate_limit::RateLimitConfig;

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Scale the quorum down to the number of active peer sessions,
    /// clamped to `[floor, classifier minimum]`.
    pub dynamic: bool,
    pub floor: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            dynamic: false,
            floor: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Abort filesystem capture past this many bytes.
    pub max_size_bytes: u64,
    /// Captured state older than this is pruned before each new capture.
    pub retention_days: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024 * 1024,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlbConfig {
    pub rate_limit: RateLimitConfig,
    pub quorum: QuorumConfig,
    pub rollback: RollbackConfig,
    pub attachments: AttachmentLimits,
    /// Seconds before a pending request times out.
    pub request_timeout_secs: u64,
    /// Seconds before a running command is killed.
    pub execution_timeout_secs: u64,
    /// Sessions idle longer than this are garbage collected.
    pub session_stale_after_secs: u64,
    /// Agents (case-insensitive) that may never create requests.
    pub blocked_agents: Vec<String>,
    /// Extra redaction patterns appended after the built-in set.
    pub redact_patterns: Vec<String>,
}

impl Default for SlbConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            quorum: QuorumConfig::default(),
            rollback: RollbackConfig::default(),
            attachments: AttachmentLimits::default(),
            request_timeout_secs: 30 * 60,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT.as_secs(),
            session_stale_after_secs: 30 * 60,
            blocked_agents: Vec::new(),
            redact_patterns: Vec::new(),
        }
    }
}

impl SlbConfig {
    pub fn request_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.request_timeout_secs as i64)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn session_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_stale_after_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: SlbConfig =
            serde_json::from_str(r#"{"blocked_agents":["Rogue"],"request_timeout_secs":60}"#)
                .unwrap();
        assert_eq!(config.blocked_agents, vec!["Rogue"]);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.rate_limit.max_pending_per_session, 5);
        assert_eq!(config.rate_limit.max_per_minute, 10);
        assert_eq!(config.rollback.retention_days, 30);
        assert_eq!(config.attachments.max_image_dimension, 4096);
    }

    #[test]
    fn default_timeouts_match_the_documented_values() {
        let config = SlbConfig::default();
        assert_eq!(config.request_timeout(), chrono::Duration::minutes(30));
        assert_eq!(config.execution_timeout(), Duration::from_secs(30));
        assert_eq!(config.session_stale_after(), chrono::Duration::minutes(30));
    }
}
