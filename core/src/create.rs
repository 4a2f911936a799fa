//! Request creation.
//!
//! The creator is the write path for new approval requests: it validates
//! the session, applies the rate limit, classifies the command, redacts it
//! for display, sizes the quorum and persists the pending request. Safe
//! commands short-circuit without touching the store.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use slb_protocol::Attachment;
use slb_protocol::CommandSpec;
use slb_protocol::Justification;
use slb_protocol::Request;
use slb_protocol::RequestId;
use slb_protocol::RequestStatus;
use slb_protocol::Result;
use slb_protocol::RiskTier;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;

use crate::attachment::validate_attachment;
use crate::classify::Classifier;
use crate::classify::MatchResult;
use crate::config::SlbConfig;
use crate::notify::RequestNotifier;
use crate::rate_limit::RateDecision;
use crate::rate_limit::RateLimiter;
use crate::redact::Redactor;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct CreateParams {
    pub session_id: SessionId,
    pub command: String,
    pub cwd: PathBuf,
    pub shell: bool,
    pub justification: Justification,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug)]
pub enum CreateOutcome {
    /// The command classified safe; nothing was persisted.
    Skipped {
        reason: String,
        classification: MatchResult,
    },
    /// The rate limiter's `queue` action fired; the caller buffers and
    /// retries after `rate.reset_at`.
    Deferred { rate: RateDecision },
    /// A pending request was persisted and reviewers notified.
    Created { request: Request },
}

pub struct RequestCreator {
    store: Arc<dyn Store>,
    notifier: Arc<dyn RequestNotifier>,
    classifier: Classifier,
    redactor: Redactor,
    limiter: RateLimiter,
    config: SlbConfig,
}

impl RequestCreator {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn RequestNotifier>,
        config: SlbConfig,
    ) -> Result<Self> {
        let redactor = Redactor::with_custom_patterns(&config.redact_patterns)?;
        Ok(Self {
            store,
            notifier,
            classifier: Classifier::with_default_patterns(),
            redactor,
            limiter: RateLimiter::new(config.rate_limit.clone()),
            config,
        })
    }

    /// Swap in a synthetic pattern table.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub async fn create(&self, params: CreateParams) -> Result<CreateOutcome> {
        self.create_at(params, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        params: CreateParams,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        if params.command.trim().is_empty() {
            return Err(SlbErr::validation("command", "required"));
        }
        if params.justification.reason.trim().is_empty() {
            return Err(SlbErr::validation("justification", "reason is required"));
        }

        let session = self
            .store
            .get_session(params.session_id)
            .await?
            .ok_or(SlbErr::SessionNotFound(params.session_id))?;
        if !session.is_active() {
            return Err(SlbErr::SessionInactive(session.id));
        }
        if self
            .config
            .blocked_agents
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(&session.agent_name))
        {
            return Err(SlbErr::AgentBlocked(session.agent_name));
        }

        let rate = self
            .limiter
            .check(self.store.as_ref(), session.id, now)
            .await?;
        if !rate.allowed {
            return Ok(CreateOutcome::Deferred { rate });
        }
        if let Some(message) = &rate.message {
            tracing::warn!(session = %session.id, "{message}");
        }

        let classification = self.classifier.classify(&params.command, &params.cwd);
        if classification.is_safe || !classification.needs_approval {
            tracing::debug!(
                command = %params.command,
                "command classified safe; no approval required"
            );
            return Ok(CreateOutcome::Skipped {
                reason: classification.rationale.clone(),
                classification,
            });
        }

        for attachment in &params.attachments {
            validate_attachment(attachment, &self.config.attachments)?;
        }

        let argv = shlex::split(&params.command).unwrap_or_else(|| {
            params
                .command
                .split_whitespace()
                .map(str::to_string)
                .collect()
        });
        let (display_redacted, contains_sensitive) = self.redactor.redact(&params.command);
        let command = CommandSpec::new(
            params.command,
            argv,
            params.cwd,
            params.shell,
            display_redacted,
            contains_sensitive,
        );

        let min_approvals = self
            .quorum_for(&session.project_path, session.id, &classification)
            .await?;

        let request = Request {
            id: RequestId::new(),
            project_path: session.project_path.clone(),
            command,
            risk_tier: classification.tier,
            requestor_session_id: session.id,
            requestor_agent: session.agent_name.clone(),
            requestor_model: session.model.clone(),
            justification: params.justification,
            attachments: params.attachments,
            status: RequestStatus::Pending,
            min_approvals,
            require_different_model: classification.tier == RiskTier::Critical,
            created_at: now,
            expires_at: now + self.config.request_timeout(),
            decided_at: None,
            executed_at: None,
            execution_result: None,
            rollback_path: None,
        };
        let request = self.store.create_request(request).await?;
        tracing::info!(
            request = %request.id,
            tier = %request.risk_tier,
            min_approvals = request.min_approvals,
            "created pending request"
        );

        if let Err(e) = self.notifier.notify(&request).await {
            tracing::warn!(error = %e, request = %request.id, "request notification failed");
        }

        Ok(CreateOutcome::Created { request })
    }

    /// Quorum size: the classifier's minimum, optionally scaled down to the
    /// number of active peers but never below the configured floor.
    async fn quorum_for(
        &self,
        project_path: &std::path::Path,
        requestor: SessionId,
        classification: &MatchResult,
    ) -> Result<u32> {
        if !self.config.quorum.dynamic {
            return Ok(classification.min_approvals);
        }
        let active = self.store.list_active_sessions(project_path).await?;
        let peers = active.iter().filter(|s| s.id != requestor).count() as u32;
        let floor = self.config.quorum.floor.min(classification.min_approvals);
        Ok(peers.clamp(floor, classification.min_approvals))
    }
}
