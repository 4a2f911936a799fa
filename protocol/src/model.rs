//! Entities persisted through the store: sessions, requests, reviews and the
//! append-only audit trail.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::command::CommandSpec;
use crate::ids::AuditEventId;
use crate::ids::RequestId;
use crate::ids::ReviewId;
use crate::ids::SessionId;

/// Risk classification of a command. Ordered: comparing tiers compares
/// severity, so a compound command classifies as the `max` of its segments.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Caution,
    Dangerous,
    Critical,
}

impl RiskTier {
    /// Quorum size required before a request of this tier may execute.
    pub fn min_approvals(self) -> u32 {
        match self {
            RiskTier::Safe => 0,
            RiskTier::Caution => 1,
            RiskTier::Dangerous => 2,
            RiskTier::Critical => 3,
        }
    }
}

/// Lifecycle of a request.
///
/// ```text
/// Pending ──▶ Approved ──▶ Executing ──▶ Executed
///    │                        │
///    ├──▶ Rejected            └──▶ ExecutionFailed
///    ├──▶ Cancelled
///    ├──▶ Timeout
///    └──▶ Escalated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Executing,
    Executed,
    ExecutionFailed,
    Cancelled,
    Timeout,
    Escalated,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Executed
                | RequestStatus::ExecutionFailed
                | RequestStatus::Rejected
                | RequestStatus::Cancelled
                | RequestStatus::Timeout
        )
    }

    /// Whether `self -> next` is a permitted transition. The store's
    /// compare-and-set layer refuses anything else.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Pending, Timeout)
                | (Pending, Escalated)
                | (Approved, Executing)
                | (Executing, Executed)
                | (Executing, ExecutionFailed)
        )
    }
}

/// An authenticated, active agent within a project. At most one active
/// session exists per (agent_name, project_path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_name: String,
    /// The program driving the agent, e.g. `claude-code` or `codex`.
    pub program: String,
    /// Model identifier used for the diversity constraint on critical
    /// requests.
    pub model: String,
    pub project_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Why the requesting agent believes the command should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    /// Required; the creator rejects empty reasons.
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_alternatives: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_impact: Option<String>,
}

impl Justification {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            attempted_alternatives: None,
            urgency: None,
            business_impact: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttachmentKind {
    File,
    Screenshot,
    GitDiff,
    Context,
    LogExcerpt,
}

/// Supporting evidence attached to a request. Images travel as
/// `data:<mime>;base64,…` URIs in `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Outcome of executing an approved request, persisted alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub log_path: PathBuf,
    /// Leading slice of the combined output, bounded by the executor's
    /// capture cap.
    pub output_excerpt: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// A command awaiting (or past) peer approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub project_path: PathBuf,
    pub command: CommandSpec,
    pub risk_tier: RiskTier,
    pub requestor_session_id: SessionId,
    pub requestor_agent: String,
    pub requestor_model: String,
    pub justification: Justification,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub status: RequestStatus,
    pub min_approvals: u32,
    /// True iff `risk_tier` is critical: approvers must use pairwise
    /// distinct models, all different from the requestor's.
    pub require_different_model: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// A single reviewer's verdict on a request. Unique per
/// (request_id, reviewer_session_id); a second submission from the same
/// session is refused, not overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub request_id: RequestId,
    pub reviewer_session_id: SessionId,
    pub decision: ReviewDecision,
    pub reviewer_model: String,
    pub reviewer_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditEventKind {
    StatusTransition,
    ReviewSubmitted,
}

/// One line of the append-only audit log. Events are never rewritten; the
/// log is the authority on what happened to a request and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: AuditEventId,
    #[serde(rename = "type")]
    pub kind: AuditEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<RequestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<RequestStatus>,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn status_transition(
        request_id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditEventId::new(),
            kind: AuditEventKind::StatusTransition,
            request_id: Some(request_id),
            session_id: actor,
            from: Some(from),
            to: Some(to),
            at,
            fields: BTreeMap::new(),
        }
    }

    pub fn review_submitted(review: &Review) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "decision".to_string(),
            serde_json::Value::String(review.decision.to_string()),
        );
        fields.insert(
            "reviewer_model".to_string(),
            serde_json::Value::String(review.reviewer_model.clone()),
        );
        Self {
            id: AuditEventId::new(),
            kind: AuditEventKind::ReviewSubmitted,
            request_id: Some(review.request_id),
            session_id: Some(review.reviewer_session_id),
            from: None,
            to: None,
            at: review.created_at,
            fields,
        }
    }
}
