//! Pure, synchronous store state. Both store backends apply mutations
//! through the methods here, so every operation's semantics (uniqueness,
//! compare-and-set, audit emission) is implemented exactly once. A backend
//! that fails an operation discards the mutated copy, which is what makes
//! each operation transactional.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use slb_protocol::AuditEvent;
use slb_protocol::ExecutionResult;
use slb_protocol::Request;
use slb_protocol::RequestId;
use slb_protocol::RequestStatus;
use slb_protocol::Result;
use slb_protocol::Review;
use slb_protocol::ReviewDecision;
use slb_protocol::Session;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    sessions: BTreeMap<SessionId, Session>,
    #[serde(default)]
    requests: BTreeMap<RequestId, Request>,
    #[serde(default)]
    reviews: BTreeMap<RequestId, Vec<Review>>,
    #[serde(default)]
    rate_limit_resets: BTreeMap<SessionId, DateTime<Utc>>,
    /// Audit events produced by the current operation, drained by the
    /// backend after a successful commit.
    #[serde(skip)]
    pending_audit: Vec<AuditEvent>,
}

impl State {
    pub fn take_audit(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.pending_audit)
    }

    // ---- sessions --------------------------------------------------------

    pub fn create_session(&mut self, session: Session) -> Result<Session> {
        let duplicate = self.sessions.values().any(|existing| {
            existing.is_active()
                && existing.agent_name == session.agent_name
                && existing.project_path == session.project_path
        });
        if duplicate {
            return Err(SlbErr::validation(
                "session",
                format!(
                    "agent `{}` already has an active session in {}",
                    session.agent_name,
                    session.project_path.display()
                ),
            ));
        }
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).cloned()
    }

    pub fn find_active_session(&self, agent_name: &str, project_path: &Path) -> Option<Session> {
        self.sessions
            .values()
            .find(|session| {
                session.is_active()
                    && session.agent_name == agent_name
                    && session.project_path == project_path
            })
            .cloned()
    }

    pub fn list_active_sessions(&self, project_path: &Path) -> Vec<Session> {
        self.sessions
            .values()
            .filter(|session| session.is_active() && session.project_path == project_path)
            .cloned()
            .collect()
    }

    pub fn heartbeat_session(&mut self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(SlbErr::SessionNotFound(id))?;
        if !session.is_active() {
            return Err(SlbErr::SessionInactive(id));
        }
        session.last_active_at = at;
        Ok(())
    }

    /// Ending an already-ended session is a no-op.
    pub fn end_session(&mut self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(SlbErr::SessionNotFound(id))?;
        if session.ended_at.is_none() {
            session.ended_at = Some(at);
        }
        Ok(())
    }

    pub fn end_stale_sessions(
        &mut self,
        idle_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Vec<SessionId> {
        let mut ended = Vec::new();
        for session in self.sessions.values_mut() {
            if session.is_active() && session.last_active_at < idle_before {
                session.ended_at = Some(at);
                ended.push(session.id);
            }
        }
        ended
    }

    // ---- rate limiting ---------------------------------------------------

    pub fn reset_rate_limits(
        &mut self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if !self.sessions.contains_key(&session_id) {
            return Err(SlbErr::SessionNotFound(session_id));
        }
        self.rate_limit_resets.insert(session_id, at);
        Ok(at)
    }

    pub fn rate_limit_reset_at(&self, session_id: SessionId) -> Option<DateTime<Utc>> {
        self.rate_limit_resets.get(&session_id).copied()
    }

    pub fn count_pending_by_session(&self, session_id: SessionId) -> u32 {
        self.requests
            .values()
            .filter(|request| {
                request.requestor_session_id == session_id
                    && request.status == RequestStatus::Pending
            })
            .count() as u32
    }

    pub fn count_requests_since(&self, session_id: SessionId, since: DateTime<Utc>) -> u32 {
        self.requests
            .values()
            .filter(|request| {
                request.requestor_session_id == session_id && request.created_at > since
            })
            .count() as u32
    }

    pub fn oldest_request_created_at_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.requests
            .values()
            .filter(|request| {
                request.requestor_session_id == session_id && request.created_at > since
            })
            .map(|request| request.created_at)
            .min()
    }

    // ---- requests --------------------------------------------------------

    pub fn create_request(&mut self, request: Request) -> Result<Request> {
        if self.requests.contains_key(&request.id) {
            return Err(SlbErr::Internal(format!(
                "request id collision: {}",
                request.id
            )));
        }
        self.requests.insert(request.id, request.clone());
        Ok(request)
    }

    pub fn get_request(&self, id: RequestId) -> Option<Request> {
        self.requests.get(&id).cloned()
    }

    pub fn list_pending(&self, project_path: &Path) -> Vec<Request> {
        self.requests
            .values()
            .filter(|request| {
                request.status == RequestStatus::Pending && request.project_path == project_path
            })
            .cloned()
            .collect()
    }

    pub fn list_pending_all(&self) -> Vec<Request> {
        self.requests
            .values()
            .filter(|request| request.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    /// Conditional write: succeeds only when the stored status still equals
    /// `expected` and the transition is legal. Exactly one of two racing
    /// transitions can observe `expected`, which is what gives concurrent
    /// resolvers a single winner.
    pub fn update_request_status(
        &mut self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        let request = self.requests.get_mut(&id).ok_or(SlbErr::NotFound)?;
        if request.status != expected {
            return Err(SlbErr::StatusConflict {
                current: request.status,
            });
        }
        if !expected.can_transition_to(next) {
            return Err(SlbErr::validation(
                "status",
                format!("cannot transition {expected} to {next}"),
            ));
        }
        request.status = next;
        if matches!(
            next,
            RequestStatus::Approved
                | RequestStatus::Rejected
                | RequestStatus::Timeout
                | RequestStatus::Cancelled
        ) {
            request.decided_at = Some(at);
        }
        self.pending_audit
            .push(AuditEvent::status_transition(id, expected, next, actor, at));
        Ok(request.clone())
    }

    /// Record the outcome of a run and move `Executing` to its terminal
    /// state in the same transaction.
    pub fn record_execution(
        &mut self,
        id: RequestId,
        result: ExecutionResult,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        let next = if result.succeeded() {
            RequestStatus::Executed
        } else {
            RequestStatus::ExecutionFailed
        };
        {
            let request = self.requests.get_mut(&id).ok_or(SlbErr::NotFound)?;
            if request.status != RequestStatus::Executing {
                return Err(SlbErr::StatusConflict {
                    current: request.status,
                });
            }
            request.executed_at = Some(at);
            request.execution_result = Some(result);
        }
        self.update_request_status(id, RequestStatus::Executing, next, actor, at)
    }

    pub fn set_rollback_path(&mut self, id: RequestId, path: PathBuf) -> Result<()> {
        let request = self.requests.get_mut(&id).ok_or(SlbErr::NotFound)?;
        request.rollback_path = Some(path);
        Ok(())
    }

    // ---- reviews ---------------------------------------------------------

    pub fn insert_review(&mut self, review: Review) -> Result<()> {
        if !self.requests.contains_key(&review.request_id) {
            return Err(SlbErr::NotFound);
        }
        let reviews = self.reviews.entry(review.request_id).or_default();
        if reviews
            .iter()
            .any(|existing| existing.reviewer_session_id == review.reviewer_session_id)
        {
            return Err(SlbErr::AlreadyReviewed {
                request: review.request_id,
                reviewer: review.reviewer_session_id,
            });
        }
        self.pending_audit.push(AuditEvent::review_submitted(&review));
        reviews.push(review);
        Ok(())
    }

    pub fn list_reviews(&self, request_id: RequestId) -> Vec<Review> {
        self.reviews.get(&request_id).cloned().unwrap_or_default()
    }

    pub fn count_approvals(&self, request_id: RequestId) -> u32 {
        self.list_reviews(request_id)
            .iter()
            .filter(|review| review.decision == ReviewDecision::Approve)
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use slb_protocol::CommandSpec;
    use slb_protocol::ErrorKind;
    use slb_protocol::Justification;
    use slb_protocol::RiskTier;

    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn session(agent: &str, project: &str) -> Session {
        Session {
            id: SessionId::new(),
            agent_name: agent.to_string(),
            program: "claude-code".to_string(),
            model: "opus".to_string(),
            project_path: PathBuf::from(project),
            started_at: ts("2026-01-01T00:00:00Z"),
            last_active_at: ts("2026-01-01T00:00:00Z"),
            ended_at: None,
        }
    }

    fn request(requestor: &Session, created_at: DateTime<Utc>) -> Request {
        Request {
            id: RequestId::new(),
            project_path: requestor.project_path.clone(),
            command: CommandSpec::new(
                "rm -rf build".to_string(),
                vec!["rm".into(), "-rf".into(), "build".into()],
                requestor.project_path.clone(),
                false,
                "rm -rf build".to_string(),
                false,
            ),
            risk_tier: RiskTier::Dangerous,
            requestor_session_id: requestor.id,
            requestor_agent: requestor.agent_name.clone(),
            requestor_model: requestor.model.clone(),
            justification: Justification::new("cleanup"),
            attachments: vec![],
            status: RequestStatus::Pending,
            min_approvals: 2,
            require_different_model: false,
            created_at,
            expires_at: created_at + chrono::Duration::minutes(30),
            decided_at: None,
            executed_at: None,
            execution_result: None,
            rollback_path: None,
        }
    }

    #[test]
    fn one_active_session_per_agent_and_project() {
        let mut state = State::default();
        state.create_session(session("alice", "/p")).unwrap();
        let err = state.create_session(session("alice", "/p")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // Same agent in another project is fine, as is another agent here.
        state.create_session(session("alice", "/q")).unwrap();
        state.create_session(session("bob", "/p")).unwrap();

        // Once ended, the name can be reused.
        let old = state.find_active_session("bob", Path::new("/p")).unwrap();
        state.end_session(old.id, ts("2026-01-01T01:00:00Z")).unwrap();
        state.create_session(session("bob", "/p")).unwrap();
    }

    #[test]
    fn stale_sessions_are_garbage_collected() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        let ended =
            state.end_stale_sessions(ts("2026-01-01T00:30:00Z"), ts("2026-01-01T00:31:00Z"));
        assert_eq!(ended, vec![s.id]);
        assert!(!state.get_session(s.id).unwrap().is_active());

        // Already-ended sessions are not reported again.
        let ended =
            state.end_stale_sessions(ts("2026-01-01T00:30:00Z"), ts("2026-01-01T00:32:00Z"));
        assert!(ended.is_empty());
    }

    #[test]
    fn cas_transition_has_exactly_one_winner() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        let req = state
            .create_request(request(&s, ts("2026-01-01T00:01:00Z")))
            .unwrap();

        state
            .update_request_status(
                req.id,
                RequestStatus::Pending,
                RequestStatus::Rejected,
                Some(s.id),
                ts("2026-01-01T00:02:00Z"),
            )
            .unwrap();

        // The racing approval observes the conflict and the current status.
        let err = state
            .update_request_status(
                req.id,
                RequestStatus::Pending,
                RequestStatus::Approved,
                None,
                ts("2026-01-01T00:02:01Z"),
            )
            .unwrap_err();
        match err {
            SlbErr::StatusConflict { current } => assert_eq!(current, RequestStatus::Rejected),
            other => panic!("expected StatusConflict, got {other:?}"),
        }

        // Exactly one audit event per committed transition.
        let audit = state.take_audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].from, Some(RequestStatus::Pending));
        assert_eq!(audit[0].to, Some(RequestStatus::Rejected));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        let req = state
            .create_request(request(&s, ts("2026-01-01T00:01:00Z")))
            .unwrap();
        let err = state
            .update_request_status(
                req.id,
                RequestStatus::Pending,
                RequestStatus::Executed,
                None,
                ts("2026-01-01T00:02:00Z"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn duplicate_review_is_refused() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        let reviewer = state.create_session(session("bob", "/p")).unwrap();
        let req = state
            .create_request(request(&s, ts("2026-01-01T00:01:00Z")))
            .unwrap();

        let review = Review {
            id: slb_protocol::ReviewId::new(),
            request_id: req.id,
            reviewer_session_id: reviewer.id,
            decision: ReviewDecision::Approve,
            reviewer_model: "sonnet".to_string(),
            reviewer_agent: "bob".to_string(),
            comment: None,
            created_at: ts("2026-01-01T00:02:00Z"),
        };
        state.insert_review(review.clone()).unwrap();
        let err = state
            .insert_review(Review {
                id: slb_protocol::ReviewId::new(),
                decision: ReviewDecision::Reject,
                ..review
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyReviewed);
        assert_eq!(state.count_approvals(req.id), 1);
    }

    #[test]
    fn rate_limit_counters_are_derived_from_requests() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        for minute in 0..3 {
            let created = ts("2026-01-01T00:00:00Z") + chrono::Duration::minutes(minute);
            state.create_request(request(&s, created)).unwrap();
        }
        assert_eq!(state.count_pending_by_session(s.id), 3);
        assert_eq!(
            state.count_requests_since(s.id, ts("2026-01-01T00:00:30Z")),
            2
        );
        assert_eq!(
            state.oldest_request_created_at_since(s.id, ts("2026-01-01T00:00:30Z")),
            Some(ts("2026-01-01T00:01:00Z"))
        );
    }

    #[test]
    fn record_execution_sets_terminal_state_from_exit() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        let req = state
            .create_request(request(&s, ts("2026-01-01T00:01:00Z")))
            .unwrap();
        state
            .update_request_status(
                req.id,
                RequestStatus::Pending,
                RequestStatus::Approved,
                None,
                ts("2026-01-01T00:02:00Z"),
            )
            .unwrap();
        state
            .update_request_status(
                req.id,
                RequestStatus::Approved,
                RequestStatus::Executing,
                None,
                ts("2026-01-01T00:03:00Z"),
            )
            .unwrap();
        let updated = state
            .record_execution(
                req.id,
                ExecutionResult {
                    exit_code: 1,
                    duration_ms: 12,
                    timed_out: false,
                    log_path: PathBuf::from("/tmp/log"),
                    output_excerpt: String::new(),
                },
                None,
                ts("2026-01-01T00:03:05Z"),
            )
            .unwrap();
        assert_eq!(updated.status, RequestStatus::ExecutionFailed);
        assert!(updated.executed_at.is_some());
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = State::default();
        let s = state.create_session(session("alice", "/p")).unwrap();
        state
            .create_request(request(&s, ts("2026-01-01T00:01:00Z")))
            .unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back.count_pending_by_session(s.id), 1);
    }
}
