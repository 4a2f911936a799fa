//! Review intake and quorum resolution.
//!
//! Reviews are linearized by the store's unique index per
//! (request, reviewer); status changes go through compare-and-set, so a
//! simultaneous reject and quorum-reaching approve resolve to whichever
//! commits first. The loser observes `StatusConflict` and reports it.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use slb_protocol::Request;
use slb_protocol::RequestId;
use slb_protocol::RequestStatus;
use slb_protocol::Result;
use slb_protocol::Review;
use slb_protocol::ReviewDecision;
use slb_protocol::ReviewId;
use slb_protocol::RiskTier;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;

use crate::store::Store;

/// What a submitted decision did to the request. `request.status` is
/// `Pending` when more approvals are still needed.
#[derive(Debug, Clone)]
pub struct DecisionReceipt {
    pub request: Request,
    pub review: Review,
}

pub struct DecisionResolver {
    store: Arc<dyn Store>,
}

impl DecisionResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn submit_decision(
        &self,
        request_id: RequestId,
        reviewer_session_id: SessionId,
        decision: ReviewDecision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DecisionReceipt> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(SlbErr::NotFound)?;
        if request.status != RequestStatus::Pending {
            return Err(SlbErr::StatusConflict {
                current: request.status,
            });
        }
        if now >= request.expires_at {
            // Sweep the request on the way out; losing that race to another
            // sweeper changes nothing about the answer.
            match self
                .store
                .update_request_status(
                    request_id,
                    RequestStatus::Pending,
                    RequestStatus::Timeout,
                    None,
                    now,
                )
                .await
            {
                Ok(_) | Err(SlbErr::StatusConflict { .. }) => {}
                Err(e) => return Err(e),
            }
            return Err(SlbErr::Expired(request_id));
        }

        let reviewer = self
            .store
            .get_session(reviewer_session_id)
            .await?
            .ok_or(SlbErr::SessionNotFound(reviewer_session_id))?;
        if !reviewer.is_active() {
            return Err(SlbErr::SessionInactive(reviewer.id));
        }
        if reviewer.project_path != request.project_path {
            return Err(SlbErr::validation(
                "project",
                "reviewer is not active in this project",
            ));
        }
        if reviewer.id == request.requestor_session_id {
            return Err(SlbErr::validation(
                "reviewer",
                "requestor cannot review their own request",
            ));
        }

        let prior = self.store.list_reviews(request_id).await?;
        let prior_approvers: Vec<&Review> = prior
            .iter()
            .filter(|review| review.decision == ReviewDecision::Approve)
            .collect();

        if request.require_different_model {
            if reviewer.model == request.requestor_model {
                return Err(SlbErr::validation("model", "duplicate-with-requestor"));
            }
            if prior_approvers
                .iter()
                .any(|approver| approver.reviewer_model == reviewer.model)
            {
                return Err(SlbErr::validation("model", "duplicate-with-prior-approver"));
            }
        }
        if request.risk_tier == RiskTier::Critical {
            if reviewer.agent_name == request.requestor_agent {
                return Err(SlbErr::validation("agent", "duplicate-with-requestor"));
            }
            if prior_approvers
                .iter()
                .any(|approver| approver.reviewer_agent == reviewer.agent_name)
            {
                return Err(SlbErr::validation("agent", "duplicate-with-prior-approver"));
            }
        }

        let review = Review {
            id: ReviewId::new(),
            request_id,
            reviewer_session_id,
            decision,
            reviewer_model: reviewer.model.clone(),
            reviewer_agent: reviewer.agent_name.clone(),
            comment,
            created_at: now,
        };
        self.store.insert_review(review.clone()).await?;

        match decision {
            ReviewDecision::Reject => {
                let request = self
                    .store
                    .update_request_status(
                        request_id,
                        RequestStatus::Pending,
                        RequestStatus::Rejected,
                        Some(reviewer.id),
                        now,
                    )
                    .await?;
                tracing::info!(request = %request.id, reviewer = %reviewer.id, "request rejected");
                Ok(DecisionReceipt { request, review })
            }
            ReviewDecision::Approve => {
                let approvals = self
                    .store
                    .list_reviews(request_id)
                    .await?
                    .iter()
                    .filter(|r| r.decision == ReviewDecision::Approve)
                    .count() as u32;
                if approvals >= request.min_approvals {
                    let request = self
                        .store
                        .update_request_status(
                            request_id,
                            RequestStatus::Pending,
                            RequestStatus::Approved,
                            Some(reviewer.id),
                            now,
                        )
                        .await?;
                    tracing::info!(
                        request = %request.id,
                        approvals,
                        "quorum reached; request approved"
                    );
                    Ok(DecisionReceipt { request, review })
                } else {
                    let request = self
                        .store
                        .get_request(request_id)
                        .await?
                        .ok_or(SlbErr::NotFound)?;
                    Ok(DecisionReceipt { request, review })
                }
            }
        }
    }

    /// Requestor withdraws their own pending request.
    pub async fn cancel(
        &self,
        request_id: RequestId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(SlbErr::NotFound)?;
        if request.requestor_session_id != session_id {
            return Err(SlbErr::validation(
                "session",
                "only the requestor can cancel a request",
            ));
        }
        self.store
            .update_request_status(
                request_id,
                RequestStatus::Pending,
                RequestStatus::Cancelled,
                Some(session_id),
                now,
            )
            .await
    }

    /// Hand a stuck request to a human administrator.
    pub async fn escalate(
        &self,
        request_id: RequestId,
        actor: Option<SessionId>,
        now: DateTime<Utc>,
    ) -> Result<Request> {
        self.store
            .update_request_status(
                request_id,
                RequestStatus::Pending,
                RequestStatus::Escalated,
                actor,
                now,
            )
            .await
    }

    /// Transition every pending request past its deadline to `Timeout`.
    /// Races with concurrent decisions are benign: the CAS loser skips.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>> {
        let mut swept = Vec::new();
        for request in self.store.list_pending_all().await? {
            if request.expires_at > now {
                continue;
            }
            match self
                .store
                .update_request_status(
                    request.id,
                    RequestStatus::Pending,
                    RequestStatus::Timeout,
                    None,
                    now,
                )
                .await
            {
                Ok(_) => swept.push(request.id),
                Err(SlbErr::StatusConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use slb_protocol::CommandSpec;
    use slb_protocol::ErrorKind;
    use slb_protocol::Justification;
    use slb_protocol::Session;

    use super::*;
    use crate::store::MemoryStore;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    async fn seed_session(store: &MemoryStore, agent: &str, model: &str) -> Session {
        store
            .create_session(Session {
                id: SessionId::new(),
                agent_name: agent.to_string(),
                program: "claude-code".to_string(),
                model: model.to_string(),
                project_path: PathBuf::from("/p"),
                started_at: ts("2026-01-01T00:00:00Z"),
                last_active_at: ts("2026-01-01T00:00:00Z"),
                ended_at: None,
            })
            .await
            .unwrap()
    }

    async fn seed_request(
        store: &MemoryStore,
        requestor: &Session,
        tier: RiskTier,
        min_approvals: u32,
    ) -> Request {
        store
            .create_request(Request {
                id: RequestId::new(),
                project_path: requestor.project_path.clone(),
                command: CommandSpec::new(
                    "rm -rf /var/log".to_string(),
                    vec!["rm".into(), "-rf".into(), "/var/log".into()],
                    requestor.project_path.clone(),
                    false,
                    "rm -rf /var/log".to_string(),
                    false,
                ),
                risk_tier: tier,
                requestor_session_id: requestor.id,
                requestor_agent: requestor.agent_name.clone(),
                requestor_model: requestor.model.clone(),
                justification: Justification::new("rotate logs"),
                attachments: vec![],
                status: RequestStatus::Pending,
                min_approvals,
                require_different_model: tier == RiskTier::Critical,
                created_at: ts("2026-01-01T00:00:00Z"),
                expires_at: ts("2026-01-01T00:30:00Z"),
                decided_at: None,
                executed_at: None,
                execution_result: None,
                rollback_path: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn quorum_of_two_approves_on_the_second_vote() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let bob = seed_session(&store, "bob", "sonnet").await;
        let carol = seed_session(&store, "carol", "gpt-5").await;
        let request = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let resolver = DecisionResolver::new(store.clone());

        let receipt = resolver
            .submit_decision(
                request.id,
                bob.id,
                ReviewDecision::Approve,
                None,
                ts("2026-01-01T00:05:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(receipt.request.status, RequestStatus::Pending);

        let receipt = resolver
            .submit_decision(
                request.id,
                carol.id,
                ReviewDecision::Approve,
                Some("looks fine".to_string()),
                ts("2026-01-01T00:06:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(receipt.request.status, RequestStatus::Approved);
        assert_eq!(receipt.request.decided_at, Some(ts("2026-01-01T00:06:00Z")));
    }

    #[tokio::test]
    async fn any_reject_terminates_the_request() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let bob = seed_session(&store, "bob", "sonnet").await;
        let carol = seed_session(&store, "carol", "gpt-5").await;
        let request = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let resolver = DecisionResolver::new(store.clone());

        resolver
            .submit_decision(
                request.id,
                bob.id,
                ReviewDecision::Reject,
                Some("too broad".to_string()),
                ts("2026-01-01T00:05:00Z"),
            )
            .await
            .unwrap();

        // A later approval observes the conflict and the real status.
        let err = resolver
            .submit_decision(
                request.id,
                carol.id,
                ReviewDecision::Approve,
                None,
                ts("2026-01-01T00:06:00Z"),
            )
            .await
            .unwrap_err();
        match err {
            SlbErr::StatusConflict { current } => assert_eq!(current, RequestStatus::Rejected),
            other => panic!("expected StatusConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requestor_cannot_review_and_duplicates_are_refused() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let bob = seed_session(&store, "bob", "sonnet").await;
        let request = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let resolver = DecisionResolver::new(store.clone());

        let err = resolver
            .submit_decision(
                request.id,
                requestor.id,
                ReviewDecision::Approve,
                None,
                ts("2026-01-01T00:05:00Z"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        resolver
            .submit_decision(
                request.id,
                bob.id,
                ReviewDecision::Approve,
                None,
                ts("2026-01-01T00:06:00Z"),
            )
            .await
            .unwrap();
        let err = resolver
            .submit_decision(
                request.id,
                bob.id,
                ReviewDecision::Approve,
                None,
                ts("2026-01-01T00:07:00Z"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyReviewed);
    }

    #[tokio::test]
    async fn critical_quorum_enforces_model_and_agent_diversity() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "A", "opus").await;
        let b = seed_session(&store, "B", "gpt-5").await;
        let c = seed_session(&store, "C", "sonnet").await;
        let d = seed_session(&store, "D", "gpt-5").await;
        let request = seed_request(&store, &requestor, RiskTier::Critical, 3).await;
        let resolver = DecisionResolver::new(store.clone());

        resolver
            .submit_decision(request.id, b.id, ReviewDecision::Approve, None, ts("2026-01-01T00:01:00Z"))
            .await
            .unwrap();
        resolver
            .submit_decision(request.id, c.id, ReviewDecision::Approve, None, ts("2026-01-01T00:02:00Z"))
            .await
            .unwrap();

        // Third approver shares a model with the first; the vote is refused
        // and the request stays pending.
        let err = resolver
            .submit_decision(request.id, d.id, ReviewDecision::Approve, None, ts("2026-01-01T00:03:00Z"))
            .await
            .unwrap_err();
        match err {
            SlbErr::Validation { field, reason } => {
                assert_eq!(field, "model");
                assert_eq!(reason, "duplicate-with-prior-approver");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        let current = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(current.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn critical_quorum_refuses_same_model_as_requestor() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "A", "opus").await;
        let twin = seed_session(&store, "B", "opus").await;
        let request = seed_request(&store, &requestor, RiskTier::Critical, 3).await;
        let resolver = DecisionResolver::new(store.clone());

        let err = resolver
            .submit_decision(request.id, twin.id, ReviewDecision::Approve, None, ts("2026-01-01T00:01:00Z"))
            .await
            .unwrap_err();
        match err {
            SlbErr::Validation { field, reason } => {
                assert_eq!(field, "model");
                assert_eq!(reason, "duplicate-with-requestor");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reviewer_from_another_project_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let outsider = store
            .create_session(Session {
                id: SessionId::new(),
                agent_name: "eve".to_string(),
                program: "claude-code".to_string(),
                model: "sonnet".to_string(),
                project_path: PathBuf::from("/other"),
                started_at: ts("2026-01-01T00:00:00Z"),
                last_active_at: ts("2026-01-01T00:00:00Z"),
                ended_at: None,
            })
            .await
            .unwrap();
        let request = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let resolver = DecisionResolver::new(store.clone());

        let err = resolver
            .submit_decision(request.id, outsider.id, ReviewDecision::Approve, None, ts("2026-01-01T00:01:00Z"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn expired_request_times_out_on_decision() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let bob = seed_session(&store, "bob", "sonnet").await;
        let request = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let resolver = DecisionResolver::new(store.clone());

        let err = resolver
            .submit_decision(
                request.id,
                bob.id,
                ReviewDecision::Approve,
                None,
                ts("2026-01-01T01:00:00Z"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);
        let current = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(current.status, RequestStatus::Timeout);
    }

    #[tokio::test]
    async fn sweep_times_out_only_expired_pending_requests() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let expired = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let mut fresh = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        fresh.expires_at = ts("2026-01-01T02:00:00Z");
        // Recreate with a later deadline by writing a fresh request.
        let fresh = store
            .create_request(Request {
                id: RequestId::new(),
                ..fresh
            })
            .await
            .unwrap();

        let resolver = DecisionResolver::new(store.clone());
        let swept = resolver.sweep_expired(ts("2026-01-01T01:00:00Z")).await.unwrap();
        assert_eq!(swept, vec![expired.id]);
        assert_eq!(
            store.get_request(fresh.id).await.unwrap().unwrap().status,
            RequestStatus::Pending
        );
        assert_eq!(
            store.get_request(expired.id).await.unwrap().unwrap().status,
            RequestStatus::Timeout
        );
    }

    #[tokio::test]
    async fn cancel_is_requestor_only_and_escalate_leaves_pending_states() {
        let store = Arc::new(MemoryStore::new());
        let requestor = seed_session(&store, "alice", "opus").await;
        let bob = seed_session(&store, "bob", "sonnet").await;
        let request = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let resolver = DecisionResolver::new(store.clone());

        let err = resolver
            .cancel(request.id, bob.id, ts("2026-01-01T00:01:00Z"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let cancelled = resolver
            .cancel(request.id, requestor.id, ts("2026-01-01T00:02:00Z"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);

        let other = seed_request(&store, &requestor, RiskTier::Dangerous, 2).await;
        let escalated = resolver
            .escalate(other.id, None, ts("2026-01-01T00:03:00Z"))
            .await
            .unwrap();
        assert_eq!(escalated.status, RequestStatus::Escalated);
    }
}
