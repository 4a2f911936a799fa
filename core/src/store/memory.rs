use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use slb_protocol::AuditEvent;
use slb_protocol::ExecutionResult;
use slb_protocol::Request;
use slb_protocol::RequestId;
use slb_protocol::RequestStatus;
use slb_protocol::Result;
use slb_protocol::Review;
use slb_protocol::Session;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;

use super::Store;
use super::state::State;

#[derive(Default)]
struct Inner {
    state: State,
    audit: Vec<AuditEvent>,
}

/// In-process store. Operations apply to a copy of the state and commit
/// only on success, matching the transactional behavior of [`super::FileStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit log, for assertions in tests.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        match self.inner.lock() {
            Ok(inner) => inner.audit.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SlbErr::Internal("store mutex poisoned".to_string()))?;
        let mut scratch = inner.state.clone();
        let out = f(&mut scratch)?;
        let audit = scratch.take_audit();
        inner.state = scratch;
        inner.audit.extend(audit);
        Ok(out)
    }

    fn read_state<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| SlbErr::Internal("store mutex poisoned".to_string()))?;
        Ok(f(&inner.state))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: Session) -> Result<Session> {
        self.with_state(|state| state.create_session(session))
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        self.read_state(|state| state.get_session(id))
    }

    async fn find_active_session(
        &self,
        agent_name: &str,
        project_path: &Path,
    ) -> Result<Option<Session>> {
        self.read_state(|state| state.find_active_session(agent_name, project_path))
    }

    async fn list_active_sessions(&self, project_path: &Path) -> Result<Vec<Session>> {
        self.read_state(|state| state.list_active_sessions(project_path))
    }

    async fn heartbeat_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| state.heartbeat_session(id, at))
    }

    async fn end_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.with_state(|state| state.end_session(id, at))
    }

    async fn end_stale_sessions(
        &self,
        idle_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<SessionId>> {
        self.with_state(|state| Ok(state.end_stale_sessions(idle_before, at)))
    }

    async fn reset_rate_limits(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.with_state(|state| state.reset_rate_limits(session_id, at))
    }

    async fn rate_limit_reset_at(&self, session_id: SessionId) -> Result<Option<DateTime<Utc>>> {
        self.read_state(|state| state.rate_limit_reset_at(session_id))
    }

    async fn count_pending_by_session(&self, session_id: SessionId) -> Result<u32> {
        self.read_state(|state| state.count_pending_by_session(session_id))
    }

    async fn count_requests_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        self.read_state(|state| state.count_requests_since(session_id, since))
    }

    async fn oldest_request_created_at_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.read_state(|state| state.oldest_request_created_at_since(session_id, since))
    }

    async fn create_request(&self, request: Request) -> Result<Request> {
        self.with_state(|state| state.create_request(request))
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        self.read_state(|state| state.get_request(id))
    }

    async fn list_pending(&self, project_path: &Path) -> Result<Vec<Request>> {
        self.read_state(|state| state.list_pending(project_path))
    }

    async fn list_pending_all(&self) -> Result<Vec<Request>> {
        self.read_state(|state| state.list_pending_all())
    }

    async fn update_request_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        self.with_state(|state| state.update_request_status(id, expected, next, actor, at))
    }

    async fn record_execution(
        &self,
        id: RequestId,
        result: ExecutionResult,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        self.with_state(|state| state.record_execution(id, result, actor, at))
    }

    async fn set_rollback_path(&self, id: RequestId, path: PathBuf) -> Result<()> {
        self.with_state(|state| state.set_rollback_path(id, path))
    }

    async fn insert_review(&self, review: Review) -> Result<()> {
        self.with_state(|state| state.insert_review(review))
    }

    async fn list_reviews(&self, request_id: RequestId) -> Result<Vec<Review>> {
        self.read_state(|state| state.list_reviews(request_id))
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SlbErr::Internal("store mutex poisoned".to_string()))?;
        inner.audit.push(event);
        Ok(())
    }
}
