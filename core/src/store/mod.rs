//! Durable state shared by every agent in a project.
//!
//! The engine only ever talks to the [`Store`] trait. Each operation is
//! atomic and serialized with respect to every other operation; all
//! cross-session ordering in the broker derives from that. Two backends
//! ship here: [`FileStore`] (advisory-locked JSON on disk, safe across
//! processes) and [`MemoryStore`] (for tests and embedded drivers).

mod file;
mod memory;
mod state;

use std::path::Path;
use std::path::PathBuf;

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

pub use file::FileStore;
pub use memory::MemoryStore;
pub use state::State;

#[async_trait]
pub trait Store: Send + Sync {
    // Sessions.
    async fn create_session(&self, session: Session) -> Result<Session>;
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>>;
    async fn find_active_session(
        &self,
        agent_name: &str,
        project_path: &Path,
    ) -> Result<Option<Session>>;
    async fn list_active_sessions(&self, project_path: &Path) -> Result<Vec<Session>>;
    async fn heartbeat_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()>;
    async fn end_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()>;
    /// End every active session idle since before `idle_before`; returns the
    /// sessions that were ended.
    async fn end_stale_sessions(
        &self,
        idle_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<SessionId>>;

    // Rate limiting; counters are derived reads over requests.
    async fn reset_rate_limits(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>>;
    async fn rate_limit_reset_at(&self, session_id: SessionId) -> Result<Option<DateTime<Utc>>>;
    async fn count_pending_by_session(&self, session_id: SessionId) -> Result<u32>;
    async fn count_requests_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Result<u32>;
    async fn oldest_request_created_at_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    // Requests.
    async fn create_request(&self, request: Request) -> Result<Request>;
    async fn get_request(&self, id: RequestId) -> Result<Option<Request>>;
    async fn list_pending(&self, project_path: &Path) -> Result<Vec<Request>>;
    async fn list_pending_all(&self) -> Result<Vec<Request>>;
    /// Compare-and-set status transition; of two racing writers exactly one
    /// commits, the other observes [`slb_protocol::SlbErr::StatusConflict`].
    /// A committed transition appends its audit event in the same
    /// transaction.
    async fn update_request_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request>;
    async fn record_execution(
        &self,
        id: RequestId,
        result: ExecutionResult,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request>;
    async fn set_rollback_path(&self, id: RequestId, path: PathBuf) -> Result<()>;

    // Reviews; unique per (request_id, reviewer_session_id).
    async fn insert_review(&self, review: Review) -> Result<()>;
    async fn list_reviews(&self, request_id: RequestId) -> Result<Vec<Review>>;

    // Audit.
    async fn append_audit(&self, event: AuditEvent) -> Result<()>;
}
