//! Session lifecycle.
//!
//! A session is created on resume and kept alive by heartbeats; sessions
//! that stop heartbeating are garbage collected so their reviews and quorum
//! weight do not linger.

use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use slb_protocol::Result;
use slb_protocol::Session;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;

use crate::store::Store;

pub struct SessionManager {
    store: Arc<dyn Store>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Reuse the agent's active session in this project or create one.
    /// Resuming under a different program is refused rather than silently
    /// forking a second session for the same (agent, project) pair.
    pub async fn resume(
        &self,
        agent_name: &str,
        program: &str,
        model: &str,
        project_path: &Path,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        if agent_name.trim().is_empty() {
            return Err(SlbErr::validation("agent_name", "required"));
        }
        if let Some(existing) = self
            .store
            .find_active_session(agent_name, project_path)
            .await?
        {
            if existing.program != program {
                return Err(SlbErr::SessionProgramMismatch {
                    id: existing.id,
                    expected: existing.program,
                    got: program.to_string(),
                });
            }
            self.store.heartbeat_session(existing.id, now).await?;
            return Ok(Session {
                last_active_at: now,
                ..existing
            });
        }

        self.store
            .create_session(Session {
                id: SessionId::new(),
                agent_name: agent_name.to_string(),
                program: program.to_string(),
                model: model.to_string(),
                project_path: project_path.to_path_buf(),
                started_at: now,
                last_active_at: now,
                ended_at: None,
            })
            .await
    }

    pub async fn heartbeat(&self, id: SessionId, now: DateTime<Utc>) -> Result<()> {
        self.store.heartbeat_session(id, now).await
    }

    pub async fn end(&self, id: SessionId, now: DateTime<Utc>) -> Result<()> {
        self.store.end_session(id, now).await
    }

    /// End sessions whose last heartbeat is older than `stale_after`.
    pub async fn gc_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<SessionId>> {
        self.store.end_stale_sessions(now - stale_after, now).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use slb_protocol::ErrorKind;

    use super::*;
    use crate::store::MemoryStore;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn resume_reuses_the_active_session() {
        let manager = manager();
        let project = PathBuf::from("/p");
        let first = manager
            .resume("alice", "claude-code", "opus", &project, ts("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        let second = manager
            .resume("alice", "claude-code", "opus", &project, ts("2026-01-01T00:05:00Z"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.last_active_at, ts("2026-01-01T00:05:00Z"));
    }

    #[tokio::test]
    async fn resume_with_a_different_program_is_refused() {
        let manager = manager();
        let project = PathBuf::from("/p");
        manager
            .resume("alice", "claude-code", "opus", &project, ts("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        let err = manager
            .resume("alice", "codex", "opus", &project, ts("2026-01-01T00:01:00Z"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionProgramMismatch);
    }

    #[tokio::test]
    async fn ended_sessions_are_replaced_on_resume() {
        let manager = manager();
        let project = PathBuf::from("/p");
        let first = manager
            .resume("alice", "claude-code", "opus", &project, ts("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        manager.end(first.id, ts("2026-01-01T00:10:00Z")).await.unwrap();
        let second = manager
            .resume("alice", "claude-code", "opus", &project, ts("2026-01-01T00:11:00Z"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn gc_ends_idle_sessions_only() {
        let manager = manager();
        let project = PathBuf::from("/p");
        let idle = manager
            .resume("alice", "claude-code", "opus", &project, ts("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        let fresh = manager
            .resume("bob", "claude-code", "sonnet", &project, ts("2026-01-01T00:25:00Z"))
            .await
            .unwrap();

        let ended = manager
            .gc_stale(ts("2026-01-01T00:31:00Z"), chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(ended, vec![idle.id]);
        let _ = fresh;
    }
}
