//! Disk-backed store shared by every agent process in a project.
//!
//! Layout under the store directory:
//!
//! ```text
//! .slb/store/
//!   store.lock   advisory lock serializing every operation
//!   state.json   sessions, requests, reviews, rate-limit resets
//!   audit.jsonl  append-only audit log, one JSON object per line
//! ```
//!
//! Every operation takes the exclusive lock, loads `state.json`, applies
//! the mutation to the in-memory [`State`], rewrites the file through a
//! temp file + atomic rename, and appends any audit lines with a single
//! `write(2)`. Failures before the rename leave the previous state intact,
//! which is what gives each operation its all-or-nothing behavior.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

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

const STATE_FILENAME: &str = "state.json";
const AUDIT_FILENAME: &str = "audit.jsonl";
const LOCK_FILENAME: &str = "store.lock";

const LOCK_MAX_RETRIES: usize = 10;
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(100);

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SlbErr::io("create store directory", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILENAME)
    }

    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> Result<T> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let lock = acquire_lock(&root)?;
            let state_path = root.join(STATE_FILENAME);
            let mut state = load_state(&state_path)?;
            let out = f(&mut state)?;
            let audit = state.take_audit();
            persist_state(&root, &state_path, &state)?;
            append_audit_lines(&root, &audit)?;
            drop(lock);
            Ok(out)
        })
        .await
        .map_err(|e| SlbErr::Internal(format!("store task failed: {e}")))?
    }

    /// Read-only variant; still takes the lock so readers never observe a
    /// half-written state file from another process.
    async fn read_state<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&State) -> T + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let lock = acquire_lock(&root)?;
            let state = load_state(&root.join(STATE_FILENAME))?;
            let out = f(&state);
            drop(lock);
            Ok(out)
        })
        .await
        .map_err(|e| SlbErr::Internal(format!("store task failed: {e}")))?
    }
}

/// Acquire the exclusive advisory lock, retrying a bounded number of times
/// rather than waiting indefinitely on a stuck peer.
fn acquire_lock(root: &Path) -> Result<File> {
    let path = root.join(LOCK_FILENAME);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options
        .open(&path)
        .map_err(|e| SlbErr::io("open store lock", e))?;

    for _ in 0..LOCK_MAX_RETRIES {
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(LOCK_RETRY_SLEEP);
            }
            Err(e) => return Err(SlbErr::io("lock store", e)),
        }
    }
    Err(SlbErr::io(
        "lock store",
        std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "could not acquire exclusive store lock after multiple attempts",
        ),
    ))
}

fn load_state(path: &Path) -> Result<State> {
    match std::fs::read(path) {
        Ok(bytes) => {
            serde_json::from_slice(&bytes).map_err(|e| SlbErr::Internal(format!(
                "corrupt store state at {}: {e}",
                path.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(State::default()),
        Err(e) => Err(SlbErr::io("read store state", e)),
    }
}

fn persist_state(root: &Path, state_path: &Path, state: &State) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(root)
        .map_err(|e| SlbErr::io("create store temp file", e))?;
    serde_json::to_writer(&mut tmp, state)
        .map_err(|e| SlbErr::Internal(format!("serialize store state: {e}")))?;
    tmp.flush().map_err(|e| SlbErr::io("flush store state", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tmp.as_file()
            .set_permissions(perms)
            .map_err(|e| SlbErr::io("set store state permissions", e))?;
    }
    tmp.persist(state_path)
        .map_err(|e| SlbErr::io("persist store state", e.error))?;
    Ok(())
}

/// Append audit lines with one `write(2)` per event so concurrent
/// processes never interleave partial lines.
fn append_audit_lines(root: &Path, events: &[AuditEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(root.join(AUDIT_FILENAME))
        .map_err(|e| SlbErr::io("open audit log", e))?;
    for event in events {
        let mut line = serde_json::to_string(event)
            .map_err(|e| SlbErr::Internal(format!("serialize audit event: {e}")))?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|e| SlbErr::io("append audit log", e))?;
    }
    file.flush().map_err(|e| SlbErr::io("flush audit log", e))
}

#[async_trait]
impl Store for FileStore {
    async fn create_session(&self, session: Session) -> Result<Session> {
        self.with_state(move |state| state.create_session(session)).await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        self.read_state(move |state| state.get_session(id)).await
    }

    async fn find_active_session(
        &self,
        agent_name: &str,
        project_path: &Path,
    ) -> Result<Option<Session>> {
        let agent_name = agent_name.to_string();
        let project_path = project_path.to_path_buf();
        self.read_state(move |state| state.find_active_session(&agent_name, &project_path))
            .await
    }

    async fn list_active_sessions(&self, project_path: &Path) -> Result<Vec<Session>> {
        let project_path = project_path.to_path_buf();
        self.read_state(move |state| state.list_active_sessions(&project_path))
            .await
    }

    async fn heartbeat_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.with_state(move |state| state.heartbeat_session(id, at)).await
    }

    async fn end_session(&self, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.with_state(move |state| state.end_session(id, at)).await
    }

    async fn end_stale_sessions(
        &self,
        idle_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<SessionId>> {
        self.with_state(move |state| Ok(state.end_stale_sessions(idle_before, at)))
            .await
    }

    async fn reset_rate_limits(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        self.with_state(move |state| state.reset_rate_limits(session_id, at))
            .await
    }

    async fn rate_limit_reset_at(&self, session_id: SessionId) -> Result<Option<DateTime<Utc>>> {
        self.read_state(move |state| state.rate_limit_reset_at(session_id))
            .await
    }

    async fn count_pending_by_session(&self, session_id: SessionId) -> Result<u32> {
        self.read_state(move |state| state.count_pending_by_session(session_id))
            .await
    }

    async fn count_requests_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Result<u32> {
        self.read_state(move |state| state.count_requests_since(session_id, since))
            .await
    }

    async fn oldest_request_created_at_since(
        &self,
        session_id: SessionId,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.read_state(move |state| state.oldest_request_created_at_since(session_id, since))
            .await
    }

    async fn create_request(&self, request: Request) -> Result<Request> {
        self.with_state(move |state| state.create_request(request)).await
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        self.read_state(move |state| state.get_request(id)).await
    }

    async fn list_pending(&self, project_path: &Path) -> Result<Vec<Request>> {
        let project_path = project_path.to_path_buf();
        self.read_state(move |state| state.list_pending(&project_path))
            .await
    }

    async fn list_pending_all(&self) -> Result<Vec<Request>> {
        self.read_state(|state| state.list_pending_all()).await
    }

    async fn update_request_status(
        &self,
        id: RequestId,
        expected: RequestStatus,
        next: RequestStatus,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        self.with_state(move |state| state.update_request_status(id, expected, next, actor, at))
            .await
    }

    async fn record_execution(
        &self,
        id: RequestId,
        result: ExecutionResult,
        actor: Option<SessionId>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        self.with_state(move |state| state.record_execution(id, result, actor, at))
            .await
    }

    async fn set_rollback_path(&self, id: RequestId, path: PathBuf) -> Result<()> {
        self.with_state(move |state| state.set_rollback_path(id, path))
            .await
    }

    async fn insert_review(&self, review: Review) -> Result<()> {
        self.with_state(move |state| state.insert_review(review)).await
    }

    async fn list_reviews(&self, request_id: RequestId) -> Result<Vec<Review>> {
        self.read_state(move |state| state.list_reviews(request_id))
            .await
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let lock = acquire_lock(&root)?;
            append_audit_lines(&root, std::slice::from_ref(&event))?;
            drop(lock);
            Ok(())
        })
        .await
        .map_err(|e| SlbErr::Internal(format!("store task failed: {e}")))?
    }
}
