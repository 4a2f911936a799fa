//! Driver-facing assembly of the engine.
//!
//! [`Slb`] wires the creator, resolver, rollback machinery and executor
//! over one store so a thin driver (CLI, daemon, test harness) only has to
//! hold a single handle. Every method is a composition of the underlying
//! components; nothing here adds policy of its own.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use slb_protocol::Request;
use slb_protocol::RequestId;
use slb_protocol::RequestStatus;
use slb_protocol::Result;
use slb_protocol::ReviewDecision;
use slb_protocol::SessionId;
use slb_protocol::SlbErr;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::SlbConfig;
use crate::create::CreateOutcome;
use crate::create::CreateParams;
use crate::create::RequestCreator;
use crate::decision::DecisionReceipt;
use crate::decision::DecisionResolver;
use crate::dry_run;
use crate::dry_run::DryRunResult;
use crate::exec;
use crate::exec::OutputChunk;
use crate::notify::RequestNotifier;
use crate::rollback;
use crate::rollback::RestoreOptions;
use crate::rollback::RollbackCapture;
use crate::rollback::RollbackRestore;
use crate::session::SessionManager;
use crate::store::Store;

pub struct Slb {
    store: Arc<dyn Store>,
    config: SlbConfig,
    sessions: SessionManager,
    creator: RequestCreator,
    resolver: DecisionResolver,
    capture: RollbackCapture,
    restore: RollbackRestore,
}

impl Slb {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn RequestNotifier>,
        config: SlbConfig,
    ) -> Result<Self> {
        let creator = RequestCreator::new(store.clone(), notifier, config.clone())?;
        Ok(Self {
            sessions: SessionManager::new(store.clone()),
            resolver: DecisionResolver::new(store.clone()),
            capture: RollbackCapture::new(config.rollback.clone()),
            restore: RollbackRestore::new(config.execution_timeout()),
            creator,
            store,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn creator(&self) -> &RequestCreator {
        &self.creator
    }

    pub fn resolver(&self) -> &DecisionResolver {
        &self.resolver
    }

    pub async fn submit(&self, params: CreateParams) -> Result<CreateOutcome> {
        self.creator.create(params).await
    }

    pub async fn review(
        &self,
        request_id: RequestId,
        reviewer: SessionId,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> Result<DecisionReceipt> {
        self.resolver
            .submit_decision(request_id, reviewer, decision, comment, Utc::now())
            .await
    }

    /// Run the read-only preview for a request's command.
    pub async fn dry_run(&self, request_id: RequestId) -> Result<DryRunResult> {
        let request = self.request(request_id).await?;
        dry_run::execute_dry_run(
            &request.command.argv,
            &request.command.cwd,
            dry_run::DRY_RUN_TIMEOUT,
        )
        .await
    }

    /// Drive an approved request to completion: capture rollback state when
    /// the command family supports it, transition to `Executing`, run under
    /// the configured timeout, and record the outcome. Returns the request
    /// in its terminal `Executed`/`ExecutionFailed` state.
    pub async fn execute_approved(
        &self,
        request_id: RequestId,
        actor: Option<SessionId>,
        stream: Option<UnboundedSender<OutputChunk>>,
        cancel: Arc<Notify>,
    ) -> Result<Request> {
        let request = self.request(request_id).await?;
        if request.status != RequestStatus::Approved {
            return Err(SlbErr::StatusConflict {
                current: request.status,
            });
        }

        // Capture before anything mutates. A family with no support simply
        // yields no rollback path.
        if let Some(data) = self.capture.capture(&request).await? {
            self.store
                .set_rollback_path(request.id, data.rollback_path.clone())
                .await?;
        }

        let executing = self
            .store
            .update_request_status(
                request.id,
                RequestStatus::Approved,
                RequestStatus::Executing,
                actor,
                Utc::now(),
            )
            .await?;

        let log_path = self.log_path(&executing);
        let mut params = exec::ExecParams::new(executing.command.clone(), log_path.clone());
        params.timeout = self.config.execution_timeout();
        params.stream = stream;
        let outcome = exec::run(params, cancel).await?;

        self.store
            .record_execution(
                request.id,
                outcome.to_execution_result(log_path),
                actor,
                Utc::now(),
            )
            .await
    }

    /// Re-apply the rollback state captured for a request.
    pub async fn roll_back(&self, request_id: RequestId, options: RestoreOptions) -> Result<()> {
        let request = self.request(request_id).await?;
        let dir = request.rollback_path.ok_or(SlbErr::NotFound)?;
        let data = rollback::load_manifest(&dir).await?;
        self.restore.restore(&data, options).await
    }

    /// Periodic maintenance: time out expired requests and end idle
    /// sessions.
    pub async fn maintain(&self) -> Result<Vec<RequestId>> {
        let now = Utc::now();
        let swept = self.resolver.sweep_expired(now).await?;
        self.sessions
            .gc_stale(now, self.config.session_stale_after())
            .await?;
        Ok(swept)
    }

    async fn request(&self, request_id: RequestId) -> Result<Request> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or(SlbErr::NotFound)
    }

    fn log_path(&self, request: &Request) -> PathBuf {
        request
            .project_path
            .join(".slb")
            .join("logs")
            .join(format!("{}.log", request.id))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use slb_protocol::Justification;
    use slb_protocol::RiskTier;
    use slb_protocol::Session;

    use super::*;
    use crate::notify::NoopNotifier;
    use crate::store::MemoryStore;

    async fn broker_in(project: &std::path::Path) -> (Slb, Session, Session, Session) {
        let slb = Slb::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoopNotifier),
            SlbConfig::default(),
        )
        .unwrap();
        let now = Utc::now();
        let alice = slb
            .sessions()
            .resume("alice", "claude-code", "opus", project, now)
            .await
            .unwrap();
        let bob = slb
            .sessions()
            .resume("bob", "claude-code", "sonnet", project, now)
            .await
            .unwrap();
        let carol = slb
            .sessions()
            .resume("carol", "claude-code", "gpt-5", project, now)
            .await
            .unwrap();
        (slb, alice, bob, carol)
    }

    fn submit_params(session: &Session, project: &std::path::Path, command: &str) -> CreateParams {
        CreateParams {
            session_id: session.id,
            command: command.to_string(),
            cwd: project.to_path_buf(),
            shell: true,
            justification: Justification::new("required by the task"),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn approved_rm_captures_executes_and_rolls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let project = dir.path().to_path_buf();
        let (slb, alice, bob, carol) = broker_in(&project).await;

        let victim = project.join("victim");
        std::fs::create_dir(&victim).unwrap();
        std::fs::write(victim.join("data.txt"), "precious").unwrap();

        let outcome = slb
            .submit(submit_params(&alice, &project, "rm -rf victim"))
            .await
            .unwrap();
        let CreateOutcome::Created { request } = outcome else {
            panic!("expected Created");
        };
        assert_eq!(request.risk_tier, RiskTier::Dangerous);

        slb.review(request.id, bob.id, ReviewDecision::Approve, None)
            .await
            .unwrap();
        let receipt = slb
            .review(request.id, carol.id, ReviewDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(receipt.request.status, RequestStatus::Approved);

        let executed = slb
            .execute_approved(request.id, Some(alice.id), None, Arc::new(Notify::new()))
            .await
            .unwrap();
        assert_eq!(executed.status, RequestStatus::Executed);
        assert!(executed.rollback_path.is_some());
        assert!(!victim.exists());
        let result = executed.execution_result.as_ref().unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.log_path.exists());

        // The captured state brings the tree back.
        slb.roll_back(request.id, RestoreOptions { force: true })
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(victim.join("data.txt")).unwrap(),
            "precious"
        );
    }

    #[tokio::test]
    async fn execute_requires_an_approved_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let project = dir.path().to_path_buf();
        let (slb, alice, _bob, _carol) = broker_in(&project).await;

        let outcome = slb
            .submit(submit_params(&alice, &project, "rm -rf scratch"))
            .await
            .unwrap();
        let CreateOutcome::Created { request } = outcome else {
            panic!("expected Created");
        };

        let err = slb
            .execute_approved(request.id, None, None, Arc::new(Notify::new()))
            .await
            .unwrap_err();
        match err {
            SlbErr::StatusConflict { current } => assert_eq!(current, RequestStatus::Pending),
            other => panic!("expected StatusConflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_command_lands_in_execution_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let project = dir.path().to_path_buf();
        let (slb, alice, bob, carol) = broker_in(&project).await;

        // shred has no rollback support and exits nonzero on a missing file.
        let outcome = slb
            .submit(submit_params(&alice, &project, "shred missing.txt"))
            .await
            .unwrap();
        let CreateOutcome::Created { request } = outcome else {
            panic!("expected Created");
        };
        slb.review(request.id, bob.id, ReviewDecision::Approve, None)
            .await
            .unwrap();
        slb.review(request.id, carol.id, ReviewDecision::Approve, None)
            .await
            .unwrap();

        let done = slb
            .execute_approved(request.id, Some(alice.id), None, Arc::new(Notify::new()))
            .await
            .unwrap();
        assert_eq!(done.status, RequestStatus::ExecutionFailed);
    }

    #[tokio::test]
    async fn dry_run_previews_without_mutating() {
        let dir = tempfile::TempDir::new().unwrap();
        let project = dir.path().to_path_buf();
        let (slb, alice, _bob, _carol) = broker_in(&project).await;
        std::fs::write(project.join("keep.txt"), "k").unwrap();

        let outcome = slb
            .submit(submit_params(&alice, &project, "rm -rf keep.txt"))
            .await
            .unwrap();
        let CreateOutcome::Created { request } = outcome else {
            panic!("expected Created");
        };

        let preview = slb.dry_run(request.id).await.unwrap();
        assert_eq!(preview.exit_code, 0);
        assert!(preview.output.contains("keep.txt"));
        // The preview never touched the file.
        assert!(project.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn roll_back_without_a_capture_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let project = dir.path().to_path_buf();
        let (slb, alice, _bob, _carol) = broker_in(&project).await;

        let outcome = slb
            .submit(submit_params(&alice, &project, "shred secrets.txt"))
            .await
            .unwrap();
        let CreateOutcome::Created { request } = outcome else {
            panic!("expected Created");
        };
        let err = slb
            .roll_back(request.id, RestoreOptions { force: true })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), slb_protocol::ErrorKind::NotFound);
    }
}
