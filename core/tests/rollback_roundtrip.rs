//! Capture/restore round trips on a real filesystem and a real git repo.

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use pretty_assertions::assert_eq;
use slb_core::RestoreOptions;
use slb_core::RollbackCapture;
use slb_core::RollbackRestore;
use slb_core::config::RollbackConfig;
use slb_core::protocol::CommandSpec;
use slb_core::protocol::Justification;
use slb_core::protocol::Request;
use slb_core::protocol::RequestId;
use slb_core::protocol::RequestStatus;
use slb_core::protocol::RiskTier;
use slb_core::protocol::RollbackKind;
use slb_core::protocol::SessionId;

fn request_for(project: &Path, raw: &str) -> Request {
    let argv = shlex_split(raw);
    Request {
        id: RequestId::new(),
        project_path: project.to_path_buf(),
        command: CommandSpec::new(
            raw.to_string(),
            argv,
            project.to_path_buf(),
            true,
            raw.to_string(),
            false,
        ),
        risk_tier: RiskTier::Dangerous,
        requestor_session_id: SessionId::new(),
        requestor_agent: "alice".to_string(),
        requestor_model: "opus".to_string(),
        justification: Justification::new("cleanup"),
        attachments: vec![],
        status: RequestStatus::Approved,
        min_approvals: 2,
        require_different_model: false,
        created_at: chrono::Utc::now(),
        expires_at: chrono::Utc::now() + chrono::Duration::minutes(30),
        decided_at: None,
        executed_at: None,
        execution_result: None,
        rollback_path: None,
    }
}

fn shlex_split(raw: &str) -> Vec<String> {
    shlex::split(raw).unwrap_or_else(|| raw.split_whitespace().map(str::to_string).collect())
}

#[tokio::test]
async fn filesystem_capture_restores_files_symlinks_and_modes() {
    let dir = tempfile::TempDir::new().unwrap();
    let project = dir.path().to_path_buf();

    // a/x with known contents and mode, a/y -> x as a relative symlink.
    let tree = project.join("a");
    std::fs::create_dir(&tree).unwrap();
    std::fs::write(tree.join("x"), "X").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tree.join("x"), std::fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink("x", tree.join("y")).unwrap();
    }

    let request = request_for(&project, "rm -rf a");
    let capture = RollbackCapture::new(RollbackConfig::default());
    let data = capture.capture(&request).await.unwrap().unwrap();

    assert_eq!(data.kind, RollbackKind::Filesystem);
    let filesystem = data.filesystem.as_ref().unwrap();
    assert_eq!(filesystem.roots.len(), 1);
    assert_eq!(filesystem.roots[0].id, "p0");
    assert_eq!(filesystem.roots[0].path, tree);
    assert_eq!(filesystem.total_bytes, 1);
    assert!(filesystem.missing.is_empty());
    assert!(data.rollback_path.join("files.tar.gz").exists());
    assert!(data.rollback_path.join("metadata.json").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for file in ["files.tar.gz", "metadata.json"] {
            let mode = std::fs::metadata(data.rollback_path.join(file))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600, "{file} should be owner-only");
        }
    }

    // The manifest on disk parses back to the same data.
    let manifest: slb_core::protocol::RollbackData = serde_json::from_slice(
        &std::fs::read(data.rollback_path.join("metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest, data);

    // Simulate the approved rm, then restore into the emptied tree.
    std::fs::remove_dir_all(&tree).unwrap();
    assert!(!tree.exists());

    RollbackRestore::default()
        .restore(&data, RestoreOptions { force: true })
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(tree.join("x")).unwrap(), "X");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(tree.join("x")).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);

        let link = std::fs::symlink_metadata(tree.join("y")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!(std::fs::read_link(tree.join("y")).unwrap(), PathBuf::from("x"));
    }
}

#[tokio::test]
async fn glob_targets_expand_and_missing_paths_are_recorded() {
    let dir = tempfile::TempDir::new().unwrap();
    let project = dir.path().to_path_buf();
    std::fs::write(project.join("one.log"), "1").unwrap();
    std::fs::write(project.join("two.log"), "22").unwrap();

    let request = request_for(&project, "rm -f *.log gone.txt");
    let capture = RollbackCapture::new(RollbackConfig::default());
    let data = capture.capture(&request).await.unwrap().unwrap();

    let filesystem = data.filesystem.as_ref().unwrap();
    let captured: Vec<PathBuf> = filesystem.roots.iter().map(|r| r.path.clone()).collect();
    assert_eq!(captured, vec![project.join("one.log"), project.join("two.log")]);
    assert_eq!(filesystem.total_bytes, 3);
    assert_eq!(filesystem.missing, vec![project.join("gone.txt")]);
}

#[tokio::test]
async fn unsupported_commands_capture_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let project = dir.path().to_path_buf();
    let capture = RollbackCapture::new(RollbackConfig::default());

    for raw in ["dd if=/dev/zero of=x", "helm uninstall api", "rm -rf"] {
        let request = request_for(&project, raw);
        assert!(capture.capture(&request).await.unwrap().is_none(), "{raw}");
    }
}

#[tokio::test]
async fn capture_larger_than_the_cap_fails_and_cleans_up() {
    let dir = tempfile::TempDir::new().unwrap();
    let project = dir.path().to_path_buf();
    std::fs::write(project.join("big.bin"), vec![0u8; 4096]).unwrap();

    let request = request_for(&project, "rm big.bin");
    let capture = RollbackCapture::new(RollbackConfig {
        max_size_bytes: 1024,
        ..RollbackConfig::default()
    });
    let err = capture.capture(&request).await.unwrap_err();
    assert_eq!(err.kind(), slb_core::protocol::ErrorKind::ExceedsMaxSize);

    // The partial capture directory is gone.
    let rollback_base = project.join(".slb/rollback");
    let leftovers: Vec<_> = std::fs::read_dir(&rollback_base)
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty());
}

async fn git(repo: &Path, args: &[&str]) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .envs([
            ("GIT_CONFIG_GLOBAL", "/dev/null"),
            ("GIT_CONFIG_NOSYSTEM", "1"),
        ])
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

async fn init_repo(repo: &Path) {
    git(repo, &["init", "-b", "main"]).await;
    git(repo, &["config", "user.name", "Test User"]).await;
    git(repo, &["config", "user.email", "test@example.com"]).await;
}

#[tokio::test]
async fn git_capture_restores_uncommitted_work_after_a_hard_reset() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let repo = dir.path().to_path_buf();
    init_repo(&repo).await;

    std::fs::write(repo.join("file.txt"), "one\n")?;
    git(&repo, &["add", "."]).await;
    git(&repo, &["commit", "-m", "initial"]).await;

    // Uncommitted work the reset would destroy.
    std::fs::write(repo.join("file.txt"), "two\n")?;

    let request = request_for(&repo, "git reset --hard HEAD");
    let capture = RollbackCapture::new(RollbackConfig::default());
    let data = capture
        .capture(&request)
        .await?
        .context("git commands should capture rollback state")?;

    assert_eq!(data.kind, RollbackKind::Git);
    let git_data = data.git.as_ref().context("manifest should carry a git payload")?;
    assert_eq!(git_data.branch, "main");
    assert_eq!(git_data.head.len(), 40);
    let diff = std::fs::read_to_string(data.rollback_path.join(&git_data.diff_file))?;
    assert!(diff.contains("-one"));
    assert!(diff.contains("+two"));
    let status = std::fs::read_to_string(data.rollback_path.join(&git_data.status_file))?;
    assert!(status.contains("file.txt"));

    // The destructive command runs and flattens the tree.
    git(&repo, &["reset", "--hard", "HEAD"]).await;
    assert_eq!(std::fs::read_to_string(repo.join("file.txt"))?, "one\n");

    // Restore brings the uncommitted change back.
    RollbackRestore::default()
        .restore(&data, RestoreOptions { force: true })
        .await?;
    assert_eq!(std::fs::read_to_string(repo.join("file.txt"))?, "two\n");
    Ok(())
}
