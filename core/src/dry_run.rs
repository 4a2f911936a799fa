//! Safe previews for destructive command families.
//!
//! Reviewers often want to see what a command *would* do before voting.
//! For the supported families the broker derives a read-only preview
//! command and runs it under a bounded timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use slb_protocol::Result;
use slb_protocol::SlbErr;
use tokio::process::Command;

pub const DRY_RUN_TIMEOUT: Duration = Duration::from_secs(30);

const STDERR_SEPARATOR: &str = "--- stderr ---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunResult {
    /// The preview command that actually ran.
    pub command: Vec<String>,
    /// Combined stdout and stderr, stderr prefixed by `--- stderr ---`.
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Map an approved command's argv to its read-only preview, or `None` when
/// no preview exists for the family.
pub fn dry_run_command(argv: &[String]) -> Option<Vec<String>> {
    let first = argv.first().map(String::as_str)?;
    let second = argv.get(1).map(String::as_str);
    match (first, second) {
        ("kubectl", Some("delete")) => {
            if argv.iter().any(|arg| arg.starts_with("--dry-run")) {
                // Already a dry run; it is its own preview.
                return Some(argv.to_vec());
            }
            let mut preview = argv.to_vec();
            preview.push("--dry-run=client".to_string());
            preview.push("-o".to_string());
            preview.push("yaml".to_string());
            Some(preview)
        }
        ("terraform", Some("destroy")) => {
            let mut preview = vec!["terraform".to_string(), "plan".to_string(), "-destroy".to_string()];
            preview.extend(argv[2..].iter().cloned());
            Some(preview)
        }
        ("rm", _) => {
            let paths: Vec<String> = argv[1..]
                .iter()
                .filter(|arg| !arg.starts_with('-'))
                .cloned()
                .collect();
            if paths.is_empty() {
                return None;
            }
            let mut preview = vec!["ls".to_string(), "-la".to_string(), "--".to_string()];
            preview.extend(paths);
            Some(preview)
        }
        ("git", Some("reset")) => {
            let reference = argv[2..]
                .iter()
                .find(|arg| !arg.starts_with('-'))
                .cloned()
                .unwrap_or_else(|| "HEAD".to_string());
            Some(vec![
                "git".to_string(),
                "diff".to_string(),
                format!("{reference}..HEAD"),
            ])
        }
        ("helm", Some("uninstall")) => {
            let release = argv[2..].iter().find(|arg| !arg.starts_with('-'))?;
            Some(vec![
                "helm".to_string(),
                "get".to_string(),
                "manifest".to_string(),
                release.clone(),
            ])
        }
        _ => None,
    }
}

/// Derive and execute the preview. A non-zero preview exit is still a
/// result (the caller surfaces the output either way); only an
/// unsupported family or a spawn failure is an error.
pub async fn execute_dry_run(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<DryRunResult> {
    let preview = dry_run_command(argv).ok_or_else(|| {
        SlbErr::validation("command", "no dry-run preview for this command family")
    })?;

    let mut command = Command::new(&preview[0]);
    command
        .args(&preview[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(SlbErr::io(format!("spawn `{}`", preview.join(" ")), e));
        }
        Err(_) => {
            return Ok(DryRunResult {
                command: preview,
                output: String::new(),
                exit_code: -1,
                timed_out: true,
            });
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(STDERR_SEPARATOR);
        combined.push('\n');
        combined.push_str(&stderr);
    }

    Ok(DryRunResult {
        command: preview,
        output: combined,
        exit_code: output.status.code().unwrap_or(-1),
        timed_out: false,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn argv(raw: &str) -> Vec<String> {
        shlex::split(raw).unwrap()
    }

    fn preview(raw: &str) -> Option<Vec<String>> {
        dry_run_command(&argv(raw))
    }

    #[test]
    fn kubectl_delete_gets_client_dry_run_appended() {
        assert_eq!(
            preview("kubectl delete pod nginx-abc").unwrap(),
            argv("kubectl delete pod nginx-abc --dry-run=client -o yaml")
        );
    }

    #[test]
    fn kubectl_delete_with_existing_dry_run_is_unchanged() {
        let raw = "kubectl delete pod nginx-abc --dry-run=server";
        assert_eq!(preview(raw).unwrap(), argv(raw));
    }

    #[test]
    fn terraform_destroy_becomes_plan_destroy() {
        assert_eq!(
            preview("terraform destroy -target=aws_instance.web").unwrap(),
            argv("terraform plan -destroy -target=aws_instance.web")
        );
    }

    #[test]
    fn rm_lists_its_targets() {
        assert_eq!(
            preview("rm -rf build dist").unwrap(),
            argv("ls -la -- build dist")
        );
        // rm with no path targets has nothing to preview.
        assert_eq!(preview("rm -rf"), None);
    }

    #[test]
    fn git_reset_previews_the_diff_against_the_ref() {
        assert_eq!(
            preview("git reset --hard HEAD~2").unwrap(),
            argv("git diff HEAD~2..HEAD")
        );
        assert_eq!(preview("git reset --hard").unwrap(), argv("git diff HEAD..HEAD"));
    }

    #[test]
    fn helm_uninstall_previews_the_manifest() {
        assert_eq!(
            preview("helm uninstall prod-api").unwrap(),
            argv("helm get manifest prod-api")
        );
    }

    #[test]
    fn unsupported_families_have_no_preview() {
        assert_eq!(preview("dd if=/dev/zero of=/dev/sda"), None);
        assert_eq!(preview("shred secrets.txt"), None);
        assert_eq!(preview("kubectl get pods"), None);
        assert_eq!(preview("git clean -fd"), None);
    }

    #[tokio::test]
    async fn executing_the_rm_preview_lists_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("victim.txt"), "x").unwrap();

        let result = execute_dry_run(&argv("rm -rf victim.txt"), dir.path(), DRY_RUN_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert!(result.output.contains("victim.txt"));
    }

    #[tokio::test]
    async fn preview_failure_still_returns_the_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = execute_dry_run(&argv("rm -rf missing.txt"), dir.path(), DRY_RUN_TIMEOUT)
            .await
            .unwrap();
        assert_ne!(result.exit_code, 0);
        assert!(result.output.contains(STDERR_SEPARATOR));
    }

    #[tokio::test]
    async fn unsupported_family_is_a_validation_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = execute_dry_run(&argv("shred secrets.txt"), dir.path(), DRY_RUN_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), slb_protocol::ErrorKind::Validation);
    }
}
