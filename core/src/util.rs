use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use regex::RegexBuilder;
use slb_protocol::Result;
use slb_protocol::SlbErr;
use tokio::process::Command;

/// Compile a pattern that is a compile-time literal. Only for built-in
/// tables; user-supplied patterns go through fallible construction.
pub(crate) fn static_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => panic!("built-in pattern `{pattern}` failed to compile: {e}"),
    }
}

/// Case-insensitive variant of [`static_regex`].
pub(crate) fn static_regex_ci(pattern: &str) -> Regex {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(regex) => regex,
        Err(e) => panic!("built-in pattern `{pattern}` failed to compile: {e}"),
    }
}

/// Normalize a path by removing `.` and resolving `..` without touching the
/// filesystem (works even if the file does not exist).
pub(crate) fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => { /* skip */ }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Run a subprocess to completion with a timeout, capturing its output.
/// The child inherits the environment; stdin is closed so the command
/// cannot hang waiting for input.
pub(crate) async fn run_with_timeout(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
    op: &str,
) -> Result<std::process::Output> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| SlbErr::Timeout { op: op.to_string() })?
        .map_err(|e| SlbErr::io(op.to_string(), e))?;
    Ok(output)
}

/// Map a non-zero exit into [`SlbErr::SubprocessFailed`] carrying the
/// trimmed stderr.
pub(crate) fn ensure_success(output: std::process::Output, op: &str) -> Result<std::process::Output> {
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(SlbErr::subprocess(op, stderr))
    }
}

/// Write a file readable only by the owner. Captured state and manifests
/// may contain project contents, so nothing under the rollback tree is
/// group- or world-readable.
pub(crate) fn write_file_0600(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.flush()
}
