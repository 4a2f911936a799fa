//! Rollback restore.
//!
//! Restore re-applies a captured manifest. Archive entries resolve through
//! the manifest's root table only; any entry whose path would land outside
//! its declared root, or whose parent chain contains a symlink, is refused
//! outright.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use flate2::read::GzDecoder;
use slb_protocol::GitRollback;
use slb_protocol::KubernetesRollback;
use slb_protocol::Result;
use slb_protocol::RollbackData;
use slb_protocol::RollbackKind;
use slb_protocol::SlbErr;

use crate::config::DEFAULT_EXECUTION_TIMEOUT;
use crate::util::ensure_success;
use crate::util::lexical_normalize;
use crate::util::run_with_timeout;

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Allow overwriting files that exist at the destination. Git restore
    /// always requires this.
    pub force: bool,
}

pub struct RollbackRestore {
    /// Each restore phase runs under twice the execution timeout.
    phase_timeout: Duration,
}

impl Default for RollbackRestore {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_TIMEOUT)
    }
}

impl RollbackRestore {
    pub fn new(execution_timeout: Duration) -> Self {
        Self {
            phase_timeout: execution_timeout * 2,
        }
    }

    pub async fn restore(&self, data: &RollbackData, options: RestoreOptions) -> Result<()> {
        match data.kind {
            RollbackKind::Filesystem => self.restore_filesystem(data, options).await,
            RollbackKind::Git => self.restore_git(data, options).await,
            RollbackKind::Kubernetes => self.restore_kubernetes(data).await,
        }
    }

    async fn restore_filesystem(&self, data: &RollbackData, options: RestoreOptions) -> Result<()> {
        let filesystem = data.filesystem.clone().ok_or_else(|| {
            SlbErr::validation("manifest", "kind is filesystem but payload is missing")
        })?;
        let tar_path = data.rollback_path.join(&filesystem.tar_gz);
        let roots: BTreeMap<String, PathBuf> = filesystem
            .roots
            .iter()
            .map(|root| (root.id.clone(), root.path.clone()))
            .collect();
        let force = options.force;

        let task = tokio::task::spawn_blocking(move || {
            extract_archive(&tar_path, &roots, force)
        });
        tokio::time::timeout(self.phase_timeout, task)
            .await
            .map_err(|_| SlbErr::Timeout {
                op: "filesystem restore".to_string(),
            })?
            .map_err(|e| SlbErr::Internal(format!("restore task failed: {e}")))?
    }

    async fn restore_git(&self, data: &RollbackData, options: RestoreOptions) -> Result<()> {
        let git = data.git.as_ref().ok_or_else(|| {
            SlbErr::validation("manifest", "kind is git but payload is missing")
        })?;
        if !options.force {
            return Err(SlbErr::validation(
                "force",
                "git restore rewrites the working tree; pass force",
            ));
        }
        self.apply_git(data, git).await
    }

    async fn apply_git(&self, data: &RollbackData, git: &GitRollback) -> Result<()> {
        let repo = git.repo_root.as_path();

        // Best effort: the branch may be gone or we may have been detached.
        if !git.branch.is_empty() && git.branch != "HEAD" {
            let _ = run_with_timeout(
                "git",
                &["checkout", &git.branch],
                Some(repo),
                self.phase_timeout,
                "git checkout",
            )
            .await;
        }

        let output = run_with_timeout(
            "git",
            &["reset", "--hard", &git.head],
            Some(repo),
            self.phase_timeout,
            "git reset --hard",
        )
        .await?;
        ensure_success(output, "git reset --hard")?;

        for (file, cached) in [(&git.cached_file, true), (&git.diff_file, false)] {
            let patch = data.rollback_path.join(file);
            if !patch_has_content(&patch) {
                continue;
            }
            let patch_str = patch.to_string_lossy().into_owned();
            let mut args = vec!["apply"];
            if cached {
                args.push("--cached");
            }
            args.push(&patch_str);
            let op = if cached { "git apply --cached" } else { "git apply" };
            let output =
                run_with_timeout("git", &args, Some(repo), self.phase_timeout, op).await?;
            ensure_success(output, op)?;
        }
        Ok(())
    }

    async fn restore_kubernetes(&self, data: &RollbackData) -> Result<()> {
        let k8s: &KubernetesRollback = data.kubernetes.as_ref().ok_or_else(|| {
            SlbErr::validation("manifest", "kind is kubernetes but payload is missing")
        })?;
        for manifest in &k8s.manifests {
            let path = data.rollback_path.join(manifest);
            let path_str = path.to_string_lossy().into_owned();
            let mut args = vec!["apply", "-f", path_str.as_str()];
            if !k8s.namespace.is_empty() {
                args.push("-n");
                args.push(&k8s.namespace);
            }
            let op = format!("kubectl apply -f {manifest}");
            let output = run_with_timeout("kubectl", &args, None, self.phase_timeout, &op).await?;
            // The first failing manifest aborts the whole restore.
            ensure_success(output, &op)?;
        }
        Ok(())
    }
}

/// Missing or empty patches are skipped, not errors.
fn patch_has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false)
}

fn extract_archive(
    tar_path: &Path,
    roots: &BTreeMap<String, PathBuf>,
    force: bool,
) -> Result<()> {
    let file = File::open(tar_path)
        .map_err(|e| SlbErr::io(format!("open {}", tar_path.display()), e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive
        .entries()
        .map_err(|e| SlbErr::io("read rollback archive", e))?
    {
        let mut entry = entry.map_err(|e| SlbErr::io("read rollback archive", e))?;
        let entry_path = entry
            .path()
            .map_err(|e| SlbErr::io("read rollback archive", e))?
            .into_owned();
        let (root, dest) = resolve_entry_destination(&entry_path, roots)?;
        refuse_symlinked_parents(&root, &dest)?;
        extract_entry(&mut entry, &dest, force)?;
    }
    Ok(())
}

/// Map a tar entry name to its destination through the manifest's root
/// table. Entry names are `<root-id>[/<relative path>]`; anything else is
/// hostile and refused.
fn resolve_entry_destination(
    entry_path: &Path,
    roots: &BTreeMap<String, PathBuf>,
) -> Result<(PathBuf, PathBuf)> {
    let reject = |why: &str| {
        SlbErr::validation(
            "archive",
            format!("entry `{}` {why}", entry_path.display()),
        )
    };

    let mut components = entry_path.components();
    let root_id = match components.next() {
        Some(Component::Normal(part)) => part
            .to_str()
            .ok_or_else(|| reject("has a non-UTF-8 root id"))?,
        _ => return Err(reject("does not start with a root id")),
    };
    let root = roots
        .get(root_id)
        .ok_or_else(|| reject("references an unknown root id"))?;

    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| reject("is not UTF-8"))?;
                if part.contains('\\') || part == ".." {
                    return Err(reject("escapes its root"));
                }
                relative.push(part);
            }
            // Absolute markers and `..` never appear in honest archives.
            _ => return Err(reject("escapes its root")),
        }
    }

    let dest = if relative.as_os_str().is_empty() {
        root.clone()
    } else {
        root.join(&relative)
    };
    if !lexical_normalize(&dest).starts_with(lexical_normalize(root)) {
        return Err(reject("escapes its root"));
    }
    Ok((root.clone(), dest))
}

/// Refuse to write through any parent that exists as a symlink; a symlink
/// planted between capture and restore would redirect the write anywhere.
fn refuse_symlinked_parents(root: &Path, dest: &Path) -> Result<()> {
    if dest == root {
        return Ok(());
    }
    let relative = match dest.strip_prefix(root) {
        Ok(relative) => relative,
        Err(_) => return Ok(()),
    };
    // Check the root and every intermediate directory, not the leaf itself.
    let components: Vec<_> = relative.components().collect();
    let mut prefixes = vec![root.to_path_buf()];
    let mut current = root.to_path_buf();
    for component in components.iter().take(components.len().saturating_sub(1)) {
        current.push(component);
        prefixes.push(current.clone());
    }
    for prefix in prefixes {
        if let Ok(meta) = std::fs::symlink_metadata(&prefix)
            && meta.file_type().is_symlink()
        {
            return Err(SlbErr::validation(
                "archive",
                format!("refusing to traverse symlinked parent {}", prefix.display()),
            ));
        }
    }
    Ok(())
}

fn extract_entry(entry: &mut tar::Entry<'_, GzDecoder<File>>, dest: &Path, force: bool) -> Result<()> {
    let header = entry.header();
    let entry_type = header.entry_type();
    let mode = header.mode().unwrap_or(0o644) & 0o7777;

    if entry_type.is_dir() {
        std::fs::create_dir_all(dest)
            .map_err(|e| SlbErr::io(format!("create {}", dest.display()), e))?;
        set_mode(dest, mode);
        return Ok(());
    }

    let exists = std::fs::symlink_metadata(dest).is_ok();
    if exists && !force {
        return Err(SlbErr::validation(
            "force",
            format!("{} already exists; pass force to overwrite", dest.display()),
        ));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SlbErr::io(format!("create {}", parent.display()), e))?;
    }

    if entry_type.is_symlink() {
        let target = entry
            .link_name()
            .map_err(|e| SlbErr::io("read rollback archive", e))?
            .ok_or_else(|| SlbErr::validation("archive", "symlink entry without a target"))?;
        if exists {
            std::fs::remove_file(dest)
                .map_err(|e| SlbErr::io(format!("replace {}", dest.display()), e))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dest)
            .map_err(|e| SlbErr::io(format!("restore symlink {}", dest.display()), e))?;
        #[cfg(not(unix))]
        return Err(SlbErr::Internal(
            "symlink restore is unsupported on this platform".to_string(),
        ));
        #[cfg(unix)]
        return Ok(());
    }

    if entry_type.is_file() {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        let mut out = options
            .open(dest)
            .map_err(|e| SlbErr::io(format!("create {}", dest.display()), e))?;
        std::io::copy(entry, &mut out)
            .map_err(|e| SlbErr::io(format!("write {}", dest.display()), e))?;
        // The open honored the umask; the captured bits win.
        set_mode(dest, mode);
        return Ok(());
    }

    tracing::warn!(path = %dest.display(), "skipping unsupported archive entry type");
    Ok(())
}

fn set_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}
