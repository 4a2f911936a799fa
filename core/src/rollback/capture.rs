//! Rollback state capture.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use slb_protocol::FilesystemRollback;
use slb_protocol::GitRollback;
use slb_protocol::KubernetesRollback;
use slb_protocol::ROLLBACK_MANIFEST_VERSION;
use slb_protocol::Request;
use slb_protocol::Result;
use slb_protocol::RollbackData;
use slb_protocol::RollbackKind;
use slb_protocol::RollbackRoot;
use slb_protocol::SlbErr;
use walkdir::WalkDir;

use super::MANIFEST_FILENAME;
use super::REQUEST_DIR_PREFIX;
use super::TAR_FILENAME;
use crate::config::RollbackConfig;
use crate::normalize::normalize;
use crate::normalize::resolve_paths;
use crate::util::ensure_success;
use crate::util::lexical_normalize;
use crate::util::run_with_timeout;
use crate::util::write_file_0600;

/// Timeout for each git / kubectl invocation during capture.
const CAPTURE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// What `capture` decided to snapshot, derived from the normalized command.
#[derive(Debug, PartialEq, Eq)]
enum CapturePlan {
    Filesystem { targets: Vec<String> },
    Git,
    Kubernetes {
        namespace: String,
        resources: Vec<(String, String)>,
    },
}

pub struct RollbackCapture {
    config: RollbackConfig,
}

impl RollbackCapture {
    pub fn new(config: RollbackConfig) -> Self {
        Self { config }
    }

    /// Snapshot the state the request's command is about to mutate.
    /// Returns `None` for command families with no rollback support.
    pub async fn capture(&self, request: &Request) -> Result<Option<RollbackData>> {
        let now = Utc::now();
        self.capture_at(request, now).await
    }

    pub async fn capture_at(
        &self,
        request: &Request,
        now: DateTime<Utc>,
    ) -> Result<Option<RollbackData>> {
        let base = request.project_path.join(".slb").join("rollback");

        // Old captures are pruned before new ones are taken so the rollback
        // tree cannot grow without bound.
        if base.is_dir() {
            let prune_base = base.clone();
            let retention = self.config.retention_days;
            let _ = tokio::task::spawn_blocking(move || {
                prune_expired(&prune_base, now, retention);
            })
            .await;
        }

        let norm = normalize(&request.command.raw);
        let Some(first) = norm.segments.first() else {
            return Ok(None);
        };
        let Some(plan) = detect_capture(&first.tokens) else {
            return Ok(None);
        };

        let dir = base.join(format!("{REQUEST_DIR_PREFIX}{}", request.id));
        create_private_dir(&dir).await?;

        let outcome = match &plan {
            CapturePlan::Filesystem { targets } => {
                let cwd = request.command.cwd.clone();
                let targets = targets.clone();
                let dir = dir.clone();
                let max_size = self.config.max_size_bytes;
                tokio::task::spawn_blocking(move || {
                    capture_filesystem(&cwd, &targets, &dir, max_size)
                })
                .await
                .map_err(|e| SlbErr::Internal(format!("capture task failed: {e}")))?
                .map(|filesystem| (RollbackKind::Filesystem, Some(filesystem), None, None))
            }
            CapturePlan::Git => capture_git(&request.command.cwd, &dir)
                .await
                .map(|git| (RollbackKind::Git, None, Some(git), None)),
            CapturePlan::Kubernetes {
                namespace,
                resources,
            } => capture_kubernetes(&dir, namespace, resources)
                .await
                .map(|k8s| (RollbackKind::Kubernetes, None, None, Some(k8s))),
        };

        let (kind, filesystem, git, kubernetes) = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                // Partial captures are useless and may be large; drop them.
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        let data = RollbackData {
            version: ROLLBACK_MANIFEST_VERSION,
            request_id: request.id,
            captured_at: now,
            project_path: request.project_path.clone(),
            command_raw: request.command.raw.clone(),
            command_cwd: request.command.cwd.clone(),
            rollback_path: dir.clone(),
            kind,
            filesystem,
            git,
            kubernetes,
        };
        let manifest = serde_json::to_vec_pretty(&data)
            .map_err(|e| SlbErr::Internal(format!("serialize rollback manifest: {e}")))?;
        if let Err(e) = write_file_0600(&dir.join(MANIFEST_FILENAME), &manifest) {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(SlbErr::io("write rollback manifest", e));
        }

        tracing::info!(
            request = %request.id,
            kind = %data.kind,
            path = %dir.display(),
            "captured rollback state"
        );
        Ok(Some(data))
    }
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SlbErr::io("create rollback directory", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| SlbErr::io("set rollback directory permissions", e))?;
    }
    Ok(())
}

/// Decide whether (and how) the command's effects can be captured.
fn detect_capture(tokens: &[String]) -> Option<CapturePlan> {
    let family = tokens.first().map(String::as_str)?;
    match family {
        "rm" => {
            let mut targets = Vec::new();
            let mut past_flags = false;
            for token in &tokens[1..] {
                if !past_flags && token == "--" {
                    past_flags = true;
                    continue;
                }
                if past_flags || !token.starts_with('-') {
                    targets.push(token.clone());
                }
            }
            if targets.is_empty() {
                None
            } else {
                Some(CapturePlan::Filesystem { targets })
            }
        }
        "git" => Some(CapturePlan::Git),
        "kubectl" if tokens.get(1).map(String::as_str) == Some("delete") => {
            let (namespace, resources) = parse_kubectl_delete(&tokens[2..])?;
            if resources.is_empty() {
                None
            } else {
                Some(CapturePlan::Kubernetes {
                    namespace,
                    resources,
                })
            }
        }
        _ => None,
    }
}

/// Parse the resource list of a `kubectl delete`. Returns `None` for forms
/// that cannot be enumerated from argv (`-f manifest.yaml`, selectors).
fn parse_kubectl_delete(args: &[String]) -> Option<(String, Vec<(String, String)>)> {
    let mut namespace = String::new();
    let mut resources = Vec::new();
    let mut current_kind: Option<String> = None;

    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        if arg == "-n" || arg == "--namespace" {
            namespace = args.get(index + 1)?.clone();
            index += 2;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--namespace=") {
            namespace = value.to_string();
            index += 1;
            continue;
        }
        if arg == "-f" || arg == "--filename" || arg.starts_with("--filename=")
            || arg == "-l" || arg == "--selector" || arg.starts_with("--selector=")
            || arg == "--all"
        {
            return None;
        }
        if arg.starts_with('-') {
            index += 1;
            continue;
        }
        if let Some((kind, name)) = arg.split_once('/') {
            resources.push((kind.to_string(), name.to_string()));
            index += 1;
            continue;
        }
        match &current_kind {
            None => current_kind = Some(arg.to_string()),
            Some(kind) => resources.push((kind.clone(), arg.to_string())),
        }
        index += 1;
    }
    Some((namespace, resources))
}

// ---- filesystem ----------------------------------------------------------

fn capture_filesystem(
    cwd: &Path,
    targets: &[String],
    dir: &Path,
    max_size_bytes: u64,
) -> Result<FilesystemRollback> {
    // rm targets are paths by definition; anchor anything still relative
    // after `~`/flag resolution so glob matching never depends on the
    // broker's own working directory.
    let resolved: Vec<String> = resolve_paths(targets, cwd)
        .into_iter()
        .map(|target| {
            if Path::new(&target).is_absolute() {
                target
            } else {
                lexical_normalize(&cwd.join(&target))
                    .to_string_lossy()
                    .into_owned()
            }
        })
        .collect();
    let mut unique: BTreeSet<PathBuf> = BTreeSet::new();
    for target in &resolved {
        if target.contains(['*', '?', '[']) {
            match glob::glob(target) {
                Ok(matches) => {
                    for path in matches.flatten() {
                        unique.insert(path);
                    }
                }
                Err(_) => {
                    unique.insert(PathBuf::from(target));
                }
            }
        } else {
            unique.insert(PathBuf::from(target));
        }
    }

    let mut existing = Vec::new();
    let mut missing = Vec::new();
    for path in unique {
        if std::fs::symlink_metadata(&path).is_ok() {
            existing.push(path);
        } else {
            missing.push(path);
        }
    }

    let total_bytes = measure_tree(&existing, max_size_bytes)?;

    let tar_path = dir.join(TAR_FILENAME);
    let tar_file = open_file_0600(&tar_path)?;
    let encoder = GzEncoder::new(tar_file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut roots = Vec::new();
    for (index, root) in existing.iter().enumerate() {
        let id = format!("p{index}");
        append_root(&mut builder, root, &id)?;
        roots.push(RollbackRoot {
            id,
            path: root.clone(),
        });
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| SlbErr::io("finish rollback archive", e))?;
    let mut file = encoder
        .finish()
        .map_err(|e| SlbErr::io("finish rollback archive", e))?;
    file.flush()
        .map_err(|e| SlbErr::io("flush rollback archive", e))?;

    Ok(FilesystemRollback {
        tar_gz: TAR_FILENAME.to_string(),
        roots,
        total_bytes,
        missing,
    })
}

/// Sum regular-file sizes across the capture roots, aborting once the cap
/// is exceeded so a runaway target cannot fill the disk before we notice.
fn measure_tree(roots: &[PathBuf], max_size_bytes: u64) -> Result<u64> {
    let mut total = 0u64;
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry =
                entry.map_err(|e| SlbErr::io(format!("walk {}", root.display()), e.into()))?;
            if entry.file_type().is_file() {
                let meta = entry.metadata().map_err(|e| {
                    SlbErr::io(format!("stat {}", entry.path().display()), e.into())
                })?;
                total += meta.len();
                if total > max_size_bytes {
                    return Err(SlbErr::ExceedsMaxSize {
                        limit: max_size_bytes,
                        observed: total,
                    });
                }
            }
        }
    }
    Ok(total)
}

fn append_root<W: Write>(builder: &mut tar::Builder<W>, root: &Path, id: &str) -> Result<()> {
    let meta = std::fs::symlink_metadata(root)
        .map_err(|e| SlbErr::io(format!("stat {}", root.display()), e))?;
    if meta.is_dir() {
        builder
            .append_path_with_name(root, id)
            .map_err(|e| SlbErr::io(format!("archive {}", root.display()), e))?;
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry =
                entry.map_err(|e| SlbErr::io(format!("walk {}", root.display()), e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| SlbErr::Internal(format!("walk escaped its root: {e}")))?;
            let name = Path::new(id).join(rel);
            let file_type = entry.file_type();
            if file_type.is_file() {
                append_file_verified(builder, entry.path(), &name)?;
            } else if file_type.is_dir() || file_type.is_symlink() {
                builder
                    .append_path_with_name(entry.path(), &name)
                    .map_err(|e| SlbErr::io(format!("archive {}", entry.path().display()), e))?;
            } else {
                tracing::warn!(path = %entry.path().display(), "skipping special file");
            }
        }
    } else if meta.file_type().is_symlink() {
        builder
            .append_path_with_name(root, id)
            .map_err(|e| SlbErr::io(format!("archive {}", root.display()), e))?;
    } else {
        append_file_verified(builder, root, Path::new(id))?;
    }
    Ok(())
}

/// Append a regular file, verifying that the opened handle is the same
/// inode the walk saw. A swap between stat and open is how an attacker
/// would smuggle `/etc/shadow` into a capture of their own tree.
fn append_file_verified<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
) -> Result<()> {
    let lstat = std::fs::symlink_metadata(path)
        .map_err(|e| SlbErr::io(format!("stat {}", path.display()), e))?;
    if !lstat.is_file() {
        return Err(SlbErr::Toctou {
            path: path.to_path_buf(),
        });
    }
    let mut file =
        File::open(path).map_err(|e| SlbErr::io(format!("open {}", path.display()), e))?;
    let fstat = file
        .metadata()
        .map_err(|e| SlbErr::io(format!("stat {}", path.display()), e))?;
    if !same_file(&lstat, &fstat) {
        return Err(SlbErr::Toctou {
            path: path.to_path_buf(),
        });
    }

    let mut header = tar::Header::new_gnu();
    header.set_metadata(&fstat);
    builder
        .append_data(&mut header, name, &mut file)
        .map_err(|e| SlbErr::io(format!("archive {}", path.display()), e))
}

#[cfg(unix)]
fn same_file(lstat: &std::fs::Metadata, fstat: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    lstat.ino() == fstat.ino() && lstat.dev() == fstat.dev()
}

#[cfg(not(unix))]
fn same_file(lstat: &std::fs::Metadata, fstat: &std::fs::Metadata) -> bool {
    lstat.len() == fstat.len() && lstat.file_type() == fstat.file_type()
}

fn open_file_0600(path: &Path) -> Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map_err(|e| SlbErr::io(format!("create {}", path.display()), e))
}

// ---- git -----------------------------------------------------------------

async fn capture_git(cwd: &Path, dir: &Path) -> Result<GitRollback> {
    let git_dir = dir.join("git");
    tokio::fs::create_dir_all(&git_dir)
        .await
        .map_err(|e| SlbErr::io("create git capture directory", e))?;

    let repo_root = run_git_text(cwd, &["rev-parse", "--show-toplevel"]).await?;
    let head = run_git_text(cwd, &["rev-parse", "HEAD"]).await?;
    let branch = run_git_text(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;

    write_file_0600(&git_dir.join("head.txt"), head.as_bytes())
        .map_err(|e| SlbErr::io("write git capture", e))?;
    write_file_0600(&git_dir.join("branch.txt"), branch.as_bytes())
        .map_err(|e| SlbErr::io("write git capture", e))?;

    for (args, filename) in [
        (&["status", "--porcelain"][..], "status.txt"),
        (&["diff"][..], "diff.patch"),
        (&["diff", "--cached"][..], "diff_cached.patch"),
        (&["ls-files", "--others", "--exclude-standard"][..], "untracked.txt"),
    ] {
        let op = format!("git {}", args.join(" "));
        let output = run_with_timeout("git", args, Some(cwd), CAPTURE_COMMAND_TIMEOUT, &op).await?;
        let output = ensure_success(output, &op)?;
        write_file_0600(&git_dir.join(filename), &output.stdout)
            .map_err(|e| SlbErr::io("write git capture", e))?;
    }

    Ok(GitRollback {
        repo_root: PathBuf::from(repo_root),
        head,
        branch,
        status_file: "git/status.txt".to_string(),
        diff_file: "git/diff.patch".to_string(),
        cached_file: "git/diff_cached.patch".to_string(),
        untracked_file: "git/untracked.txt".to_string(),
    })
}

async fn run_git_text(cwd: &Path, args: &[&str]) -> Result<String> {
    let op = format!("git {}", args.join(" "));
    let output = run_with_timeout("git", args, Some(cwd), CAPTURE_COMMAND_TIMEOUT, &op).await?;
    let output = ensure_success(output, &op)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---- kubernetes ----------------------------------------------------------

async fn capture_kubernetes(
    dir: &Path,
    namespace: &str,
    resources: &[(String, String)],
) -> Result<KubernetesRollback> {
    let k8s_dir = dir.join("k8s");
    tokio::fs::create_dir_all(&k8s_dir)
        .await
        .map_err(|e| SlbErr::io("create kubernetes capture directory", e))?;

    let mut manifests = Vec::new();
    for (kind, name) in resources {
        let mut args: Vec<&str> = vec!["get", kind, name, "-o", "yaml"];
        if !namespace.is_empty() {
            args.push("-n");
            args.push(namespace);
        }
        let op = format!("kubectl get {kind} {name}");
        let output =
            run_with_timeout("kubectl", &args, None, CAPTURE_COMMAND_TIMEOUT, &op).await?;
        let output = ensure_success(output, &op)?;

        let filename = format!("k8s/{kind}_{name}.yaml");
        write_file_0600(&dir.join(&filename), &output.stdout)
            .map_err(|e| SlbErr::io("write kubernetes capture", e))?;
        manifests.push(filename);
    }

    Ok(KubernetesRollback {
        namespace: namespace.to_string(),
        manifests,
    })
}

// ---- retention -----------------------------------------------------------

/// Remove sibling capture directories past retention. Failures are logged
/// and skipped; pruning never blocks a new capture.
fn prune_expired(base: &Path, now: DateTime<Utc>, retention_days: u32) {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "could not scan rollback directory for pruning");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(REQUEST_DIR_PREFIX) {
            continue;
        }
        let captured_at = read_captured_at(&entry.path());
        let expired = match captured_at {
            Some(at) => at < cutoff,
            None => modified_before(&entry.path(), cutoff),
        };
        if expired {
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                tracing::warn!(error = %e, path = %entry.path().display(), "prune failed");
            } else {
                tracing::debug!(path = %entry.path().display(), "pruned expired rollback state");
            }
        }
    }
}

fn read_captured_at(dir: &Path) -> Option<DateTime<Utc>> {
    let bytes = std::fs::read(dir.join(MANIFEST_FILENAME)).ok()?;
    let data: RollbackData = serde_json::from_slice(&bytes).ok()?;
    Some(data.captured_at)
}

fn modified_before(path: &Path, cutoff: DateTime<Utc>) -> bool {
    match std::fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) < cutoff,
        Err(_) => false,
    }
}
