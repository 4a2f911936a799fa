//! On-disk rollback manifest (`metadata.json`). The schema here is consumed
//! by the restore side and by external tooling, so field names are frozen.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::ids::RequestId;

pub const ROLLBACK_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RollbackKind {
    Filesystem,
    Git,
    Kubernetes,
}

/// Maps an opaque top-level tar entry name (`p0`, `p1`, …) back to the
/// absolute path it was captured from. Restore resolves entries through this
/// table and can therefore refuse absolute or escaping paths outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRoot {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRollback {
    /// Archive file name relative to the rollback directory.
    pub tar_gz: String,
    pub roots: Vec<RollbackRoot>,
    pub total_bytes: u64,
    /// Target paths that did not exist at capture time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRollback {
    pub repo_root: PathBuf,
    pub head: String,
    pub branch: String,
    pub status_file: String,
    pub diff_file: String,
    pub cached_file: String,
    pub untracked_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesRollback {
    /// Empty string when the delete ran in the default namespace.
    pub namespace: String,
    pub manifests: Vec<String>,
}

/// Pre-execution state captured for a request, discriminated by `kind`.
/// Owns the `rollback_path` directory; pruning a request past retention
/// removes the directory with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackData {
    pub version: u32,
    pub request_id: RequestId,
    pub captured_at: DateTime<Utc>,
    pub project_path: PathBuf,
    pub command_raw: String,
    pub command_cwd: PathBuf,
    pub rollback_path: PathBuf,
    pub kind: RollbackKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemRollback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitRollback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesRollback>,
}
