//! Pre-execution state capture and restore.
//!
//! For the supported command families the broker snapshots whatever the
//! command is about to destroy into `<project>/.slb/rollback/req-<id>/`,
//! described by a `metadata.json` manifest. Restore re-applies a manifest;
//! it never trusts archive entry names beyond the opaque root ids recorded
//! at capture time.

mod capture;
mod restore;

use std::path::Path;

use slb_protocol::ROLLBACK_MANIFEST_VERSION;
use slb_protocol::Result;
use slb_protocol::RollbackData;
use slb_protocol::SlbErr;

pub use capture::RollbackCapture;
pub use restore::RestoreOptions;
pub use restore::RollbackRestore;

pub(crate) const MANIFEST_FILENAME: &str = "metadata.json";
pub(crate) const TAR_FILENAME: &str = "files.tar.gz";

/// Directory prefix for per-request capture directories.
pub(crate) const REQUEST_DIR_PREFIX: &str = "req-";

/// Load and version-check the manifest from a capture directory.
pub async fn load_manifest(dir: &Path) -> Result<RollbackData> {
    let path = dir.join(MANIFEST_FILENAME);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        SlbErr::io(format!("read rollback manifest {}", path.display()), e)
    })?;
    let data: RollbackData = serde_json::from_slice(&bytes).map_err(|e| {
        SlbErr::validation("manifest", format!("malformed rollback manifest: {e}"))
    })?;
    if data.version != ROLLBACK_MANIFEST_VERSION {
        return Err(SlbErr::validation(
            "manifest",
            format!("unsupported manifest version {}", data.version),
        ));
    }
    Ok(data)
}
