use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// Separator between argv elements inside the hash preimage. Chosen so that
/// `["a b", "c"]` and `["a", "b c"]` hash differently.
const ARGV_JOIN: &str = "\u{1f}";

/// A fully-resolved command as submitted for approval. Value-typed and
/// immutable once hashed; mutating any field would invalidate `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// The command exactly as the requesting agent supplied it.
    pub raw: String,
    /// POSIX-tokenized form of `raw` (whitespace-split when tokenization
    /// failed).
    pub argv: Vec<String>,
    /// Working directory the command will execute in.
    pub cwd: PathBuf,
    /// Whether the command runs through the user's login shell with `-c`.
    pub shell: bool,
    /// `raw` with credential material replaced by `[REDACTED]`.
    pub display_redacted: String,
    /// True iff `display_redacted` differs from `raw`.
    pub contains_sensitive: bool,
    /// Hex SHA-256 over (raw, cwd, shell, argv) and nothing else.
    pub hash: String,
}

impl CommandSpec {
    pub fn new(
        raw: String,
        argv: Vec<String>,
        cwd: PathBuf,
        shell: bool,
        display_redacted: String,
        contains_sensitive: bool,
    ) -> Self {
        let hash = compute_hash(&raw, &cwd, shell, &argv);
        Self {
            raw,
            argv,
            cwd,
            shell,
            display_redacted,
            contains_sensitive,
            hash,
        }
    }
}

fn compute_hash(raw: &str, cwd: &Path, shell: bool, argv: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher.update(b"\x00");
    hasher.update(cwd.to_string_lossy().as_bytes());
    hasher.update(b"\x00");
    hasher.update(if shell { b"true" as &[u8] } else { b"false" });
    hasher.update(b"\x00");
    hasher.update(argv.join(ARGV_JOIN).as_bytes());
    hex::encode(hasher.finalize())
}
