//! Risk classification.
//!
//! Patterns are data, not code: an ordered list of records matched against
//! each normalized segment, most severe first. Tests can load synthetic
//! pattern sets; the default table covers the command families the broker
//! must never wave through unreviewed.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use slb_protocol::RiskTier;

use crate::normalize::CommandSegment;
use crate::normalize::Connector;
use crate::normalize::normalize;
use crate::normalize::resolve_paths;
use crate::util::static_regex;

/// Shells a piped download could be fed into.
const PIPE_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

/// `> /etc/...` style redirections that overwrite system state.
static SYSTEM_REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r">>?\s*/(etc|usr|bin|sbin|boot|lib|lib64|var|dev|root)(/|\s|$)"));

#[derive(Debug, Clone)]
pub enum ArgPredicate {
    /// The family alone decides.
    Always,
    /// Matched against the segment's arguments joined with single spaces.
    Regex(Regex),
    /// At least one of these tokens appears among the arguments.
    AnyToken(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    /// Stable identifier recorded on the resulting request,
    /// e.g. `git:reset-hard`.
    pub name: String,
    /// First token of the segment after wrapper stripping. A trailing `*`
    /// matches by prefix, which covers the `mkfs.ext4` family.
    pub family: String,
    pub args: ArgPredicate,
    pub tier: RiskTier,
    pub rationale: String,
}

impl Pattern {
    pub fn new(
        name: &str,
        family: &str,
        args: ArgPredicate,
        tier: RiskTier,
        rationale: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            family: family.to_string(),
            args,
            tier,
            rationale: rationale.to_string(),
        }
    }

    fn matches(&self, tokens: &[String]) -> bool {
        let Some(family) = tokens.first() else {
            return false;
        };
        let family_matches = match self.family.strip_suffix('*') {
            Some(prefix) => family.starts_with(prefix),
            None => family == &self.family,
        };
        if !family_matches {
            return false;
        }
        match &self.args {
            ArgPredicate::Always => true,
            ArgPredicate::Regex(regex) => regex.is_match(&tokens[1..].join(" ")),
            ArgPredicate::AnyToken(needles) => tokens[1..]
                .iter()
                .any(|token| needles.iter().any(|needle| needle == token)),
        }
    }
}

/// Outcome of classifying one raw command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub tier: RiskTier,
    pub needs_approval: bool,
    pub is_safe: bool,
    pub min_approvals: u32,
    pub matched_pattern: Option<String>,
    pub rationale: String,
}

impl MatchResult {
    fn from_tier(tier: RiskTier, matched_pattern: Option<String>, rationale: String) -> Self {
        Self {
            tier,
            needs_approval: tier != RiskTier::Safe,
            is_safe: tier == RiskTier::Safe,
            min_approvals: tier.min_approvals(),
            matched_pattern,
            rationale,
        }
    }
}

pub struct Classifier {
    patterns: Vec<Pattern>,
}

impl Classifier {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self { patterns }
    }

    pub fn with_default_patterns() -> Self {
        Self::new(default_patterns())
    }

    /// Classify a raw command line. A compound command classifies as the
    /// maximum tier over its segments; lossy parses and subshells tier up
    /// to at least dangerous.
    pub fn classify(&self, raw: &str, cwd: &Path) -> MatchResult {
        let norm = normalize(raw);
        if norm.segments.is_empty() {
            return MatchResult::from_tier(RiskTier::Safe, None, "empty command".to_string());
        }

        let mut tier = RiskTier::Safe;
        let mut matched: Option<String> = None;
        let mut rationale = "no risky pattern matched".to_string();
        let mut raise = |t: RiskTier, name: Option<String>, why: String| {
            if t > tier {
                tier = t;
                matched = name;
                rationale = why;
            }
        };

        for segment in &norm.segments {
            let (seg_tier, seg_match, seg_rationale) = self.classify_segment(segment, cwd);
            raise(seg_tier, seg_match, seg_rationale);
        }

        // A download piped straight into a shell executes whatever the
        // network returns; neither side looks risky on its own.
        for pair in norm.segments.windows(2) {
            if pair[1].connector == Connector::Pipe
                && pair[1]
                    .family()
                    .is_some_and(|family| PIPE_SHELLS.contains(&family))
                && pair[0]
                    .family()
                    .is_some_and(|family| family == "curl" || family == "wget")
            {
                raise(
                    RiskTier::Dangerous,
                    Some("network:pipe-to-shell".to_string()),
                    "remote content piped directly into a shell".to_string(),
                );
            }
        }

        if norm.parse_error {
            raise(
                RiskTier::Dangerous,
                None,
                "command could not be fully parsed".to_string(),
            );
        }
        if norm.has_subshell {
            raise(
                RiskTier::Dangerous,
                None,
                "command contains a subshell".to_string(),
            );
        }
        if norm.is_compound && norm.segments.iter().any(|s| is_known_dangerous(&s.tokens)) {
            raise(
                RiskTier::Dangerous,
                None,
                "compound command includes a destructive segment".to_string(),
            );
        }

        MatchResult::from_tier(tier, matched, rationale)
    }

    fn classify_segment(
        &self,
        segment: &CommandSegment,
        cwd: &Path,
    ) -> (RiskTier, Option<String>, String) {
        let mut result = self.classify_tokens(&segment.tokens, cwd);
        if SYSTEM_REDIRECT.is_match(&segment.text) && RiskTier::Dangerous > result.0 {
            result = (
                RiskTier::Dangerous,
                Some("system:redirect".to_string()),
                "redirection into a system path".to_string(),
            );
        }
        result
    }

    fn classify_tokens(
        &self,
        tokens: &[String],
        cwd: &Path,
    ) -> (RiskTier, Option<String>, String) {
        if tokens.is_empty() {
            return (RiskTier::Safe, None, "command has no effect".to_string());
        }

        if tokens[0] == "xargs" {
            let base = (
                RiskTier::Caution,
                None,
                "unknown command treated conservatively".to_string(),
            );
            return match xargs_inner(tokens) {
                Some(inner) => {
                    let inner_result = self.classify_tokens(&inner, cwd);
                    if inner_result.0 > base.0 { inner_result } else { base }
                }
                None => base,
            };
        }

        if tokens[0] == "rm" && targets_filesystem_root(tokens, cwd) {
            return (
                RiskTier::Critical,
                Some("filesystem:rm-root".to_string()),
                "removal targeting the filesystem root".to_string(),
            );
        }

        for pattern in &self.patterns {
            if pattern.matches(tokens) {
                return (
                    pattern.tier,
                    Some(pattern.name.clone()),
                    pattern.rationale.clone(),
                );
            }
        }

        if is_known_dangerous(tokens) {
            return (
                RiskTier::Dangerous,
                None,
                "known destructive command family".to_string(),
            );
        }

        (
            RiskTier::Caution,
            None,
            "unknown command treated conservatively".to_string(),
        )
    }
}

/// Command families that never classify safe even when no pattern matched.
fn is_known_dangerous(tokens: &[String]) -> bool {
    let Some(family) = tokens.first().map(String::as_str) else {
        return false;
    };
    let sub = tokens.get(1).map(String::as_str);
    match family {
        "rm" | "dd" | "shred" => true,
        _ if family.starts_with("mkfs") => true,
        "git" => matches!(sub, Some("reset" | "clean")),
        "kubectl" => match sub {
            Some("delete") => true,
            Some("apply") => tokens.iter().any(|t| t == "--force"),
            _ => false,
        },
        "helm" => sub == Some("uninstall"),
        "terraform" => sub == Some("destroy"),
        _ => false,
    }
}

fn targets_filesystem_root(tokens: &[String], cwd: &Path) -> bool {
    let resolved = resolve_paths(&tokens[1..], cwd);
    resolved
        .iter()
        .filter(|token| !token.starts_with('-'))
        .any(|token| token == "/" || token == "/*")
}

fn xargs_inner(tokens: &[String]) -> Option<Vec<String>> {
    // Flags of xargs itself that consume the next token.
    const VALUE_FLAGS: &[&str] = &[
        "-n",
        "-L",
        "-P",
        "-s",
        "-I",
        "-E",
        "-d",
        "--max-args",
        "--max-procs",
        "--max-chars",
        "--delimiter",
    ];
    let mut index = 1;
    while index < tokens.len() {
        let token = tokens[index].as_str();
        if !token.starts_with('-') {
            return Some(tokens[index..].to_vec());
        }
        if VALUE_FLAGS.contains(&token) {
            index += 2;
        } else {
            index += 1;
        }
    }
    None
}

/// The built-in classification table, most severe first.
pub fn default_patterns() -> Vec<Pattern> {
    use ArgPredicate::AnyToken;
    use ArgPredicate::Always;
    use RiskTier::Caution;
    use RiskTier::Critical;
    use RiskTier::Dangerous;
    use RiskTier::Safe;

    let mut patterns = vec![
        Pattern::new(
            "disk:dd-device",
            "dd",
            ArgPredicate::Regex(static_regex(r"(^| )of=/dev/")),
            Critical,
            "raw write to a block device",
        ),
        Pattern::new(
            "disk:mkfs",
            "mkfs*",
            Always,
            Critical,
            "creating a filesystem destroys existing data",
        ),
        Pattern::new(
            "filesystem:rm-recursive-force",
            "rm",
            ArgPredicate::Regex(static_regex(
                r"(^| )(-[A-Za-z]*[rRf][A-Za-z]*|--recursive|--force)( |$)",
            )),
            Dangerous,
            "recursive or forced file removal",
        ),
        Pattern::new(
            "filesystem:shred",
            "shred",
            Always,
            Dangerous,
            "shred overwrites file contents irrecoverably",
        ),
        Pattern::new(
            "filesystem:chmod-recursive",
            "chmod",
            ArgPredicate::Regex(static_regex(r"(^| )(-[A-Za-z]*R[A-Za-z]*|--recursive)( |$)")),
            Dangerous,
            "recursive permission change",
        ),
        Pattern::new(
            "filesystem:chown-recursive",
            "chown",
            ArgPredicate::Regex(static_regex(r"(^| )(-[A-Za-z]*R[A-Za-z]*|--recursive)( |$)")),
            Dangerous,
            "recursive ownership change",
        ),
        Pattern::new(
            "filesystem:find-mutating",
            "find",
            AnyToken(
                [
                    "-delete", "-exec", "-execdir", "-ok", "-okdir", "-fls", "-fprint",
                    "-fprint0", "-fprintf",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            Dangerous,
            "find with options that delete files or execute commands",
        ),
        Pattern::new(
            "disk:partition",
            "fdisk",
            Always,
            Dangerous,
            "partition table editing",
        ),
        Pattern::new(
            "disk:partition",
            "parted",
            Always,
            Dangerous,
            "partition table editing",
        ),
        Pattern::new(
            "filesystem:truncate",
            "truncate",
            Always,
            Dangerous,
            "truncate discards file contents",
        ),
        Pattern::new(
            "system:shutdown",
            "shutdown",
            Always,
            Dangerous,
            "host shutdown",
        ),
        Pattern::new("system:reboot", "reboot", Always, Dangerous, "host reboot"),
        Pattern::new(
            "system:systemctl-destructive",
            "systemctl",
            ArgPredicate::Regex(static_regex(r"^(stop|disable|mask)\b")),
            Dangerous,
            "stopping or masking a system service",
        ),
        Pattern::new(
            "net:iptables-flush",
            "iptables",
            ArgPredicate::AnyToken(vec!["-F".to_string(), "--flush".to_string()]),
            Dangerous,
            "flushing firewall rules",
        ),
        Pattern::new(
            "cron:crontab-remove",
            "crontab",
            ArgPredicate::AnyToken(vec!["-r".to_string()]),
            Dangerous,
            "removing the whole crontab",
        ),
        Pattern::new(
            "user:userdel",
            "userdel",
            Always,
            Dangerous,
            "deleting a user account",
        ),
        Pattern::new(
            "pkg:remove",
            "apt-get",
            ArgPredicate::Regex(static_regex(r"^(remove|purge|autoremove)\b")),
            Dangerous,
            "removing installed packages",
        ),
        Pattern::new(
            "pkg:remove",
            "apt",
            ArgPredicate::Regex(static_regex(r"^(remove|purge|autoremove)\b")),
            Dangerous,
            "removing installed packages",
        ),
        Pattern::new(
            "db:dropdb",
            "dropdb",
            Always,
            Dangerous,
            "dropping a database",
        ),
        Pattern::new(
            "git:reset-hard",
            "git",
            ArgPredicate::Regex(static_regex(r"^reset\b.*--hard")),
            Dangerous,
            "git reset --hard discards uncommitted work",
        ),
        Pattern::new(
            "git:clean",
            "git",
            ArgPredicate::Regex(static_regex(r"^clean\b.* -[A-Za-z]*[fdxX]")),
            Dangerous,
            "git clean deletes untracked files",
        ),
        Pattern::new(
            "git:push-force",
            "git",
            ArgPredicate::Regex(static_regex(
                r"^push\b.*( --force| --force-with-lease| -f)\b",
            )),
            Dangerous,
            "force push rewrites remote history",
        ),
        Pattern::new(
            "k8s:kubectl-delete",
            "kubectl",
            ArgPredicate::Regex(static_regex(r"^delete\b")),
            Dangerous,
            "kubectl delete removes live cluster resources",
        ),
        Pattern::new(
            "k8s:kubectl-apply-force",
            "kubectl",
            ArgPredicate::Regex(static_regex(r"^apply\b.*--force")),
            Dangerous,
            "kubectl apply --force replaces live cluster resources",
        ),
        Pattern::new(
            "k8s:helm-uninstall",
            "helm",
            ArgPredicate::Regex(static_regex(r"^uninstall\b")),
            Dangerous,
            "helm uninstall removes a deployed release",
        ),
        Pattern::new(
            "infra:terraform-destroy",
            "terraform",
            ArgPredicate::Regex(static_regex(r"^destroy\b")),
            Dangerous,
            "terraform destroy tears down managed infrastructure",
        ),
        Pattern::new(
            "git:readonly",
            "git",
            ArgPredicate::Regex(static_regex(r"^(status|log|diff|show|branch)\b")),
            Safe,
            "read-only git query",
        ),
        Pattern::new(
            "git:mutating",
            "git",
            ArgPredicate::Regex(static_regex(r"^(push|rebase|merge|cherry-pick|am|stash)\b")),
            Caution,
            "git operation that rewrites local or remote state",
        ),
        Pattern::new(
            "build:cargo-check",
            "cargo",
            ArgPredicate::Regex(static_regex(r"^check\b")),
            Safe,
            "cargo check does not modify the tree",
        ),
        Pattern::new(
            "read:sed-print",
            "sed",
            ArgPredicate::Regex(static_regex(r"^-n [0-9]+(,[0-9]+)?p \S+$")),
            Safe,
            "sed line-print",
        ),
        Pattern::new("read:find", "find", Always, Safe, "read-only file search"),
    ];

    for family in [
        "cat", "cd", "echo", "grep", "head", "ls", "pwd", "rg", "tail", "wc", "which",
    ] {
        patterns.push(Pattern::new(
            &format!("read:{family}"),
            family,
            Always,
            Safe,
            "read-only command",
        ));
    }

    patterns
}
