//! Shell-aware command normalization.
//!
//! Agent-submitted commands are arbitrary shell one-liners. Before anything
//! can be classified, the raw string is split into segments on compound
//! separators (respecting quotes and escapes), `sh -c` wrappers are
//! unwrapped, and privilege/measurement wrappers such as `sudo` and `time`
//! are stripped so that the classifier sees the command that will actually
//! touch the system.

use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::util::lexical_normalize;
use crate::util::static_regex;

/// Leading tokens that do not change what the command does to the system.
const WRAPPERS: &[&str] = &[
    "sudo", "doas", "env", "command", "builtin", "time", "nice", "ionice", "nohup", "strace",
    "ltrace",
];

/// Recursion guard for nested `sh -c 'sh -c …'` chains.
const MAX_WRAPPER_DEPTH: usize = 8;

static SHELL_DASH_C: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r#"^(bash|sh|zsh|ksh|dash)\s+-c\s+['"](.+)['"]$"#));

static ENV_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r"^[A-Za-z_][A-Za-z0-9_]*="));

/// Operator joining a segment to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// First segment of the command line.
    None,
    /// `;`
    Semi,
    /// `&&`
    And,
    /// `||`
    Or,
    /// A single trailing or joining `&`.
    Background,
    /// `|`
    Pipe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSegment {
    /// Trimmed source text of the segment, with any `sh -c` wrapper already
    /// unwrapped.
    pub text: String,
    /// POSIX-tokenized form with leading wrappers stripped. Whitespace-split
    /// when tokenization failed.
    pub tokens: Vec<String>,
    pub connector: Connector,
}

impl CommandSegment {
    pub fn family(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedCommand {
    pub original: String,
    /// First segment after normalization.
    pub primary: String,
    pub segments: Vec<CommandSegment>,
    /// True iff any of `;`, `&&`, `||`, `&` joined segments at the top
    /// level.
    pub is_compound: bool,
    /// True iff `$(…)`, backticks, or a top-level `(…)` appeared anywhere
    /// outside single quotes.
    pub has_subshell: bool,
    /// Wrappers removed along the way, e.g. `sudo` or `bash -c`.
    pub stripped_wrappers: Vec<String>,
    /// Tokenization fell back to whitespace splitting somewhere; the
    /// classifier treats this as grounds to tier up.
    pub parse_error: bool,
}

pub fn normalize(raw: &str) -> NormalizedCommand {
    normalize_at_depth(raw, 0)
}

fn normalize_at_depth(raw: &str, depth: usize) -> NormalizedCommand {
    let scan = scan_segments(raw);
    let mut is_compound = scan.saw_compound_separator;
    let mut has_subshell = scan.has_subshell;
    let mut parse_error = false;
    let mut stripped_wrappers = Vec::new();
    let mut segments: Vec<CommandSegment> = Vec::new();

    for (text, connector) in scan.parts {
        if depth < MAX_WRAPPER_DEPTH
            && let Some(caps) = SHELL_DASH_C.captures(&text)
        {
            let shell = caps[1].to_string();
            let inner = normalize_at_depth(&caps[2], depth + 1);
            stripped_wrappers.push(format!("{shell} -c"));
            stripped_wrappers.extend(inner.stripped_wrappers);
            is_compound |= inner.is_compound;
            has_subshell |= inner.has_subshell;
            parse_error |= inner.parse_error;
            for (index, segment) in inner.segments.into_iter().enumerate() {
                let connector = if index == 0 { connector } else { segment.connector };
                segments.push(CommandSegment {
                    connector,
                    ..segment
                });
            }
            continue;
        }

        let (raw_tokens, failed) = tokenize(&text);
        parse_error |= failed;
        let (tokens, stripped) = strip_wrappers(raw_tokens);
        stripped_wrappers.extend(stripped);
        segments.push(CommandSegment {
            text,
            tokens,
            connector,
        });
    }

    let primary = segments
        .first()
        .map(|segment| segment.text.clone())
        .unwrap_or_default();

    NormalizedCommand {
        original: raw.to_string(),
        primary,
        segments,
        is_compound,
        has_subshell,
        stripped_wrappers,
        parse_error,
    }
}

struct SegmentScan {
    parts: Vec<(String, Connector)>,
    has_subshell: bool,
    /// A `;`, `&&`, `||` or `&` was seen at the top level, even if it was
    /// trailing and produced no further segment.
    saw_compound_separator: bool,
}

/// Split on compound separators and pipes with a scanner that understands
/// single/double quotes, backslash escapes, and parenthesized groups.
/// Separators inside quotes or parens never split.
fn scan_segments(input: &str) -> SegmentScan {
    let chars: Vec<char> = input.chars().collect();
    let mut parts: Vec<(String, Connector)> = Vec::new();
    let mut current = String::new();
    let mut pending = Connector::None;
    let mut has_subshell = false;

    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut paren_depth = 0usize;
    let mut last_significant = '\0';
    let mut saw_compound_separator = false;

    let mut flush = |current: &mut String, pending: &mut Connector, next: Connector| {
        let text = current.trim().to_string();
        if !text.is_empty() {
            parts.push((text, *pending));
        }
        current.clear();
        *pending = next;
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if escaped {
            current.push(c);
            escaped = false;
            i += 1;
            continue;
        }
        if c == '\\' && !in_single {
            current.push(c);
            escaped = true;
            i += 1;
            continue;
        }
        if c == '\'' && !in_double {
            in_single = !in_single;
            current.push(c);
            last_significant = c;
            i += 1;
            continue;
        }
        if c == '"' && !in_single {
            in_double = !in_double;
            current.push(c);
            last_significant = c;
            i += 1;
            continue;
        }

        // Command substitution expands inside double quotes too; only
        // single quotes keep it literal.
        if !in_single && (c == '`' || (c == '$' && chars.get(i + 1) == Some(&'('))) {
            has_subshell = true;
        }

        if in_single || in_double {
            current.push(c);
            i += 1;
            continue;
        }

        match c {
            '(' => {
                // `$(` was already counted as a substitution above; a bare
                // top-level paren group is a subshell in its own right.
                if last_significant != '$' {
                    has_subshell = true;
                }
                paren_depth += 1;
                current.push(c);
            }
            ')' => {
                paren_depth = paren_depth.saturating_sub(1);
                current.push(c);
            }
            ';' if paren_depth == 0 => {
                saw_compound_separator = true;
                flush(&mut current, &mut pending, Connector::Semi);
            }
            '&' if paren_depth == 0 => {
                if chars.get(i + 1) == Some(&'&') {
                    saw_compound_separator = true;
                    flush(&mut current, &mut pending, Connector::And);
                    i += 1;
                } else if last_significant == '>' {
                    // Part of a redirection such as `2>&1`, not a separator.
                    current.push(c);
                } else {
                    saw_compound_separator = true;
                    flush(&mut current, &mut pending, Connector::Background);
                }
            }
            '|' if paren_depth == 0 => {
                if chars.get(i + 1) == Some(&'|') {
                    saw_compound_separator = true;
                    flush(&mut current, &mut pending, Connector::Or);
                    i += 1;
                } else {
                    flush(&mut current, &mut pending, Connector::Pipe);
                }
            }
            _ => current.push(c),
        }

        if !c.is_whitespace() {
            last_significant = c;
        }
        i += 1;
    }

    let text = current.trim().to_string();
    if !text.is_empty() {
        parts.push((text, pending));
    }

    SegmentScan {
        parts,
        has_subshell,
        saw_compound_separator,
    }
}

/// POSIX tokenization with a lossy whitespace fallback. The `bool` reports
/// whether the fallback was taken.
fn tokenize(text: &str) -> (Vec<String>, bool) {
    match shlex::split(text) {
        Some(tokens) => (tokens, false),
        None => (
            text.split_whitespace().map(str::to_string).collect(),
            true,
        ),
    }
}

fn strip_wrappers(tokens: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut stripped = Vec::new();
    let mut index = 0;
    while index < tokens.len() {
        let token = tokens[index].as_str();
        if !WRAPPERS.contains(&token) {
            break;
        }
        stripped.push(token.to_string());
        index += 1;
        if token == "env" {
            while index < tokens.len() && ENV_ASSIGNMENT.is_match(&tokens[index]) {
                index += 1;
            }
        }
    }
    (tokens[index..].to_vec(), stripped)
}

/// Expand `~` and resolve relative path-looking tokens against `cwd`.
/// `--flag=value` tokens are rewritten as `--flag=resolved`.
pub fn resolve_paths(tokens: &[String], cwd: &Path) -> Vec<String> {
    tokens
        .iter()
        .map(|token| resolve_token(token, cwd))
        .collect()
}

fn resolve_token(token: &str, cwd: &Path) -> String {
    if token.starts_with("--")
        && let Some((flag, value)) = token.split_once('=')
    {
        return format!("{flag}={}", resolve_value(value, cwd));
    }
    resolve_value(token, cwd)
}

fn resolve_value(value: &str, cwd: &Path) -> String {
    if value == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().into_owned();
        }
        return value.to_string();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
        return value.to_string();
    }
    if value.starts_with('/') {
        return value.to_string();
    }
    if value == "." || value == ".." || value.contains('/') {
        return lexical_normalize(&cwd.join(value))
            .to_string_lossy()
            .into_owned();
    }
    value.to_string()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
