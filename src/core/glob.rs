//! Filesystem glob expansion used by the locator and learning scans.
//!
//! Patterns are split on `/` and matched one path component at a time.
//! Supported syntax: `*`, `?`, `[abc]`, `[!abc]`, and `**` for zero or more
//! directories. Matches within a directory come back in lexical order.

use crate::core::error::RatchetError;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', ']'])
}

/// Expands `pattern` relative to `root`. Unreadable directories are treated
/// as empty.
pub fn glob(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, RatchetError> {
    let components: Vec<&str> = pattern
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    if components.is_empty() {
        return Ok(Vec::new());
    }

    let compiled = components
        .iter()
        .map(|c| Component::compile(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    expand(root, &compiled, &mut out);
    let mut seen = HashSet::new();
    out.retain(|p| seen.insert(p.clone()));
    Ok(out)
}

enum Component {
    Literal(String),
    Pattern(Regex),
    AnyDepth,
}

impl Component {
    fn compile(raw: &str) -> Result<Self, RatchetError> {
        if raw == "**" {
            return Ok(Component::AnyDepth);
        }
        if !has_glob_meta(raw) {
            return Ok(Component::Literal(raw.to_string()));
        }
        let re = Regex::new(&component_regex(raw)?)
            .map_err(|e| RatchetError::malformed("glob pattern", e))?;
        Ok(Component::Pattern(re))
    }

    /// Whether a single path component (no `/`) matches.
    fn matches(&self, name: &str) -> bool {
        match self {
            Component::Literal(lit) => lit == name,
            Component::Pattern(re) => re.is_match(name),
            Component::AnyDepth => true,
        }
    }
}

fn component_regex(raw: &str) -> Result<String, RatchetError> {
    let mut re = String::from("^");
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                // `**` inside a component behaves like `*`
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                re.push_str("[^/]*");
            }
            '?' => re.push_str("[^/]"),
            '[' => {
                let mut class = String::from("[");
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    class.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if !closed {
                    return Err(RatchetError::malformed(
                        "glob pattern",
                        format!("unclosed character class in '{}'", raw),
                    ));
                }
                class.push(']');
                re.push_str(&class);
            }
            ']' => {
                return Err(RatchetError::malformed(
                    "glob pattern",
                    format!("unbalanced ']' in '{}'", raw),
                ));
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Ok(re)
}

fn expand(dir: &Path, rest: &[Component], out: &mut Vec<PathBuf>) {
    let Some((head, tail)) = rest.split_first() else {
        out.push(dir.to_path_buf());
        return;
    };

    match head {
        Component::Literal(name) => {
            let candidate = dir.join(name);
            if tail.is_empty() {
                if candidate.exists() {
                    out.push(candidate);
                }
            } else if candidate.is_dir() {
                expand(&candidate, tail, out);
            }
        }
        Component::Pattern(_) => {
            for (name, path) in sorted_entries(dir) {
                if !head.matches(&name) {
                    continue;
                }
                if tail.is_empty() {
                    out.push(path);
                } else if path.is_dir() {
                    expand(&path, tail, out);
                }
            }
        }
        Component::AnyDepth => {
            expand(dir, tail, out);
            for (_, path) in sorted_entries(dir) {
                if path.is_dir() && !is_symlink(&path) {
                    expand(&path, rest, out);
                }
            }
        }
    }
}

fn sorted_entries(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(read) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut entries: Vec<(String, PathBuf)> = read
        .filter_map(|e| e.ok())
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
