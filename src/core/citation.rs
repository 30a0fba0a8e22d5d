//! Citation log: one JSON object per line at `.agents/ao/citations.jsonl`.
//!
//! Artifact paths are canonicalized on write and on read, so a relative and
//! an absolute reference to the same file count as the same artifact.

use crate::core::error::RatchetError;
use crate::core::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

pub const CITATIONS_FILE: &str = ".agents/ao/citations.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationEvent {
    pub artifact_path: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cited_at: DateTime<Utc>,
    /// "retrieved", "applied" or "reference".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub citation_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub feedback_given: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_reward: Option<f64>,
}

impl CitationEvent {
    pub fn new(artifact_path: &str, session_id: &str) -> Self {
        Self {
            artifact_path: artifact_path.to_string(),
            session_id: session_id.to_string(),
            cited_at: time::now_utc(),
            citation_type: String::new(),
            query: String::new(),
            feedback_given: false,
            feedback_reward: None,
        }
    }

    pub fn with_type(mut self, citation_type: &str) -> Self {
        self.citation_type = citation_type.to_string();
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    pub fn at(mut self, cited_at: DateTime<Utc>) -> Self {
        self.cited_at = cited_at;
        self
    }
}

/// Cleans `artifact_path` lexically and anchors it at `base_dir` when
/// relative. Empty input stays empty.
pub fn canonical_artifact_path(base_dir: &Path, artifact_path: &str) -> String {
    let trimmed = artifact_path.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let raw = Path::new(trimmed);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        let base = if base_dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            base_dir
        };
        base.join(raw)
    };
    let absolute = std::path::absolute(&joined).unwrap_or(joined);
    clean_path(&absolute).to_string_lossy().into_owned()
}

/// Resolves `.` and `..` components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

pub fn citations_path(base_dir: &Path) -> PathBuf {
    base_dir.join(CITATIONS_FILE)
}

/// Appends `event`, creating the log and its directory on first use.
pub fn record_citation(base_dir: &Path, mut event: CitationEvent) -> Result<(), RatchetError> {
    if event.cited_at == DateTime::<Utc>::default() {
        event.cited_at = time::now_utc();
    }
    event.artifact_path = canonical_artifact_path(base_dir, &event.artifact_path);

    let path = citations_path(base_dir);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(RatchetError::io("create citations directory"))?;
    }

    let mut line = serde_json::to_vec(&event)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(RatchetError::io("open citations file"))?;
    file.write_all(&line)
        .map_err(RatchetError::io("write citation"))
}

/// Every parseable citation in log order. A missing log is empty.
pub fn load_citations(base_dir: &Path) -> Result<Vec<CitationEvent>, RatchetError> {
    let path = citations_path(base_dir);
    let file = match fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RatchetError::io("open citations file")(e)),
    };

    let mut citations = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(RatchetError::io("read citations"))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CitationEvent>(&line) {
            Ok(mut event) => {
                event.artifact_path = canonical_artifact_path(base_dir, &event.artifact_path);
                citations.push(event);
            }
            Err(err) => {
                tracing::debug!(line = idx + 1, error = %err, "skipping malformed citation");
            }
        }
    }
    Ok(citations)
}

pub fn count_citations_for_artifact(
    base_dir: &Path,
    artifact_path: &str,
) -> Result<usize, RatchetError> {
    let target = canonical_artifact_path(base_dir, artifact_path);
    Ok(load_citations(base_dir)?
        .iter()
        .filter(|c| c.artifact_path == target)
        .count())
}

/// Citations strictly after `since`.
pub fn citations_since(
    base_dir: &Path,
    since: DateTime<Utc>,
) -> Result<Vec<CitationEvent>, RatchetError> {
    Ok(load_citations(base_dir)?
        .into_iter()
        .filter(|c| c.cited_at > since)
        .collect())
}

/// Distinct artifacts cited strictly between `since` and `until`, in order
/// of first citation.
pub fn unique_cited_artifacts(
    base_dir: &Path,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<String>, RatchetError> {
    let mut seen = HashSet::new();
    Ok(load_citations(base_dir)?
        .into_iter()
        .filter(|c| c.cited_at > since && c.cited_at < until)
        .map(|c| c.artifact_path)
        .filter(|p| seen.insert(p.clone()))
        .collect())
}

pub fn citations_for_session(
    base_dir: &Path,
    session_id: &str,
) -> Result<Vec<CitationEvent>, RatchetError> {
    Ok(load_citations(base_dir)?
        .into_iter()
        .filter(|c| c.session_id == session_id)
        .collect())
}

/// Latest citation time per canonical artifact path.
pub fn last_cited_map(base_dir: &Path) -> Result<HashMap<String, DateTime<Utc>>, RatchetError> {
    let mut map: HashMap<String, DateTime<Utc>> = HashMap::new();
    for citation in load_citations(base_dir)? {
        if citation.artifact_path.is_empty() {
            continue;
        }
        map.entry(citation.artifact_path)
            .and_modify(|at| {
                if citation.cited_at > *at {
                    *at = citation.cited_at;
                }
            })
            .or_insert(citation.cited_at);
    }
    Ok(map)
}
