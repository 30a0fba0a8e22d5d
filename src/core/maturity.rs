//! Maturity: the feedback-driven trust level of a learning record.
//!
//! A learning is a JSONL file whose first line holds its metadata. The
//! transition rules are a pure function of that line:
//!
//! | from          | to            | when                                                   |
//! |---------------|---------------|--------------------------------------------------------|
//! | any           | anti-pattern  | utility <= 0.2 and harmful_count >= 5 (checked first)  |
//! | provisional   | candidate     | utility >= 0.7 and reward_count >= 3                   |
//! | candidate     | established   | utility >= 0.7, reward_count >= 5, helpful > harmful   |
//! | candidate     | provisional   | utility < 0.3                                          |
//! | established   | candidate     | utility < 0.5                                          |
//! | anti-pattern  | provisional   | utility >= 0.6 and helpful > 2 * harmful               |
//!
//! A maturity outside the table is only subject to the anti-pattern rule.
//!
//! Applying a transition rewrites the first line only. Fields this module
//! does not know about, and known fields holding values of the wrong type,
//! are carried through untouched, and every later line is left
//! byte-for-byte as it was.

use crate::core::citation;
use crate::core::error::RatchetError;
use crate::core::glob;
use crate::core::time;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const INITIAL_UTILITY: f64 = 0.5;
pub const INITIAL_CONFIDENCE: f64 = 0.5;
pub const PROMOTION_UTILITY: f64 = 0.7;
pub const DEMOTION_UTILITY: f64 = 0.3;
pub const ANTI_PATTERN_UTILITY: f64 = 0.2;
pub const MIN_REWARDS_FOR_PROMOTION: u32 = 3;
pub const MIN_REWARDS_FOR_ESTABLISHED: u32 = 5;
pub const MIN_HARMFUL_FOR_ANTI_PATTERN: u32 = 5;
pub const ESTABLISHED_DEMOTION_UTILITY: f64 = 0.5;
pub const REHABILITATION_UTILITY: f64 = 0.6;

pub const EVICTION_UTILITY: f64 = 0.3;
pub const EVICTION_CONFIDENCE: f64 = 0.2;
pub const EVICTION_CITATION_WINDOW_DAYS: i64 = 90;

const LEARNING_GLOB: &str = "*.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Maturity {
    #[default]
    Provisional,
    Candidate,
    Established,
    AntiPattern,
}

impl Maturity {
    pub fn as_str(self) -> &'static str {
        match self {
            Maturity::Provisional => "provisional",
            Maturity::Candidate => "candidate",
            Maturity::Established => "established",
            Maturity::AntiPattern => "anti-pattern",
        }
    }
}

impl fmt::Display for Maturity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Maturity {
    type Err = RatchetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisional" => Ok(Maturity::Provisional),
            "candidate" => Ok(Maturity::Candidate),
            "established" => Ok(Maturity::Established),
            "anti-pattern" => Ok(Maturity::AntiPattern),
            other => Err(RatchetError::malformed(
                "maturity",
                format!("unrecognized value '{}'", other),
            )),
        }
    }
}

/// Metadata line of a learning file.
///
/// Absent fields stay absent on rewrite; defaults are applied when the
/// record is evaluated, not when it is stored. Numbers are kept exactly as
/// written. A known key whose value has the wrong type (or a maturity that
/// is not one of the known levels) is left in `extra` under its own key, so
/// it survives a rewrite while evaluation falls back to the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct LearningRecord {
    pub id: Option<String>,
    pub maturity: Option<Maturity>,
    pub utility: Option<Number>,
    pub confidence: Option<Number>,
    pub helpful_count: Option<Number>,
    pub harmful_count: Option<Number>,
    pub reward_count: Option<Number>,
    pub maturity_changed_at: Option<DateTime<Utc>>,
    pub maturity_reason: Option<String>,
    /// Every other key on the line, kept in its original order.
    pub extra: Map<String, Value>,
}

impl From<Map<String, Value>> for LearningRecord {
    fn from(fields: Map<String, Value>) -> Self {
        let mut record = LearningRecord::default();
        for (key, value) in fields {
            let raw = match key.as_str() {
                "id" => keep(&mut record.id, value, |v| v.as_str().map(str::to_string)),
                "maturity" => keep(&mut record.maturity, value, |v| {
                    v.as_str().and_then(|s| s.parse().ok())
                }),
                "utility" => keep(&mut record.utility, value, number),
                "confidence" => keep(&mut record.confidence, value, number),
                "helpful_count" => keep(&mut record.helpful_count, value, number),
                "harmful_count" => keep(&mut record.harmful_count, value, number),
                "reward_count" => keep(&mut record.reward_count, value, number),
                "maturity_changed_at" => keep(&mut record.maturity_changed_at, value, |v| {
                    v.as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|t| t.with_timezone(&Utc))
                }),
                "maturity_reason" => {
                    keep(&mut record.maturity_reason, value, |v| v.as_str().map(str::to_string))
                }
                _ => Some(value),
            };
            if let Some(raw) = raw {
                record.extra.insert(key, raw);
            }
        }
        record
    }
}

impl From<LearningRecord> for Map<String, Value> {
    fn from(record: LearningRecord) -> Self {
        let mut fields = record.extra;
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                fields.insert(key.to_string(), value);
            }
        };
        put("id", record.id.map(Value::String));
        put("maturity", record.maturity.map(|m| Value::String(m.as_str().to_string())));
        put("utility", record.utility.map(Value::Number));
        put("confidence", record.confidence.map(Value::Number));
        put("helpful_count", record.helpful_count.map(Value::Number));
        put("harmful_count", record.harmful_count.map(Value::Number));
        put("reward_count", record.reward_count.map(Value::Number));
        put(
            "maturity_changed_at",
            record
                .maturity_changed_at
                .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        );
        put("maturity_reason", record.maturity_reason.map(Value::String));
        fields
    }
}

/// Stores the converted value in `slot`, or hands the raw value back when
/// it does not convert.
fn keep<T>(
    slot: &mut Option<T>,
    value: Value,
    convert: impl FnOnce(&Value) -> Option<T>,
) -> Option<Value> {
    match convert(&value) {
        Some(typed) => {
            *slot = Some(typed);
            None
        }
        None => Some(value),
    }
}

fn number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        _ => None,
    }
}

/// Counters may have been written as floats; they are truncated for
/// evaluation only.
fn count(n: Option<&Number>) -> u32 {
    n.and_then(Number::as_f64)
        .map(|v| v.max(0.0) as u32)
        .unwrap_or(0)
}

impl LearningRecord {
    pub fn parse_line(line: &str) -> Result<Self, RatchetError> {
        if line.trim().is_empty() {
            return Err(RatchetError::malformed(
                "learning metadata",
                "empty learning file",
            ));
        }
        serde_json::from_str(line).map_err(|e| RatchetError::malformed("learning metadata", e))
    }

    /// A non-empty stored maturity that is not one of the known levels.
    pub fn unrecognized_maturity(&self) -> Option<&str> {
        if self.maturity.is_some() {
            return None;
        }
        self.extra
            .get("maturity")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// `None` for an unrecognized maturity. Missing, empty or non-string
    /// values read as provisional.
    pub fn maturity(&self) -> Option<Maturity> {
        match self.unrecognized_maturity() {
            Some(_) => None,
            None => Some(self.maturity.unwrap_or_default()),
        }
    }

    pub fn utility(&self) -> f64 {
        self.utility
            .as_ref()
            .and_then(Number::as_f64)
            .unwrap_or(INITIAL_UTILITY)
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
            .as_ref()
            .and_then(Number::as_f64)
            .unwrap_or(INITIAL_CONFIDENCE)
    }

    pub fn helpful_count(&self) -> u32 {
        count(self.helpful_count.as_ref())
    }

    pub fn harmful_count(&self) -> u32 {
        count(self.harmful_count.as_ref())
    }

    pub fn reward_count(&self) -> u32 {
        count(self.reward_count.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaturityTransitionResult {
    pub learning_id: String,
    /// `None` when the stored maturity is not a known level.
    pub old_maturity: Option<Maturity>,
    pub new_maturity: Option<Maturity>,
    pub transitioned: bool,
    pub reason: String,
    pub utility: f64,
    pub confidence: f64,
    pub helpful_count: u32,
    pub harmful_count: u32,
    pub reward_count: u32,
}

impl MaturityTransitionResult {
    fn stay(&mut self, reason: &str) {
        self.reason = reason.to_string();
    }

    fn move_to(&mut self, maturity: Maturity, reason: String) {
        self.new_maturity = Some(maturity);
        self.transitioned = self.old_maturity != Some(maturity);
        self.reason = reason;
    }
}

/// Evaluates the transition rules for one record. Pure: the same record
/// always yields the same result.
///
/// The anti-pattern rule applies to every record, including one whose
/// maturity is not recognized. Such a record is otherwise left alone.
pub fn evaluate(learning_id: &str, record: &LearningRecord) -> MaturityTransitionResult {
    let current = record.maturity();
    let mut r = MaturityTransitionResult {
        learning_id: record
            .id
            .clone()
            .unwrap_or_else(|| learning_id.to_string()),
        old_maturity: current,
        new_maturity: current,
        transitioned: false,
        reason: String::new(),
        utility: record.utility(),
        confidence: record.confidence(),
        helpful_count: record.helpful_count(),
        harmful_count: record.harmful_count(),
        reward_count: record.reward_count(),
    };

    if r.utility <= ANTI_PATTERN_UTILITY && r.harmful_count >= MIN_HARMFUL_FOR_ANTI_PATTERN {
        let reason = format!(
            "utility {:.2} <= {:.2} and harmful_count {} >= {}",
            r.utility, ANTI_PATTERN_UTILITY, r.harmful_count, MIN_HARMFUL_FOR_ANTI_PATTERN
        );
        r.move_to(Maturity::AntiPattern, reason);
        return r;
    }

    match current {
        None => {
            let raw = record.unrecognized_maturity().unwrap_or_default();
            r.stay(&format!("unrecognized maturity '{}'", raw));
        }
        Some(Maturity::Provisional) => {
            if r.utility >= PROMOTION_UTILITY && r.reward_count >= MIN_REWARDS_FOR_PROMOTION {
                let reason = format!(
                    "utility {:.2} >= {:.2} and reward_count {} >= {}",
                    r.utility, PROMOTION_UTILITY, r.reward_count, MIN_REWARDS_FOR_PROMOTION
                );
                r.move_to(Maturity::Candidate, reason);
            } else {
                r.stay("not enough positive feedback for promotion");
            }
        }
        Some(Maturity::Candidate) => {
            if r.utility >= PROMOTION_UTILITY
                && r.reward_count >= MIN_REWARDS_FOR_ESTABLISHED
                && r.helpful_count > r.harmful_count
            {
                let reason = format!(
                    "utility {:.2} >= {:.2}, reward_count {} >= {}, helpful > harmful ({} > {})",
                    r.utility,
                    PROMOTION_UTILITY,
                    r.reward_count,
                    MIN_REWARDS_FOR_ESTABLISHED,
                    r.helpful_count,
                    r.harmful_count
                );
                r.move_to(Maturity::Established, reason);
            } else if r.utility < DEMOTION_UTILITY {
                let reason = format!(
                    "utility {:.2} < {:.2} (demotion)",
                    r.utility, DEMOTION_UTILITY
                );
                r.move_to(Maturity::Provisional, reason);
            } else {
                r.stay("maintaining candidate status");
            }
        }
        Some(Maturity::Established) => {
            if r.utility < ESTABLISHED_DEMOTION_UTILITY {
                let reason = format!(
                    "utility {:.2} < {:.1} (demotion from established)",
                    r.utility, ESTABLISHED_DEMOTION_UTILITY
                );
                r.move_to(Maturity::Candidate, reason);
            } else {
                r.stay("maintaining established status");
            }
        }
        Some(Maturity::AntiPattern) => {
            if r.utility >= REHABILITATION_UTILITY && r.helpful_count > r.harmful_count * 2 {
                let reason = format!(
                    "utility {:.2} >= {:.1} and helpful > 2*harmful ({} > {}) - rehabilitation",
                    r.utility,
                    REHABILITATION_UTILITY,
                    r.helpful_count,
                    r.harmful_count * 2
                );
                r.move_to(Maturity::Provisional, reason);
            } else {
                r.stay("maintaining anti-pattern status");
            }
        }
    }
    r
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whole file contents plus its parsed first line.
fn read_learning(path: &Path) -> Result<(String, LearningRecord), RatchetError> {
    let content = fs::read_to_string(path).map_err(RatchetError::io("read learning"))?;
    let first = content.split('\n').next().unwrap_or("");
    let record = LearningRecord::parse_line(first)?;
    Ok((content, record))
}

/// Evaluates a learning file without changing it.
pub fn check_maturity_transition(path: &Path) -> Result<MaturityTransitionResult, RatchetError> {
    let (_, record) = read_learning(path)?;
    Ok(evaluate(&file_name(path), &record))
}

/// Evaluates a learning file and, if it transitions, records the new
/// maturity, change time and reason on its first line.
pub fn apply_maturity_transition(path: &Path) -> Result<MaturityTransitionResult, RatchetError> {
    let (content, mut record) = read_learning(path)?;
    let result = evaluate(&file_name(path), &record);
    if !result.transitioned {
        return Ok(result);
    }

    record.maturity = result.new_maturity;
    record.maturity_changed_at = Some(time::now_utc());
    record.maturity_reason = Some(result.reason.clone());

    let rest = content.find('\n').map(|i| &content[i..]).unwrap_or("");
    let mut updated = serde_json::to_string(&record)?;
    updated.push_str(rest);
    fs::write(path, updated).map_err(RatchetError::io("write learning"))?;

    tracing::info!(
        learning = %result.learning_id,
        from = ?result.old_maturity,
        to = ?result.new_maturity,
        reason = %result.reason,
        "maturity transition applied"
    );
    Ok(result)
}

fn learning_files(dir: &Path) -> Result<Vec<PathBuf>, RatchetError> {
    glob::glob(dir, LEARNING_GLOB)
}

/// Parsed first lines of every learning in `dir`; unreadable or malformed
/// files are skipped.
fn learning_records(dir: &Path) -> Result<Vec<(PathBuf, LearningRecord)>, RatchetError> {
    Ok(learning_files(dir)?
        .into_iter()
        .filter_map(|path| match read_learning(&path) {
            Ok((_, record)) => Some((path, record)),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping learning");
                None
            }
        })
        .collect())
}

/// Learnings that would change maturity if applied now.
pub fn scan_for_maturity_transitions(
    dir: &Path,
) -> Result<Vec<MaturityTransitionResult>, RatchetError> {
    Ok(learning_records(dir)?
        .iter()
        .map(|(path, record)| evaluate(&file_name(path), record))
        .filter(|r| r.transitioned)
        .collect())
}

/// Applies every pending transition in `dir` and returns those applied.
pub fn apply_pending_transitions(
    dir: &Path,
) -> Result<Vec<MaturityTransitionResult>, RatchetError> {
    let mut applied = Vec::new();
    for path in learning_files(dir)? {
        match apply_maturity_transition(&path) {
            Ok(result) if result.transitioned => applied.push(result),
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping learning");
            }
        }
    }
    Ok(applied)
}

fn with_maturity(dir: &Path, maturity: Maturity) -> Result<Vec<PathBuf>, RatchetError> {
    Ok(learning_records(dir)?
        .into_iter()
        .filter(|(_, record)| record.maturity == Some(maturity))
        .map(|(path, _)| path)
        .collect())
}

pub fn anti_patterns(dir: &Path) -> Result<Vec<PathBuf>, RatchetError> {
    with_maturity(dir, Maturity::AntiPattern)
}

pub fn established_learnings(dir: &Path) -> Result<Vec<PathBuf>, RatchetError> {
    with_maturity(dir, Maturity::Established)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaturityDistribution {
    pub provisional: usize,
    pub candidate: usize,
    pub established: usize,
    pub anti_pattern: usize,
    pub unknown: usize,
    pub total: usize,
}

impl MaturityDistribution {
    fn count(&mut self, maturity: Option<Maturity>) {
        match maturity {
            Some(Maturity::Provisional) => self.provisional += 1,
            Some(Maturity::Candidate) => self.candidate += 1,
            Some(Maturity::Established) => self.established += 1,
            Some(Maturity::AntiPattern) => self.anti_pattern += 1,
            None => self.unknown += 1,
        }
        self.total += 1;
    }
}

/// Counts learnings per maturity. A missing or empty maturity counts as
/// provisional; an unrecognized maturity or a metadata line that does not
/// parse counts as unknown.
/// Unreadable and empty files are not counted.
pub fn maturity_distribution(dir: &Path) -> Result<MaturityDistribution, RatchetError> {
    let mut dist = MaturityDistribution::default();
    for path in learning_files(dir)? {
        let Ok(content) = fs::read_to_string(&path) else {
            tracing::debug!(path = %path.display(), "skipping unreadable learning");
            continue;
        };
        if content.is_empty() {
            continue;
        }
        let first = content.split('\n').next().unwrap_or("");
        match LearningRecord::parse_line(first) {
            Ok(record) => dist.count(record.maturity()),
            Err(_) => dist.count(None),
        }
    }
    Ok(dist)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictionCandidate {
    pub path: PathBuf,
    pub name: String,
    pub utility: f64,
    pub confidence: f64,
    pub maturity: Option<Maturity>,
    /// `None` when the learning was never cited.
    pub last_cited: Option<DateTime<Utc>>,
}

/// Low-value learnings nobody has cited recently: utility below 0.3,
/// confidence below 0.2, not established, and no citation within 90 days
/// of `now`.
pub fn eviction_candidates(
    learnings_dir: &Path,
    base_dir: &Path,
    now: DateTime<Utc>,
) -> Result<Vec<EvictionCandidate>, RatchetError> {
    let last_cited: HashMap<String, DateTime<Utc>> = citation::last_cited_map(base_dir)
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "citation log unreadable, treating learnings as uncited");
            HashMap::new()
        });
    let cutoff = now - Duration::days(EVICTION_CITATION_WINDOW_DAYS);

    let mut candidates = Vec::new();
    for (path, record) in learning_records(learnings_dir)? {
        let maturity = record.maturity();
        if maturity == Some(Maturity::Established)
            || record.utility() >= EVICTION_UTILITY
            || record.confidence() >= EVICTION_CONFIDENCE
        {
            continue;
        }

        let key = citation::canonical_artifact_path(base_dir, &path.to_string_lossy());
        let cited = last_cited.get(&key).copied();
        if cited.is_some_and(|at| at > cutoff) {
            continue;
        }

        candidates.push(EvictionCandidate {
            name: file_name(&path),
            path,
            utility: record.utility(),
            confidence: record.confidence(),
            maturity,
            last_cited: cited,
        });
    }
    Ok(candidates)
}
