//! The ratchet chain: an append-only record of step completions.
//!
//! On disk the chain is JSONL at `<project>/.agents/ao/chain.jsonl`. Line 1
//! is metadata (`id`, `started`, `epic_id`); every following line is one
//! [`ChainEntry`]. Older projects kept a single YAML document at
//! `.agents/provenance/chain.yaml`, which is read and converted on load.
//!
//! Reads are lock-free. [`Chain::save`] and [`Chain::append`] both hold an
//! exclusive advisory lock on the chain file for the duration of the write,
//! so independent processes appending to one chain serialize instead of
//! interleaving.
//!
//! A project with no `.agents` directory anywhere above the start directory
//! gets one created under the start directory on first write.
//!
//! The latest entry for a step always wins: a re-run appends a new entry
//! and never rewrites history.

use crate::core::error::RatchetError;
use crate::core::lock::FileLease;
use crate::core::step::{Step, StepStatus, Tier};
use crate::core::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const AGENTS_DIR: &str = ".agents";
pub const CHAIN_DIR: &str = "ao";
pub const CHAIN_FILE: &str = "chain.jsonl";
pub const LEGACY_CHAIN_DIR: &str = "provenance";
pub const LEGACY_CHAIN_FILE: &str = "chain.yaml";

/// A single step completion (or skip).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub step: Step,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(default)]
    pub output: String,
    /// The ratchet is engaged; this step is an immutable checkpoint.
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    /// RPI iteration number; 1 for the first cycle.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cycle: u32,
    /// Epic from the prior cycle, for iterative re-runs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_epic: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ChainEntry {
    /// A locked completion of `step` producing `output`.
    pub fn completed(step: Step, output: &str) -> Self {
        Self {
            step,
            timestamp: time::now_utc(),
            input: String::new(),
            output: output.to_string(),
            locked: true,
            skipped: false,
            reason: String::new(),
            tier: None,
            location: String::new(),
            cycle: 0,
            parent_epic: String::new(),
        }
    }

    /// An intentional skip of `step`.
    pub fn skipped(step: Step, reason: &str) -> Self {
        Self {
            locked: false,
            skipped: true,
            reason: reason.to_string(),
            ..Self::completed(step, "")
        }
    }

    pub fn with_input(mut self, input: &str) -> Self {
        self.input = input.to_string();
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }

    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_parent_epic(mut self, epic: &str) -> Self {
        self.parent_epic = epic.to_string();
        self
    }

    pub fn unlocked(mut self) -> Self {
        self.locked = false;
        self
    }

    pub fn status(&self) -> StepStatus {
        if self.skipped {
            StepStatus::Skipped
        } else if self.locked {
            StepStatus::Locked
        } else {
            StepStatus::InProgress
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainMeta {
    id: String,
    started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    epic_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub id: String,
    pub started: DateTime<Utc>,
    pub entries: Vec<ChainEntry>,
    pub epic_id: Option<String>,
    path: Option<PathBuf>,
}

/// What the workflow should do next, derived from the chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextStep {
    pub next: Option<Step>,
    pub reason: String,
    pub last_step: Option<Step>,
    pub last_artifact: String,
    pub skill: String,
    pub complete: bool,
}

/// One hop in a provenance trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub step: Step,
    pub input: String,
    pub output: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub entries: usize,
    pub from: PathBuf,
    pub to: PathBuf,
}

impl Chain {
    /// A fresh chain with no entries. Nothing touches disk until the first
    /// save or append.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            id: time::generate_chain_id(),
            started: time::now_utc(),
            entries: Vec::new(),
            epic_id: None,
            path,
        }
    }

    /// Loads the chain for the project containing `start_dir`.
    ///
    /// Tries the JSONL file, then the legacy YAML file, and otherwise returns
    /// a fresh chain pointed at the JSONL location. Never fails: a missing or
    /// unreadable chain is the same as no chain yet.
    ///
    /// With no `.agents` directory at or above `start_dir` the chain points
    /// at `<start_dir>/.agents/ao/chain.jsonl`, and the first save or append
    /// creates that directory. An unreadable JSONL file is never overwritten
    /// by the fresh chain: [`Chain::append`] refuses it.
    pub fn load(start_dir: &Path) -> Chain {
        let agents_dir = match find_agents_dir(start_dir) {
            Some(dir) => dir,
            None => {
                return Chain::new(Some(chain_path_for(&start_dir.join(AGENTS_DIR))));
            }
        };

        let chain_path = chain_path_for(&agents_dir);
        if chain_path.exists() {
            match Chain::load_jsonl(&chain_path) {
                Ok(chain) => return chain,
                Err(err) => {
                    tracing::warn!(path = %chain_path.display(), error = %err, "unreadable chain, falling back");
                }
            }
        }

        let legacy_path = legacy_path_for(&agents_dir);
        if legacy_path.exists() {
            match Chain::load_legacy_yaml(&legacy_path) {
                Ok(mut chain) => {
                    tracing::info!(
                        from = %legacy_path.display(),
                        to = %chain_path.display(),
                        "migrating legacy chain"
                    );
                    chain.path = Some(chain_path);
                    return chain;
                }
                Err(err) => {
                    tracing::warn!(path = %legacy_path.display(), error = %err, "unreadable legacy chain");
                }
            }
        }

        Chain::new(Some(chain_path))
    }

    /// Parses a JSONL chain. A malformed metadata line is an error; a
    /// malformed entry line is skipped.
    pub fn load_jsonl(path: &Path) -> Result<Chain, RatchetError> {
        let file = fs::File::open(path).map_err(RatchetError::io("open chain file"))?;
        let reader = BufReader::new(file);

        let mut meta: Option<ChainMeta> = None;
        let mut entries = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(RatchetError::io("read chain"))?;
            if line.trim().is_empty() {
                continue;
            }
            if meta.is_none() {
                let parsed: ChainMeta = serde_json::from_str(&line)
                    .map_err(|e| RatchetError::malformed("chain metadata", e))?;
                meta = Some(parsed);
                continue;
            }
            match serde_json::from_str::<ChainEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::debug!(line = idx + 1, error = %err, "skipping malformed chain entry");
                }
            }
        }

        let meta = meta.ok_or_else(|| RatchetError::malformed("chain metadata", "empty chain file"))?;
        Ok(Chain {
            id: meta.id,
            started: meta.started,
            entries,
            epic_id: meta.epic_id.filter(|e| !e.is_empty()),
            path: Some(path.to_path_buf()),
        })
    }

    /// Parses the legacy single-document YAML chain. The returned chain has
    /// no path; callers decide where it should be written.
    pub fn load_legacy_yaml(path: &Path) -> Result<Chain, RatchetError> {
        let data = fs::read_to_string(path).map_err(RatchetError::io("read legacy chain"))?;
        let legacy: LegacyChain = serde_yaml::from_str(&data)
            .map_err(|e| RatchetError::malformed("legacy chain", e))?;

        Ok(Chain {
            id: legacy.id,
            started: time::parse_time_or_now(&legacy.started),
            entries: legacy.chain.into_iter().map(ChainEntry::from).collect(),
            epic_id: legacy.epic_id.filter(|e| !e.is_empty()),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: &Path) {
        self.path = Some(path.to_path_buf());
    }

    fn require_path(&self) -> Result<&Path, RatchetError> {
        self.path.as_deref().ok_or(RatchetError::ChainNoPath)
    }

    /// Rewrites the whole file (metadata plus every entry) under the lock.
    pub fn save(&self) -> Result<(), RatchetError> {
        let path = self.require_path()?;
        let mut opts = OpenOptions::new();
        opts.create(true).write(true).truncate(false);

        let mut lease = FileLease::acquire(path, &opts)?;
        lease.truncate()?;
        lease.write_line(&self.metadata_line()?)?;
        for entry in &self.entries {
            lease.write_line(&serde_json::to_vec(entry)?)?;
        }
        Ok(())
    }

    /// Appends one entry under the lock and mirrors it into memory.
    ///
    /// An empty file gets the metadata header and every entry already held
    /// in memory first, so a chain read from the legacy YAML keeps its
    /// history. A file whose header does not parse is left untouched and
    /// the append fails with [`RatchetError::Malformed`].
    pub fn append(&mut self, entry: ChainEntry) -> Result<(), RatchetError> {
        let path = self.require_path()?;
        let mut opts = OpenOptions::new();
        opts.read(true).create(true).append(true);

        let line = serde_json::to_vec(&entry)?;
        let mut lease = FileLease::acquire(path, &opts)?;
        match first_line(&lease)? {
            Some(header) => {
                serde_json::from_str::<ChainMeta>(&header)
                    .map_err(|e| RatchetError::malformed("chain metadata", e))?;
            }
            None => {
                lease.truncate()?;
                lease.write_line(&self.metadata_line()?)?;
                for existing in &self.entries {
                    lease.write_line(&serde_json::to_vec(existing)?)?;
                }
            }
        }
        lease.write_line(&line)?;
        drop(lease);

        self.entries.push(entry);
        Ok(())
    }

    fn metadata_line(&self) -> Result<Vec<u8>, RatchetError> {
        let meta = ChainMeta {
            id: self.id.clone(),
            started: self.started,
            epic_id: self.epic_id.clone(),
        };
        Ok(serde_json::to_vec(&meta)?)
    }

    /// Most recent entry for `step`.
    pub fn latest(&self, step: Step) -> Option<&ChainEntry> {
        self.entries.iter().rev().find(|e| e.step == step)
    }

    pub fn is_locked(&self, step: Step) -> bool {
        self.latest(step).is_some_and(|e| e.locked)
    }

    pub fn status(&self, step: Step) -> StepStatus {
        self.latest(step)
            .map(ChainEntry::status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn all_status(&self) -> BTreeMap<Step, StepStatus> {
        Step::all()
            .into_iter()
            .map(|step| (step, self.status(step)))
            .collect()
    }

    /// Next step to run, based on the latest locked or skipped entry.
    pub fn next_step(&self) -> NextStep {
        let first = Step::Research;
        let start = |reason: &str| NextStep {
            next: Some(first),
            reason: reason.to_string(),
            last_step: None,
            last_artifact: String::new(),
            skill: first.skill_hint().to_string(),
            complete: false,
        };

        if self.entries.is_empty() {
            return start("no steps completed yet");
        }
        let Some(last) = self.entries.iter().rev().find(|e| e.locked || e.skipped) else {
            return start("no steps locked yet");
        };

        let advance = |next: Step| NextStep {
            next: Some(next),
            reason: format!("{} locked", last.step),
            last_step: Some(last.step),
            last_artifact: last.output.clone(),
            skill: next.skill_hint().to_string(),
            complete: false,
        };

        match last.step {
            Step::PostMortem => NextStep {
                next: None,
                reason: "all steps completed".to_string(),
                last_step: Some(last.step),
                last_artifact: last.output.clone(),
                skill: String::new(),
                complete: true,
            },
            Step::Research => advance(Step::PreMortem),
            Step::PreMortem => advance(Step::Plan),
            Step::Plan => advance(Step::Implement),
            Step::Implement | Step::Crank => advance(Step::Vibe),
            Step::Vibe => advance(Step::PostMortem),
            Step::Invalid => NextStep {
                next: None,
                reason: "unexpected state".to_string(),
                last_step: Some(last.step),
                last_artifact: last.output.clone(),
                skill: String::new(),
                complete: false,
            },
        }
    }

    /// Walks backward from the entry that produced `artifact`, following each
    /// entry's input to its producer. Returned oldest first.
    pub fn trace(&self, artifact: &str) -> Vec<TraceEntry> {
        let mut trace = Vec::new();
        let mut current = artifact.to_string();

        for entry in self.entries.iter().rev() {
            if current.is_empty() {
                break;
            }
            if entry.output == current || entry.output.ends_with(&current) {
                trace.push(TraceEntry {
                    step: entry.step,
                    input: entry.input.clone(),
                    output: entry.output.clone(),
                    time: entry.timestamp,
                });
                current = entry.input.clone();
            }
        }

        trace.reverse();
        trace
    }
}

/// Converts the legacy YAML chain to JSONL. The legacy file is left in place.
pub fn migrate_chain(start_dir: &Path) -> Result<MigrationReport, RatchetError> {
    let agents_dir = find_agents_dir(start_dir).ok_or(RatchetError::AgentsDirNotFound)?;
    let legacy_path = legacy_path_for(&agents_dir);
    let new_path = chain_path_for(&agents_dir);

    if !legacy_path.exists() {
        return Err(RatchetError::NoLegacyChain(legacy_path));
    }

    let mut chain = Chain::load_legacy_yaml(&legacy_path)?;
    chain.path = Some(new_path.clone());
    chain.save()?;

    tracing::info!(
        entries = chain.entries.len(),
        from = %legacy_path.display(),
        to = %new_path.display(),
        "migrated legacy chain"
    );

    Ok(MigrationReport {
        entries: chain.entries.len(),
        from: legacy_path,
        to: new_path,
    })
}

/// Nearest `.agents` directory at or above `start_dir`.
pub fn find_agents_dir(start_dir: &Path) -> Option<PathBuf> {
    let start = std::path::absolute(start_dir).unwrap_or_else(|_| start_dir.to_path_buf());
    start
        .ancestors()
        .map(|dir| dir.join(AGENTS_DIR))
        .find(|candidate| candidate.is_dir())
}

/// First non-blank line of the leased file.
fn first_line(lease: &FileLease) -> Result<Option<String>, RatchetError> {
    for line in BufReader::new(lease.file()).lines() {
        let line = line.map_err(RatchetError::io("read chain"))?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

fn chain_path_for(agents_dir: &Path) -> PathBuf {
    agents_dir.join(CHAIN_DIR).join(CHAIN_FILE)
}

fn legacy_path_for(agents_dir: &Path) -> PathBuf {
    agents_dir.join(LEGACY_CHAIN_DIR).join(LEGACY_CHAIN_FILE)
}

#[derive(Debug, Deserialize)]
struct LegacyChain {
    #[serde(default)]
    id: String,
    #[serde(default)]
    started: String,
    #[serde(default)]
    epic_id: Option<String>,
    #[serde(default)]
    chain: Vec<LegacyEntry>,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    step: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    skipped: bool,
    #[serde(default)]
    reason: String,
}

impl From<LegacyEntry> for ChainEntry {
    fn from(e: LegacyEntry) -> Self {
        ChainEntry {
            step: Step::parse(&e.step),
            timestamp: time::parse_time_or_now(&e.timestamp),
            input: e.input,
            output: e.output,
            locked: e.locked,
            skipped: e.skipped,
            reason: e.reason,
            tier: None,
            location: String::new(),
            cycle: 0,
            parent_epic: String::new(),
        }
    }
}
