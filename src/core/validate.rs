//! Artifact validation before a step locks.
//!
//! [`Validator::validate_with_options`] runs a fixed pipeline where each
//! stage may end the run early:
//!
//! 1. existence: a missing artifact is a failing result, not an error
//! 2. lenient expiry: an expired lenient window forces strict mode
//! 3. schema version presence: hard in strict mode, a warning when lenient
//! 4. step-specific structure checks (warnings, except unreadable files)
//! 5. tier assessment from the issue and warning counts
//!
//! Promotion checks ([`Validator::validate_for_promotion`]) are a separate
//! entry point with tier-specific thresholds.

use crate::core::citation;
use crate::core::config::RatchetConfig;
use crate::core::error::RatchetError;
use crate::core::locator::Locator;
use crate::core::step::{Step, Tier};
use crate::core::time;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

const SCHEMA_VERSION_SPELLINGS: &[&str] = &[
    "schema_version:",
    "\"schema_version\"",
    "schema-version:",
    "\"schema-version\"",
];

const FRONTMATTER_SCHEMA_WARNING: &str = "Missing schema_version field in frontmatter - new artifacts should include schema_version: 1";

const SKILL_SECTIONS: &[&str] = &["## Description", "## Triggers", "## Instructions"];

const FORMULA_FIELDS: &[&str] = &["formula", "description", "version", "type"];

static VERSION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-v\d+\.md$").expect("static regex"));
static ARTIFACT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)artifact:\s*(/\S+)").expect("static regex"));
static SEE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)see\s+(/\S+)").expect("static regex"));

#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    pub lenient: bool,
    /// End of the lenient window; defaults to now plus the configured days.
    pub lenient_expiry: Option<DateTime<Utc>>,
}

impl ValidateOptions {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self {
            lenient: true,
            lenient_expiry: None,
        }
    }

    pub fn lenient_until(expiry: DateTime<Utc>) -> Self {
        Self {
            lenient: true,
            lenient_expiry: Some(expiry),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Step validated; `None` for promotion checks.
    pub step: Option<Step>,
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub lenient: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lenient_expiry_date: Option<DateTime<Utc>>,
    pub lenient_expiring_soon: bool,
}

impl ValidationResult {
    fn new(step: Option<Step>, lenient: bool) -> Self {
        Self {
            step,
            valid: true,
            issues: Vec::new(),
            warnings: Vec::new(),
            tier: None,
            lenient,
            lenient_expiry_date: None,
            lenient_expiring_soon: false,
        }
    }

    fn fail(&mut self, issue: impl Into<String>) {
        self.valid = false;
        self.issues.push(issue.into());
    }

    fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// Counts of strict and lenient runs plus the expiry recorded per lenient
/// artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationMetrics {
    pub lenient_count: u64,
    pub strict_count: u64,
    pub lenient_artifacts: BTreeMap<String, DateTime<Utc>>,
}

pub struct Validator {
    locator: Locator,
    lenient_expiry_days: i64,
    lenient_warning_days: i64,
    metrics: RwLock<ValidationMetrics>,
}

impl Validator {
    pub fn new(start_dir: &Path) -> Result<Self, RatchetError> {
        Self::from_config(start_dir, &RatchetConfig::load(start_dir)?)
    }

    pub fn from_config(start_dir: &Path, config: &RatchetConfig) -> Result<Self, RatchetError> {
        Ok(Self::with_locator(Locator::from_config(start_dir, config)?, config))
    }

    pub fn with_locator(locator: Locator, config: &RatchetConfig) -> Self {
        Self {
            locator,
            lenient_expiry_days: config.lenient_expiry_days,
            lenient_warning_days: config.lenient_warning_days,
            metrics: RwLock::new(ValidationMetrics::default()),
        }
    }

    /// Strict validation.
    pub fn validate(&self, step: Step, artifact: &Path) -> ValidationResult {
        self.validate_with_options(step, artifact, &ValidateOptions::strict())
    }

    pub fn validate_with_options(
        &self,
        step: Step,
        artifact: &Path,
        opts: &ValidateOptions,
    ) -> ValidationResult {
        let mut result = ValidationResult::new(Some(step), opts.lenient);
        let epic_ref = epic_reference(step, artifact);
        let path = self.resolve(artifact);

        if epic_ref.is_none() && !check_accessible(&path, artifact, &mut result) {
            return result;
        }

        if let Some(expiry) = self.lenient_expiry(opts)
            && !self.check_lenient_expiry(expiry, &mut result)
        {
            return result;
        }

        if epic_ref.is_none() && !self.check_schema_version(&path, opts, &mut result) {
            return result;
        }

        match epic_ref {
            Some(epic_id) => check_epic_reference(epic_id, &mut result),
            None => self.check_step(step, &path, &mut result),
        }

        result.tier = Some(assess_tier(&result));
        self.track_metrics(opts.lenient, artifact, result.lenient_expiry_date);
        result
    }

    /// Relative artifact paths are taken from the start directory, not the
    /// process working directory.
    fn resolve(&self, artifact: &Path) -> PathBuf {
        if artifact.is_absolute() {
            artifact.to_path_buf()
        } else {
            self.locator.start_dir().join(artifact)
        }
    }

    fn lenient_expiry(&self, opts: &ValidateOptions) -> Option<DateTime<Utc>> {
        if !opts.lenient {
            return None;
        }
        Some(
            opts.lenient_expiry
                .unwrap_or_else(|| time::now_utc() + Duration::days(self.lenient_expiry_days)),
        )
    }

    /// Returns false once the lenient window has closed.
    fn check_lenient_expiry(&self, expiry: DateTime<Utc>, result: &mut ValidationResult) -> bool {
        result.lenient_expiry_date = Some(expiry);
        let days = time::days_until(expiry, time::now_utc());

        if days <= 0.0 {
            result.fail(format!(
                "Lenient validation expired on {} - artifacts must be migrated",
                expiry.format("%Y-%m-%d")
            ));
            result.lenient = false;
            return false;
        }
        if days <= self.lenient_warning_days as f64 {
            result.lenient_expiring_soon = true;
            result.warn(format!(
                "Lenient validation expires in {} - artifacts must be migrated before then",
                time::format_days(days as i64)
            ));
        }
        true
    }

    fn check_schema_version(
        &self,
        artifact: &Path,
        opts: &ValidateOptions,
        result: &mut ValidationResult,
    ) -> bool {
        if has_schema_version(artifact) {
            return true;
        }
        if !opts.lenient {
            result.fail(
                "Missing schema_version field - artifact not compatible with current schema. \
                 Use lenient mode to bypass (temporary legacy support)",
            );
            return false;
        }
        result.warn("Missing schema_version field - using lenient legacy bypass");
        true
    }

    fn check_step(&self, step: Step, artifact: &Path, result: &mut ValidationResult) {
        let checker: fn(&Path, &str, &mut ValidationResult) = match step {
            Step::Research => check_research,
            Step::PreMortem => check_pre_mortem,
            Step::Plan => check_plan,
            Step::PostMortem => check_post_mortem,
            other => {
                result.warn(format!("No validation rules for step: {}", other));
                return;
            }
        };

        match fs::read_to_string(artifact) {
            Ok(text) => checker(artifact, &text, result),
            Err(err) => result.fail(format!("Cannot read file: {}", err)),
        }
    }

    /// Checks whether `artifact` meets the threshold for `target`.
    pub fn validate_for_promotion(&self, artifact: &Path, target: Tier) -> ValidationResult {
        let mut result = ValidationResult::new(None, false);
        let path = self.resolve(artifact);

        if !check_accessible(&path, artifact, &mut result) {
            return result;
        }

        match target {
            Tier::Learning => {
                let citations = self.count_citations(&path);
                if citations < 2 {
                    result.fail(format!(
                        "Promotion to learning tier requires 2+ citations (found: {})",
                        citations
                    ));
                }
            }
            Tier::Pattern => {
                let sessions = self.count_session_refs(&path);
                if sessions < 3 {
                    result.fail(format!(
                        "Promotion to pattern tier requires references in 3+ sessions (found: {})",
                        sessions
                    ));
                }
            }
            Tier::Skill => {
                if !has_skill_format(&path) {
                    result.fail("Promotion to skill tier requires SKILL.md format");
                }
            }
            Tier::Core => {
                result.warn("Core tier promotion requires manual review (10+ documented uses)");
            }
            Tier::Observation => {}
        }

        result.tier = Some(assess_tier(&result));
        result
    }

    /// Larger of the citation-log count and the number of markdown files in
    /// the artifact's directory that mention it by name.
    pub fn count_citations(&self, artifact: &Path) -> usize {
        let artifact = &self.resolve(artifact);
        let logged = citation::count_citations_for_artifact(
            self.locator.start_dir(),
            &artifact.to_string_lossy(),
        )
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "citation log unreadable");
            0
        });

        let Some(base_name) = artifact.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return logged;
        };
        let dir = artifact.parent().unwrap_or(self.locator.start_dir());
        let backlinks = walk_files(dir)
            .into_iter()
            .filter(|p| p != artifact && p.extension().is_some_and(|e| e == "md"))
            .filter(|p| file_contains(p, &base_name))
            .count();

        logged.max(backlinks)
    }

    /// Session transcripts (`.jsonl` or `.md`) that mention the artifact's
    /// file name, across the local, rig and town session directories.
    pub fn count_session_refs(&self, artifact: &Path) -> usize {
        let Some(base_name) = artifact.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return 0;
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        for dir in self.session_dirs() {
            for path in walk_files(&dir) {
                let transcript = path
                    .extension()
                    .is_some_and(|e| e == "jsonl" || e == "md");
                if transcript && !seen.contains(&path) && file_contains(&path, &base_name) {
                    seen.insert(path);
                }
            }
        }
        seen.len()
    }

    fn session_dirs(&self) -> Vec<PathBuf> {
        let sessions = |root: &Path| root.join(".agents").join("ao").join("sessions");
        let start = self.locator.start_dir();

        let mut dirs = vec![sessions(start)];
        if let Some(rig) = self.locator.rig_root()
            && rig != start
        {
            dirs.push(sessions(&rig));
        }
        dirs.push(sessions(self.locator.town_dir()));

        let mut unique = HashSet::new();
        dirs.retain(|d| d.is_dir() && unique.insert(d.clone()));
        dirs
    }

    fn track_metrics(&self, lenient: bool, artifact: &Path, expiry: Option<DateTime<Utc>>) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        if lenient {
            metrics.lenient_count += 1;
            if let Some(expiry) = expiry {
                metrics
                    .lenient_artifacts
                    .insert(artifact.display().to_string(), expiry);
            }
        } else {
            metrics.strict_count += 1;
        }
    }

    /// Snapshot of the metrics; later validations do not affect it.
    pub fn metrics(&self) -> ValidationMetrics {
        self.metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Fails `result` unless `path` exists. Errors other than absence (such as
/// permission denied on a parent directory) are reported as such.
fn check_accessible(path: &Path, shown: &Path, result: &mut ValidationResult) -> bool {
    match path.try_exists() {
        Ok(true) => true,
        Ok(false) => {
            result.fail(format!("Artifact not found: {}", shown.display()));
            false
        }
        Err(err) => {
            result.fail(format!("Cannot access artifact {}: {}", shown.display(), err));
            false
        }
    }
}

/// Lowest tier when invalid, pattern when clean, learning with at most two
/// warnings, observation otherwise.
pub fn assess_tier(result: &ValidationResult) -> Tier {
    if !result.valid {
        return Tier::Observation;
    }
    match (result.issues.len(), result.warnings.len()) {
        (0, 0) => Tier::Pattern,
        (0, w) if w <= 2 => Tier::Learning,
        _ => Tier::Observation,
    }
}

impl Tier {
    /// The tier a validation assigned, or the one its counts imply.
    pub fn from_validation(result: &ValidationResult) -> Tier {
        result.tier.unwrap_or_else(|| assess_tier(result))
    }
}

fn epic_reference(step: Step, artifact: &Path) -> Option<&str> {
    if step != Step::Plan {
        return None;
    }
    artifact.to_str().and_then(|s| s.strip_prefix("epic:"))
}

fn check_epic_reference(epic_id: &str, result: &mut ValidationResult) {
    if epic_id.is_empty() {
        result.fail("Empty epic ID");
        return;
    }
    if !epic_id.contains('-') {
        result.warn("Epic ID should have prefix (e.g., ol-0001)");
    }
}

fn check_research(_path: &Path, text: &str, result: &mut ValidationResult) {
    if !has_frontmatter_field(text, "schema_version") {
        result.warn(FRONTMATTER_SCHEMA_WARNING);
    }
    for section in ["## Summary", "## Key Findings", "## Recommendations"] {
        if !text.contains(section) {
            result.warn(format!("Missing recommended section: {}", section));
        }
    }
    let words = text.split_whitespace().count();
    if words < 100 {
        result.warn(format!(
            "Research seems short ({} words), consider adding more detail",
            words
        ));
    }
    if !["Source", "Reference", "http"].iter().any(|m| text.contains(m)) {
        result.warn("No sources or references found");
    }
}

fn check_pre_mortem(path: &Path, text: &str, result: &mut ValidationResult) {
    if !has_frontmatter_field(text, "schema_version") {
        result.warn(FRONTMATTER_SCHEMA_WARNING);
    }
    if !text.contains("Finding") && !text.contains("| ID |") {
        result.warn("Missing findings table - pre-mortem should identify failure modes");
    }
    if !text.contains("Mitigation") && !text.contains("Fix") {
        result.warn("Missing mitigations - each finding should have a fix");
    }
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if !VERSION_SUFFIX.is_match(&base) {
        result.warn("Filename should include version suffix (e.g., -v2.md)");
    }
}

fn check_plan(path: &Path, text: &str, result: &mut ValidationResult) {
    if path.extension().is_some_and(|e| e == "toml") {
        check_formula_toml(text, result);
        return;
    }
    if !has_frontmatter_field(text, "schema_version") {
        result.warn(FRONTMATTER_SCHEMA_WARNING);
    }
    if !text.contains("## Objective") && !text.contains("## Goal") {
        result.warn("Missing objective/goal section");
    }
    if !text.contains("## Tasks") && !text.contains("## Issues") {
        result.warn("Missing tasks/issues breakdown");
    }
    if !text.contains("## Success Criteria") && !text.contains("## Acceptance") {
        result.warn("Missing success criteria");
    }
}

/// Field presence is tested against the start of the whole text, so only a
/// field on the first line can ever satisfy it.
fn check_formula_toml(text: &str, result: &mut ValidationResult) {
    for field in FORMULA_FIELDS {
        if !starts_with_assignment(text, field) {
            result.warn(format!("Missing required TOML field: {}", field));
        }
    }
    if !text.contains("schema_version") {
        result.warn(
            "Missing schema_version field in TOML - new artifacts should include schema_version = 1",
        );
    }
    if !text.contains("[[steps]]") {
        result.warn("Missing [[steps]] array - formula should define work items");
    }
}

fn starts_with_assignment(text: &str, field: &str) -> bool {
    text.strip_prefix(field)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

fn check_post_mortem(_path: &Path, text: &str, result: &mut ValidationResult) {
    if !has_frontmatter_field(text, "schema_version") {
        result.warn(FRONTMATTER_SCHEMA_WARNING);
    }
    if !text.contains("## Learnings") && !text.contains("## Key Learnings") {
        result.warn("Missing learnings section - retros should capture what was learned");
    }
    if !text.contains("## Patterns") && !text.contains("## Reusable Patterns") {
        result.warn("Consider adding patterns section for reusable workflows");
    }
    if !text.contains("## Next") && !text.contains("## Follow-up") {
        result.warn("Missing next steps/follow-up section");
    }
}

fn has_schema_version(path: &Path) -> bool {
    fs::read(path)
        .map(|bytes| {
            let text = String::from_utf8_lossy(&bytes);
            SCHEMA_VERSION_SPELLINGS.iter().any(|s| text.contains(s))
        })
        .unwrap_or(false)
}

/// True when `field:` appears inside the leading `---` block.
fn has_frontmatter_field(text: &str, field: &str) -> bool {
    let mut in_frontmatter = false;
    for line in text.lines() {
        if line == "---" {
            if in_frontmatter {
                break;
            }
            in_frontmatter = true;
            continue;
        }
        if in_frontmatter
            && line
                .strip_prefix(field)
                .is_some_and(|rest| rest.trim_start().starts_with(':'))
        {
            return true;
        }
    }
    false
}

fn has_skill_format(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|text| SKILL_SECTIONS.iter().all(|s| text.contains(s)))
        .unwrap_or(false)
}

fn file_contains(path: &Path, needle: &str) -> bool {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).contains(needle))
        .unwrap_or(false)
}

/// Every regular file under `root`, depth first, without following symlinks.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    fn recurse(dir: &Path, out: &mut Vec<PathBuf>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to walk directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                recurse(&entry.path(), out);
            } else if file_type.is_file() {
                out.push(entry.path());
            }
        }
    }

    let mut out = Vec::new();
    if root.is_dir() {
        recurse(root, &mut out);
    }
    out
}

/// Close-reason references must be absolute and must not rely on `~`.
pub fn validate_artifact_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Ok(());
    }
    if path.starts_with('~') {
        return Err(format!("path must not use tilde (~), got: {}", path));
    }
    if !Path::new(path).is_absolute() {
        return Err(format!("path must be absolute, got: {}", path));
    }
    Ok(())
}

/// Paths referenced as `Artifact: /path` or `See /path`.
pub fn extract_artifact_paths(close_reason: &str) -> Vec<String> {
    ARTIFACT_REF
        .captures_iter(close_reason)
        .chain(SEE_REF.captures_iter(close_reason))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

pub fn validate_close_reason(close_reason: &str) -> Vec<String> {
    let mut issues: Vec<String> = extract_artifact_paths(close_reason)
        .iter()
        .filter_map(|p| validate_artifact_path(p).err())
        .collect();

    if ["./", "../", "~/"].iter().any(|f| close_reason.contains(f)) {
        issues.push(format!(
            "close_reason may contain relative path: {}",
            close_reason
        ));
    }
    issues
}
