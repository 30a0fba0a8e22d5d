//! Multi-scope artifact resolution.
//!
//! Artifacts are searched across four scopes, most specific first:
//!
//! - `local`: `<start>/.agents/`
//! - `rig`: `<rig>/.agents/`, where `<rig>` is the nearest ancestor carrying
//!   a rig marker (`.beads`, `crew`, `polecats`)
//! - `town`: `<town>/.agents/` (default `~/gt`)
//! - `plugins`: `<start>/plugins/`, or `<rig>/plugins/` when absent locally
//!
//! The order comes from configuration so a caller can pin resolution to a
//! single scope. A scope that does not exist simply contributes no matches.

use crate::core::config::RatchetConfig;
use crate::core::error::RatchetError;
use crate::core::glob;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    #[serde(alias = "crew")]
    Local,
    Rig,
    Town,
    Plugins,
}

impl LocationType {
    pub fn default_order() -> [LocationType; 4] {
        [
            LocationType::Local,
            LocationType::Rig,
            LocationType::Town,
            LocationType::Plugins,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LocationType::Local => "local",
            LocationType::Rig => "rig",
            LocationType::Town => "town",
            LocationType::Plugins => "plugins",
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single artifact found during a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindMatch {
    pub path: PathBuf,
    pub location: LocationType,
    /// Index of the scope in the search order; lower wins.
    pub priority: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindResult {
    pub pattern: String,
    pub matches: Vec<FindMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Locator {
    start_dir: PathBuf,
    town_dir: PathBuf,
    search_order: Vec<LocationType>,
    rig_markers: Vec<String>,
}

impl Locator {
    pub fn new(start_dir: &Path) -> Result<Self, RatchetError> {
        Self::from_config(start_dir, &RatchetConfig::default())
    }

    pub fn from_config(start_dir: &Path, config: &RatchetConfig) -> Result<Self, RatchetError> {
        let start_dir = std::path::absolute(start_dir).unwrap_or_else(|_| start_dir.to_path_buf());
        Ok(Self {
            start_dir,
            town_dir: config.resolve_town_dir()?,
            search_order: config.search_order.clone(),
            rig_markers: config.rig_markers.clone(),
        })
    }

    /// Replaces the search order for this locator only.
    pub fn with_search_order(mut self, order: Vec<LocationType>) -> Self {
        self.search_order = order;
        self
    }

    pub fn with_town_dir(mut self, town_dir: &Path) -> Self {
        self.town_dir = town_dir.to_path_buf();
        self
    }

    pub fn start_dir(&self) -> &Path {
        &self.start_dir
    }

    pub fn town_dir(&self) -> &Path {
        &self.town_dir
    }

    pub fn search_order(&self) -> &[LocationType] {
        &self.search_order
    }

    /// Every match across all scopes, in priority order. A basename that
    /// shows up in more than one scope adds a warning; the earlier scope
    /// shadows the later one.
    pub fn find(&self, pattern: &str) -> Result<FindResult, RatchetError> {
        let mut result = FindResult {
            pattern: pattern.to_string(),
            ..FindResult::default()
        };
        let mut seen: HashMap<String, FindMatch> = HashMap::new();

        for (priority, paths, loc) in self.scoped_matches(pattern)? {
            for path in paths {
                let base_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let found = FindMatch {
                    path: path.clone(),
                    location: loc,
                    priority,
                };

                match seen.get(&base_name) {
                    Some(existing) if existing.location != loc => {
                        result.warnings.push(format!(
                            "Duplicate '{}' found at {} (priority: {}) and {} (priority: {})",
                            base_name,
                            existing.path.display(),
                            existing.location,
                            path.display(),
                            loc
                        ));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(base_name, found.clone());
                    }
                }

                result.matches.push(found);
            }
        }

        Ok(result)
    }

    /// The single highest-priority match.
    pub fn find_first(&self, pattern: &str) -> Result<(PathBuf, LocationType), RatchetError> {
        for (_, mut paths, loc) in self.scoped_matches(pattern)? {
            if !paths.is_empty() {
                return Ok((paths.swap_remove(0), loc));
            }
        }
        Err(RatchetError::NotFound(format!("artifact not found: {}", pattern)))
    }

    pub fn artifact_exists(&self, pattern: &str) -> bool {
        self.find_first(pattern).is_ok()
    }

    /// Resolves a reference in any of the accepted forms: absolute path,
    /// glob, `.agents/`-relative path, or path relative to `.agents/`.
    pub fn resolve_artifact_path(
        &self,
        reference: &str,
    ) -> Result<(PathBuf, LocationType), RatchetError> {
        let path = Path::new(reference);
        if path.is_absolute() {
            if path.exists() {
                return Ok((path.to_path_buf(), self.location_for_path(path)));
            }
            return Err(RatchetError::NotFound(format!(
                "artifact not found: {}",
                reference
            )));
        }

        if glob::has_glob_meta(reference) {
            return self.find_first(reference);
        }

        let trimmed = reference.strip_prefix(".agents/").unwrap_or(reference);
        self.find_first(trimmed)
    }

    /// Scope an absolute path belongs to; paths outside every known root are
    /// attributed to the local scope.
    pub fn location_for_path(&self, path: &Path) -> LocationType {
        let roots = self.location_paths();
        let mut best: Option<(usize, LocationType)> = None;
        for (loc, root) in &roots {
            if path.starts_with(root) {
                let depth = root.components().count();
                if best.is_none_or(|(d, _)| depth > d) {
                    best = Some((depth, *loc));
                }
            }
        }
        best.map(|(_, loc)| loc).unwrap_or(LocationType::Local)
    }

    /// Roots that would be searched for each available scope.
    pub fn location_paths(&self) -> BTreeMap<LocationType, PathBuf> {
        LocationType::default_order()
            .into_iter()
            .filter_map(|loc| self.search_root(loc).map(|root| (loc, root)))
            .collect()
    }

    pub fn agents_dir(&self, loc: LocationType) -> Result<PathBuf, RatchetError> {
        self.search_root(loc)
            .ok_or_else(|| RatchetError::NotFound(format!("location {} not available", loc)))
    }

    /// Nearest directory at or above the start directory carrying a rig marker.
    pub fn rig_root(&self) -> Option<PathBuf> {
        self.start_dir
            .ancestors()
            .find(|dir| self.is_rig_root(dir))
            .map(Path::to_path_buf)
    }

    fn is_rig_root(&self, dir: &Path) -> bool {
        self.rig_markers
            .iter()
            .any(|marker| dir.join(marker).exists())
    }

    fn search_root(&self, loc: LocationType) -> Option<PathBuf> {
        match loc {
            LocationType::Local => Some(self.start_dir.join(".agents")),
            LocationType::Rig => self.rig_root().map(|rig| rig.join(".agents")),
            LocationType::Town => Some(self.town_dir.join(".agents")),
            LocationType::Plugins => {
                let local = self.start_dir.join("plugins");
                if local.exists() {
                    Some(local)
                } else {
                    self.rig_root().map(|rig| rig.join("plugins"))
                }
            }
        }
    }

    /// Runs the pattern against each scope in order. Scopes whose root is
    /// missing or was already searched under an earlier scope are skipped.
    /// An absolute pattern is a plain existence check attributed to the
    /// scope that contains it.
    fn scoped_matches(
        &self,
        pattern: &str,
    ) -> Result<Vec<(usize, Vec<PathBuf>, LocationType)>, RatchetError> {
        let mut searched: Vec<PathBuf> = Vec::new();
        let mut out = Vec::new();

        let absolute = Path::new(pattern);
        if absolute.is_absolute() {
            if absolute.exists() {
                let loc = self.location_for_path(absolute);
                let priority = self
                    .search_order
                    .iter()
                    .position(|l| *l == loc)
                    .unwrap_or(0);
                out.push((priority, vec![absolute.to_path_buf()], loc));
            }
            return Ok(out);
        }

        for (priority, loc) in self.search_order.iter().copied().enumerate() {
            let Some(root) = self.search_root(loc) else {
                tracing::debug!(scope = %loc, "scope unavailable");
                continue;
            };
            if !root.is_dir() {
                tracing::debug!(scope = %loc, root = %root.display(), "scope root missing");
                continue;
            }
            if searched.contains(&root) {
                continue;
            }
            searched.push(root.clone());

            out.push((priority, glob::glob(&root, pattern)?, loc));
        }

        Ok(out)
    }
}
