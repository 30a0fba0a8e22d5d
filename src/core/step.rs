//! Workflow steps, step status and knowledge quality tiers.
//!
//! The workflow is `research → pre-mortem → plan → implement/crank → vibe →
//! post-mortem`. Free-text step names from callers and legacy files are
//! normalized through [`Step::parse`]; anything unrecognized becomes
//! [`Step::Invalid`] rather than a silent default.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Research,
    PreMortem,
    Plan,
    Implement,
    Crank,
    Vibe,
    PostMortem,
    /// Sentinel for input that names no known step.
    Invalid,
}

const STEP_ALIASES: &[(&str, Step)] = &[
    ("research", Step::Research),
    ("pre-mortem", Step::PreMortem),
    ("plan", Step::Plan),
    ("implement", Step::Implement),
    ("crank", Step::Crank),
    ("vibe", Step::Vibe),
    ("post-mortem", Step::PostMortem),
    ("premortem", Step::PreMortem),
    ("postmortem", Step::PostMortem),
    ("pre_mortem", Step::PreMortem),
    ("post_mortem", Step::PostMortem),
    // formulate was renamed to plan
    ("formulate", Step::Plan),
    ("autopilot", Step::Crank),
    ("validate", Step::Vibe),
    ("review", Step::PostMortem),
    ("execute", Step::Crank),
    // phased-mode phase names
    ("discovery", Step::Research),
    ("validation", Step::Vibe),
];

impl Step {
    /// All valid steps in workflow order.
    pub fn all() -> [Step; 7] {
        [
            Step::Research,
            Step::PreMortem,
            Step::Plan,
            Step::Implement,
            Step::Crank,
            Step::Vibe,
            Step::PostMortem,
        ]
    }

    pub fn parse(name: &str) -> Step {
        let normalized = name.trim().to_lowercase();
        STEP_ALIASES
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, step)| *step)
            .unwrap_or(Step::Invalid)
    }

    pub fn is_valid(self) -> bool {
        self != Step::Invalid
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Research => "research",
            Step::PreMortem => "pre-mortem",
            Step::Plan => "plan",
            Step::Implement => "implement",
            Step::Crank => "crank",
            Step::Vibe => "vibe",
            Step::PostMortem => "post-mortem",
            Step::Invalid => "invalid",
        }
    }

    /// Skill an agent should run to complete this step.
    pub fn skill_hint(self) -> &'static str {
        match self {
            Step::Research => "/research",
            Step::PreMortem => "/pre-mortem",
            Step::Plan => "/plan",
            Step::Implement | Step::Crank => "/implement or /crank",
            Step::Vibe => "/vibe",
            Step::PostMortem => "/post-mortem",
            Step::Invalid => "",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Step::parse(&raw))
    }
}

/// Derived status of a step within a chain.
///
/// Precedence when reading the latest entry: skipped > locked > in_progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Locked,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Locked => "locked",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot quality classification of a single validated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    Observation = 0,
    Learning = 1,
    Pattern = 2,
    Skill = 3,
    Core = 4,
}

impl Tier {
    pub fn name(self) -> &'static str {
        match self {
            Tier::Observation => "observation",
            Tier::Learning => "learning",
            Tier::Pattern => "pattern",
            Tier::Skill => "skill",
            Tier::Core => "core",
        }
    }

    /// Canonical storage location for artifacts at this tier.
    pub fn location(self) -> &'static str {
        match self {
            Tier::Observation => ".agents/candidates/",
            Tier::Learning => ".agents/learnings/",
            Tier::Pattern => ".agents/patterns/",
            Tier::Skill => "plugins/*/skills/",
            Tier::Core => "CLAUDE.md",
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tier::Observation),
            1 => Ok(Tier::Learning),
            2 => Ok(Tier::Pattern),
            3 => Ok(Tier::Skill),
            4 => Ok(Tier::Core),
            other => Err(format!("tier out of range: {}", other)),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        tier as u8
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Converts a quality tier into a reward signal usable to seed maturity
/// utility. Higher tiers surface more often.
pub fn tier_to_reward(tier: Tier) -> f64 {
    match tier {
        Tier::Core => 1.0,
        Tier::Skill => 0.9,
        Tier::Pattern => 0.75,
        Tier::Learning => 0.5,
        Tier::Observation => 0.25,
    }
}

/// Maps a reward back to the nearest tier.
pub fn reward_to_tier(reward: f64) -> Tier {
    if reward >= 0.95 {
        Tier::Core
    } else if reward >= 0.8 {
        Tier::Skill
    } else if reward >= 0.6 {
        Tier::Pattern
    } else if reward >= 0.35 {
        Tier::Learning
    } else {
        Tier::Observation
    }
}
