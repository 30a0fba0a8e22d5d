//! Ratchet: progress tracking and knowledge quality for agent workflows
//!
//! **A ratchet only turns one way.** Once a workflow step is locked it stays
//! locked; re-running a step appends a new record instead of rewriting the
//! old one.
//!
//! The workflow it tracks:
//!
//! ```text
//! research → pre-mortem → plan → implement/crank → vibe → post-mortem
//! ```
//!
//! # What It Answers
//!
//! - **Gating**: may step X start now? ([`GateChecker`])
//! - **Validation**: is this artifact good enough to lock the step, and at
//!   which quality [`Tier`]? ([`Validator`])
//! - **Maturity**: given the feedback so far, should a learning gain or lose
//!   trust? ([`maturity`])
//!
//! # Persisted Layout
//!
//! - `<project>/.agents/ao/chain.jsonl`: the chain (legacy
//!   `.agents/provenance/chain.yaml` is read and migrated)
//! - `<project>/.agents/ao/citations.jsonl`: citation log
//! - `<project>/.agents/ao/ratchet.toml`: optional configuration
//! - learnings: `*.jsonl` files under a caller-chosen directory
//!
//! Files are created on first write. Chain writes take an exclusive advisory
//! lock so independent processes serialize.
//!
//! # Errors
//!
//! "Not ready yet" is never an error. Gates and validations report it
//! in-band (`passed`, `valid`, `issues`); [`RatchetError`] is reserved for
//! infrastructure failures such as I/O, lock, or an issue tracker that did
//! not answer in time ([`RatchetError::Timeout`]).
//!
//! # Logging
//!
//! Diagnostics are emitted through `tracing`. The crate never installs a
//! subscriber.
//!
//! # Crate Structure
//!
//! - [`core`]: every component plus shared primitives (config, lock,
//!   subprocess, glob, time)

pub mod core;

pub use crate::core::chain::{Chain, ChainEntry, MigrationReport, NextStep, TraceEntry, migrate_chain};
pub use crate::core::citation::CitationEvent;
pub use crate::core::config::RatchetConfig;
pub use crate::core::error::RatchetError;
pub use crate::core::gate::{GateChecker, GateResult};
pub use crate::core::locator::{FindMatch, FindResult, LocationType, Locator};
pub use crate::core::maturity::{
    LearningRecord, Maturity, MaturityDistribution, MaturityTransitionResult,
};
pub use crate::core::step::{Step, StepStatus, Tier, reward_to_tier, tier_to_reward};
pub use crate::core::validate::{ValidateOptions, ValidationMetrics, ValidationResult, Validator};
