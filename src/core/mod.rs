//! Core components of the ratchet and the primitives they share.
//!
//! Components: [`locator`], [`chain`], [`gate`], [`validate`] (with
//! [`citation`]) and [`maturity`]. Everything else here is plumbing.

pub mod chain;
pub mod citation;
pub mod config;
pub mod error;
pub mod gate;
pub mod glob;
pub mod locator;
pub mod lock;
pub mod maturity;
pub mod step;
pub mod subprocess;
pub mod time;
pub mod validate;
