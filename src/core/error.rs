use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RatchetError {
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("{command} was cancelled before completion")]
    Cancelled { command: String },
    #[error("{command} failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("chain has no path set")]
    ChainNoPath,
    #[error(".agents directory not found")]
    AgentsDirNotFound,
    #[error("no legacy chain found at {}", .0.display())]
    NoLegacyChain(PathBuf),
    #[error("home directory unavailable")]
    HomeDirUnavailable,
    #[error("Config error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RatchetError {
    /// Wraps an I/O failure with the name of the operation that hit it.
    pub fn io(op: &'static str) -> impl FnOnce(io::Error) -> RatchetError {
        move |source| RatchetError::Io { op, source }
    }

    pub fn malformed(what: &'static str, detail: impl ToString) -> RatchetError {
        RatchetError::Malformed {
            what,
            detail: detail.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RatchetError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RatchetError::NotFound(_))
    }
}
