//! Scoped exclusive access to a file shared between processes.
//!
//! A [`FileLease`] owns an open file plus an OS advisory exclusive lock on
//! it. The lock is released when the lease is dropped, so every exit path out
//! of a write (including `?` propagation) gives the file back.

use crate::core::error::RatchetError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub struct FileLease {
    file: File,
}

impl FileLease {
    /// Opens `path` with `options`, creating parent directories, and blocks
    /// until the exclusive lock is held.
    pub fn acquire(path: &Path, options: &OpenOptions) -> Result<Self, RatchetError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(RatchetError::io("create chain directory"))?;
        }
        let file = options
            .open(path)
            .map_err(RatchetError::io("open chain file"))?;
        file.lock_exclusive()
            .map_err(RatchetError::io("lock chain file"))?;
        Ok(Self { file })
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Discards the current contents. Only safe while the lease is held.
    pub fn truncate(&self) -> Result<(), RatchetError> {
        self.file
            .set_len(0)
            .map_err(RatchetError::io("truncate chain file"))
    }

    pub fn write_line(&mut self, line: &[u8]) -> Result<(), RatchetError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        self.file
            .write_all(&buf)
            .map_err(RatchetError::io("write chain line"))
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
