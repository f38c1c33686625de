//! Scoped storage for uploaded files.
//!
//! Every upload gets a unique name inside the upload directory and is deleted as soon as the
//! returned handle is dropped. The client-supplied file name only contributes its extension.
use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

#[derive(Debug)]
pub struct UploadDir {
    path: PathBuf,
}

impl UploadDir {
    /// Use `path` for uploads, creating it if necessary.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create upload directory {}", path.display()))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` to a new uniquely named file.
    pub fn persist(&self, file_name: &str, data: &[u8]) -> std::io::Result<NamedTempFile> {
        let suffix = safe_extension(file_name)
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();

        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&suffix)
            .tempfile_in(&self.path)?;
        file.write_all(data)?;
        file.flush()?;

        log::debug!("Stored upload {} as {}", file_name, file.path().display());

        Ok(file)
    }
}

/// Extension of a client file name, if it is plain ASCII alphanumeric.
fn safe_extension(file_name: &str) -> Option<&str> {
    Path::new(file_name)
        .extension()?
        .to_str()
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
}
