//! Load and persist the probe document of one plugin

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::ProbeConfigDocument;
use crate::error::AgentResult;

/// File-backed probe document. The file is the source of truth: nothing is
/// cached between calls.
#[derive(Debug, Clone)]
pub struct ProbeConfigStore {
    path: PathBuf,
}

impl ProbeConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing or malformed file yields an empty
    /// document rather than an error.
    pub fn load(&self) -> ProbeConfigDocument {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Probe config {} unavailable: {e}", self.path.display());
                return ProbeConfigDocument::default();
            }
        };
        match ProbeConfigDocument::parse(&content) {
            Ok(document) => document,
            Err(e) => {
                warn!("Probe config {} is malformed: {e}", self.path.display());
                ProbeConfigDocument::default()
            }
        }
    }

    /// Write the document back, replacing the file atomically.
    ///
    /// The new content goes to a temporary file beside the target, which is
    /// removed on every failure path.
    pub fn save(&self, document: &ProbeConfigDocument) -> AgentResult<()> {
        let content = document.render();

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut prefix = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("probes"));
        prefix.push(".");

        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let permissions = match fs::metadata(&self.path) {
            Ok(meta) => meta.permissions(),
            Err(_) => fs::Permissions::from_mode(0o644),
        };
        tmp.as_file().set_permissions(permissions)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!("Saved probe config {}", self.path.display());
        Ok(())
    }
}
