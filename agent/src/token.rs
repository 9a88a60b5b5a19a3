//! Access token shared with the manager

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Token persisted as a single line in `path`, cached in memory.
pub struct TokenStore {
    path: PathBuf,
    current: RwLock<Option<String>>,
}

impl TokenStore {
    /// Open the store, reading any token already on disk.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(content) => Some(content.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                warn!("No access token at {}: {e}", path.display());
                None
            }
        };
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_set(&self) -> bool {
        self.current.read().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Persist `token` and make it the one requests are checked against.
    pub fn store(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, format!("{token}\n"))
            .with_context(|| format!("Failed to write token to {}", self.path.display()))?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(token.to_string());
        info!("Access token updated");
        Ok(())
    }

    /// Whether `provided` matches the stored token. Always false while no
    /// token is set.
    pub fn verify(&self, provided: &str) -> bool {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        match current.as_deref() {
            Some(expected) => constant_time_eq(expected.as_bytes(), provided.as_bytes()),
            None => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
