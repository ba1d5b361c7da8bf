use std::path::{Path, PathBuf};

use crate::error::{EmberError, Result};
use crate::hash::hash_bytes;

/// Name of the per-repository index directory.
pub const EMBER_DIR: &str = ".ember";

/// Everything the engine persists for one repository, resolved once at
/// startup and passed around explicitly (no global state).
///
/// The socket and pid records deliberately live under the OS temp dir, not
/// `.ember/`: `sun_path` is capped at ~104 bytes on some systems, and a
/// deeply nested repo path would overflow it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    project_id: String,
}

impl Workspace {
    /// Bind to an absolute repository root. Root discovery (walking up from
    /// a subdirectory) is the shell's job; the core takes the answer.
    pub fn at(root: &Path) -> Self {
        let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let project_id = derive_project_id(&canonical);
        Self {
            root: canonical,
            project_id,
        }
    }

    /// Like [`Workspace::at`] but requires an existing `.ember/` directory.
    pub fn open(root: &Path) -> Result<Self> {
        let ws = Self::at(root);
        if !ws.ember_dir().is_dir() {
            return Err(EmberError::NotInitialized {
                root: ws.root.clone(),
            });
        }
        Ok(ws)
    }

    /// Create `.ember/` (idempotent).
    pub fn init(root: &Path) -> Result<Self> {
        let ws = Self::at(root);
        std::fs::create_dir_all(ws.ember_dir())
            .map_err(|e| EmberError::StorageFailure(format!("create {}: {e}", EMBER_DIR)))?;
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic opaque identifier of this index, derived from the
    /// repository root path.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn ember_dir(&self) -> PathBuf {
        self.root.join(EMBER_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.ember_dir().join("index.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.ember_dir().join("config")
    }

    pub fn state_path(&self) -> PathBuf {
        self.ember_dir().join("state")
    }

    /// Short per-index runtime dir for the embedding service records.
    pub fn runtime_dir(&self) -> PathBuf {
        std::env::temp_dir().join(format!("ember-{}", self.project_id))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join("embed.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.runtime_dir().join("embed.pid")
    }

    /// Mirror select metadata into `.ember/state` for human inspection.
    /// The authoritative copy lives inside the database; this file is
    /// best-effort and never read back by the engine.
    pub fn write_state(&self, entries: &[(&str, &str)]) {
        let mut out = String::new();
        for (k, v) in entries {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        if let Err(e) = std::fs::write(self.state_path(), out) {
            tracing::debug!("could not write state mirror: {e}");
        }
    }
}

fn derive_project_id(root: &Path) -> String {
    let digest = hash_bytes(root.to_string_lossy().as_bytes());
    digest[..16].to_string()
}
