use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EmberError, Result};

/// Embedding model selection. The concrete implementation behind the
/// `Embedder` port is chosen from this at the construction site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Registry name of the model (see `embed::ModelSpec`).
    pub model: String,
    /// Run the model in a long-lived co-process instead of in-process.
    /// Worth it for models whose load cost dominates a single run.
    pub server: bool,
    /// Seconds the server stays alive without requests before exiting.
    pub server_idle_secs: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model: "potion-base-8M".to_string(),
            server: false,
            server_idle_secs: 900,
        }
    }
}

/// Line-window fallback parameters for files the structural chunker cannot
/// handle. Stride must satisfy `0 < stride <= window`; the overlap between
/// consecutive windows is `window - stride`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub window_lines: usize,
    pub stride_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_lines: 120,
            stride_lines: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Hard ceiling: files larger than this are skipped.
    pub max_file_bytes: u64,
    /// Directory *names* to skip anywhere in the tree, on top of ignore
    /// rules (e.g. "generated", "fixtures").
    pub exclude_dir_names: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            // 1 MB blocks minified bundles and generated bloat.
            max_file_bytes: 1_000_000,
            exclude_dir_names: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_topk: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { default_topk: 10 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedder: EmbedderConfig,
    pub chunking: ChunkingConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
}

impl Config {
    /// Range-check every numeric knob. Out-of-range values are user errors,
    /// not panics deep in the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.window_lines == 0 {
            return Err(EmberError::InvalidConfig {
                key: "chunking.window_lines",
                reason: "must be positive".into(),
            });
        }
        if self.chunking.stride_lines == 0 || self.chunking.stride_lines > self.chunking.window_lines
        {
            return Err(EmberError::InvalidConfig {
                key: "chunking.stride_lines",
                reason: format!(
                    "must satisfy 0 < stride <= window ({})",
                    self.chunking.window_lines
                ),
            });
        }
        if self.index.max_file_bytes == 0 {
            return Err(EmberError::InvalidConfig {
                key: "index.max_file_bytes",
                reason: "must be positive".into(),
            });
        }
        if self.search.default_topk == 0 {
            return Err(EmberError::InvalidConfig {
                key: "search.default_topk",
                reason: "must be positive".into(),
            });
        }
        if self.embedder.server_idle_secs == 0 {
            return Err(EmberError::InvalidConfig {
                key: "embedder.server_idle_secs",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Load `.ember/config` (TOML). A missing file yields defaults; a file that
/// exists but does not parse or validate is an error, never a silent default.
pub fn load_config(config_path: &Path) -> Result<Config> {
    let text = match std::fs::read_to_string(config_path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(EmberError::InvalidConfig {
                key: "config",
                reason: format!("unreadable: {e}"),
            })
        }
    };

    let cfg: Config = toml::from_str(&text).map_err(|e| EmberError::InvalidConfig {
        key: "config",
        reason: e.to_string(),
    })?;
    cfg.validate()?;
    Ok(cfg)
}
