pub mod local;
pub mod remote;

pub use local::LocalEmbedder;
pub use remote::RemoteEmbedder;

use crate::config::Config;
use crate::error::{EmberError, Result};
use crate::workspace::Workspace;

/// The embedding port. Implementations must return one L2-normalized vector
/// of `dim()` per input text, in input order; any underlying fault surfaces
/// as `EmbedderFailure`.
///
/// `warm()` is the explicit load point: the in-process implementation loads
/// model weights there, the server-backed one spawns/contacts the co-process.
/// Indexing surfaces a distinct "loading model" phase around the first call.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;
    fn dim(&self) -> usize;
    fn fingerprint(&self) -> String;
    fn warm(&self) -> Result<()>;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A known model and its resource class. The footprint is approximate and
/// only used for auto-picking; the dimension is contractual.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub name: &'static str,
    /// HuggingFace repo ID consumed by model2vec.
    pub repo_id: &'static str,
    pub version: &'static str,
    pub dim: usize,
    pub approx_mem_bytes: u64,
}

pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "potion-base-8M",
        repo_id: "minishlab/potion-base-8M",
        version: "1",
        dim: 256,
        approx_mem_bytes: 32 * 1024 * 1024,
    },
    ModelSpec {
        name: "potion-base-32M",
        repo_id: "minishlab/potion-base-32M",
        version: "1",
        dim: 512,
        approx_mem_bytes: 128 * 1024 * 1024,
    },
    ModelSpec {
        name: "potion-retrieval-32M",
        repo_id: "minishlab/potion-retrieval-32M",
        version: "1",
        dim: 512,
        approx_mem_bytes: 128 * 1024 * 1024,
    },
];

impl ModelSpec {
    pub fn lookup(name: &str) -> Result<&'static ModelSpec> {
        MODELS
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| EmberError::InvalidConfig {
                key: "embedder.model",
                reason: format!(
                    "unknown model {name:?}; known models: {}",
                    MODELS
                        .iter()
                        .map(|m| m.name)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
    }

    /// Largest known model that fits the given memory budget.
    pub fn auto_pick(max_mem_bytes: u64) -> &'static ModelSpec {
        MODELS
            .iter()
            .filter(|m| m.approx_mem_bytes <= max_mem_bytes)
            .max_by_key(|m| m.approx_mem_bytes)
            .unwrap_or(&MODELS[0])
    }

    /// Deterministic identity of the vectors this model produces. Persisted
    /// next to the index so runs never silently mix vector spaces.
    pub fn fingerprint(&self) -> String {
        format!("{}@{}#d{}", self.name, self.version, self.dim)
    }
}

/// Scale a vector onto the unit sphere in place. Zero vectors stay zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// The single construction site for the port: configuration decides between
/// the in-process model and the server-backed client.
pub fn select_embedder(cfg: &Config, ws: &Workspace) -> Result<Box<dyn Embedder>> {
    let spec = ModelSpec::lookup(&cfg.embedder.model)?;
    if cfg.embedder.server {
        Ok(Box::new(RemoteEmbedder::new(
            spec,
            ws,
            cfg.embedder.server_idle_secs,
        )))
    } else {
        Ok(Box::new(LocalEmbedder::new(spec)))
    }
}
