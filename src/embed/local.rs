use model2vec_rs::model::StaticModel;
use std::sync::Mutex;

use super::{l2_normalize, Embedder, ModelSpec};
use crate::error::{EmberError, Result};

/// In-process embedder holding a model2vec static model. The model loads
/// lazily on `warm()` (or the first `embed`); concurrent callers are
/// serialized by the mutex, which also owns the loaded weights.
pub struct LocalEmbedder {
    spec: &'static ModelSpec,
    model: Mutex<Option<StaticModel>>,
}

impl LocalEmbedder {
    pub fn new(spec: &'static ModelSpec) -> Self {
        Self {
            spec,
            model: Mutex::new(None),
        }
    }

    fn with_model<T>(&self, f: impl FnOnce(&StaticModel) -> Result<T>) -> Result<T> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| EmberError::EmbedderFailure("embedder mutex poisoned".into()))?;

        if guard.is_none() {
            tracing::info!("loading embedding model {}", self.spec.repo_id);
            let model = StaticModel::from_pretrained(self.spec.repo_id, None, None, None)
                .map_err(|e| {
                    EmberError::EmbedderFailure(format!(
                        "failed to load model {}: {e}",
                        self.spec.repo_id
                    ))
                })?;
            *guard = Some(model);
        }

        f(guard.as_ref().unwrap())
    }
}

impl Embedder for LocalEmbedder {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn dim(&self) -> usize {
        self.spec.dim
    }

    fn fingerprint(&self) -> String {
        self.spec.fingerprint()
    }

    fn warm(&self) -> Result<()> {
        self.with_model(|_| Ok(()))
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(EmberError::EmbedderFailure(
                "embed called with no texts".into(),
            ));
        }

        self.with_model(|model| {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                let mut v = model.encode_single(text);
                if v.len() != self.spec.dim {
                    return Err(EmberError::EmbedderFailure(format!(
                        "model {} produced dimension {}, registry says {}",
                        self.spec.name,
                        v.len(),
                        self.spec.dim
                    )));
                }
                l2_normalize(&mut v);
                out.push(v);
            }
            Ok(out)
        })
    }
}
