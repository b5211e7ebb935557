use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use candle_core::Device;
use pylate_rs::ColBERT;

use crate::{
    embedding::{Embedder, ModelLoader, pool_token_embeddings},
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Loads ColBERT models, preferring snapshots previously downloaded into
/// the models directory over fetching from the HuggingFace Hub.
#[derive(Debug, Clone, Default)]
pub struct ModelManager {
    models_dir: Option<PathBuf>,
}

impl ModelManager {
    pub fn new(models_dir: Option<PathBuf>) -> Self {
        Self { models_dir }
    }

    /// Where `model_id` should be loaded from: a local directory when one
    /// exists, otherwise the id itself.
    pub fn resolve_source(&self, model_id: &str) -> String {
        if Path::new(model_id).is_dir() {
            return model_id.to_string();
        }
        self.models_dir
            .as_deref()
            .and_then(|dir| local_snapshot(dir, model_id))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_id.to_string())
    }
}

/// Newest snapshot directory in the hub cache layout
/// (`models--{org}--{name}/snapshots/{revision}`).
pub fn local_snapshot(models_dir: &Path, model_id: &str) -> Option<PathBuf> {
    let repo_dir =
        models_dir.join(format!("models--{}", model_id.replace('/', "--")));
    let mut snapshots: Vec<(std::time::SystemTime, PathBuf)> =
        std::fs::read_dir(repo_dir.join("snapshots"))
            .ok()?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let modified = entry.metadata().ok()?.modified().ok()?;
                entry.path().is_dir().then(|| (modified, entry.path()))
            })
            .collect();
    snapshots.sort();
    snapshots.pop().map(|(_, path)| path)
}

impl ModelLoader for ModelManager {
    fn load(&self, model_id: &str) -> Result<Arc<dyn Embedder>> {
        let source = self.resolve_source(model_id);
        tracing::info!(model = model_id, %source, "loading model");

        let colbert: ColBERT = ColBERT::from(&source)
            .with_device(default_device())
            .try_into()?;

        Ok(Arc::new(ColbertEmbedder {
            model_id: model_id.to_string(),
            model: Mutex::new(colbert),
        }))
    }
}

/// A loaded ColBERT model exposed as a single-vector embedder.
pub struct ColbertEmbedder {
    model_id: String,
    model: Mutex<ColBERT>,
}

impl ColbertEmbedder {
    fn encode(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::Embedding("model lock poisoned".into()))?;
        let embeddings = model.encode(texts, is_query)?;
        pool_token_embeddings(&embeddings)
    }
}

impl Embedder for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.encode(texts, false)
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.encode(&[query.to_string()], true)?
            .pop()
            .ok_or_else(|| Error::Embedding("empty query embedding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_resolves_to_hub_id() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(Some(tmp.path().to_path_buf()));
        assert_eq!(manager.resolve_source("org/model"), "org/model");
    }

    #[test]
    fn downloaded_snapshot_is_preferred() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = tmp
            .path()
            .join("models--org--model")
            .join("snapshots")
            .join("abc123");
        std::fs::create_dir_all(&snapshot).unwrap();

        let manager = ModelManager::new(Some(tmp.path().to_path_buf()));
        assert_eq!(
            manager.resolve_source("org/model"),
            snapshot.to_string_lossy()
        );
    }

    #[test]
    fn local_directory_is_used_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = ModelManager::default();
        let path = tmp.path().to_string_lossy().into_owned();
        assert_eq!(manager.resolve_source(&path), path);
    }
}
