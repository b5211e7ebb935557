#![allow(dead_code)]

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use docseek::{
    CacheStore, Embedder, Error, Extractor, FlatIndex, ModelLoader, OcrEngine,
    Result,
    coordinator::{self, CoordinatorConfig, CoordinatorHandle, Services, Signal},
    extract::ExtractError,
    operation::OperationId,
};
use tokio::sync::mpsc;

pub const DIMENSION: usize = 32;

/// Reads files as plain text. Content starting with `LOCKED:` needs the
/// password `open`.
#[derive(Debug, Default)]
pub struct FakeExtractor {
    pub delay: Duration,
}

impl Extractor for FakeExtractor {
    fn extract(
        &self,
        path: &Path,
        password: Option<&str>,
        _ocr: Option<&dyn OcrEngine>,
    ) -> std::result::Result<String, ExtractError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ExtractError::IoFailure(e.to_string()))?;
        match text.strip_prefix("LOCKED:") {
            Some(rest) if password == Some("open") => Ok(rest.to_string()),
            Some(_) if password.is_some() => Err(ExtractError::Encrypted),
            Some(_) => Err(ExtractError::NeedsPassword),
            None => Ok(text),
        }
    }
}

/// Bag-of-words vectors: each lowercased word lands in one of
/// [`DIMENSION`] buckets, so texts sharing words are similar.
pub struct HashEmbedder {
    model_id: String,
}

impl HashEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }
}

fn bucket(word: &str) -> usize {
    word.bytes()
        .fold(2166136261u32, |h, b| (h ^ u32::from(b)).wrapping_mul(16777619))
        as usize
        % (DIMENSION - 1)
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0; DIMENSION];
                v[DIMENSION - 1] = 0.1;
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    v[bucket(&word.to_lowercase())] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Loads [`HashEmbedder`]s, failing for the listed model ids.
#[derive(Debug, Default)]
pub struct FakeLoader {
    pub broken: HashSet<String>,
    pub delay: Duration,
}

impl FakeLoader {
    pub fn with_broken(ids: &[&str]) -> Self {
        Self {
            broken: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, model_id: &str) -> Result<Arc<dyn Embedder>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.broken.contains(model_id) {
            return Err(Error::Model(format!("{model_id} has no weights")));
        }
        Ok(Arc::new(HashEmbedder::new(model_id)))
    }
}

pub struct Fixture {
    pub tmp: tempfile::TempDir,
    pub docs: PathBuf,
    pub cache_root: PathBuf,
}

impl Fixture {
    pub fn new(files: &[(&str, &str)]) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        for (name, content) in files {
            std::fs::write(docs.join(name), content).unwrap();
        }
        let cache_root = tmp.path().join("cache");
        Self {
            tmp,
            docs,
            cache_root,
        }
    }

    pub fn cache(&self) -> CacheStore {
        CacheStore::new(self.cache_root.clone())
    }

    pub fn spawn(
        &self,
        loader: FakeLoader,
        extractor: FakeExtractor,
    ) -> (CoordinatorHandle, mpsc::UnboundedReceiver<Signal>) {
        self.spawn_with_timeout(loader, extractor, Duration::from_secs(5))
    }

    pub fn spawn_with_timeout(
        &self,
        loader: FakeLoader,
        extractor: FakeExtractor,
        shutdown_timeout: Duration,
    ) -> (CoordinatorHandle, mpsc::UnboundedReceiver<Signal>) {
        let services = Services {
            loader: Arc::new(loader),
            extractor: Arc::new(extractor),
            ocr: None,
            vectors: FlatIndex::boxed,
            cache: self.cache(),
            download: None,
        };
        let config = CoordinatorConfig {
            shutdown_timeout,
            ..CoordinatorConfig::default()
        };
        coordinator::spawn(services, config)
    }
}

/// Wait for the terminal signal of `op`, failing the test after 10s.
pub async fn finish(
    signals: &mut mpsc::UnboundedReceiver<Signal>,
    op: OperationId,
) -> Signal {
    tokio::time::timeout(
        Duration::from_secs(10),
        coordinator::wait_for(signals, op, |_, _, _| {}),
    )
    .await
    .expect("operation did not finish in time")
    .expect("coordinator stopped")
}
