//! Persisted index generations, one directory per (folder, model) pair.
//!
//! Each directory holds `manifest.json`, which describes which files were
//! indexed at which size and modification time, and `chunks.redb` with the
//! chunk text and embeddings of the same generation. The manifest is
//! written last, through a temporary file and a rename, and both artifacts
//! carry the generation number so a torn write is detected on load.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    chunk_db::{ChunkDb, StoredChunkRef},
    error::{Error, Result},
    extract::ExtractError,
    store::{IndexStore, StoredChunk},
};

/// Bumped whenever the manifest or chunk layout changes.
pub const SCHEMA_VERSION: u32 = 3;

const MANIFEST_FILE: &str = "manifest.json";
const CHUNKS_FILE: &str = "chunks.redb";
const HASH_CHARS: usize = 12;

/// Identity of a cache entry: which model indexed which folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model_hash: String,
    pub folder_hash: String,
}

impl CacheKey {
    /// Derive the key for `model_id` indexing `folder`.
    ///
    /// The folder is canonicalized when possible so different spellings of
    /// the same directory share a cache entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::Path;
    /// use docseek::cache::CacheKey;
    ///
    /// let a = CacheKey::compute("model-a", Path::new("/nonexistent/docs"));
    /// let b = CacheKey::compute("model-b", Path::new("/nonexistent/docs"));
    /// assert_eq!(a.folder_hash, b.folder_hash);
    /// assert_ne!(a.model_hash, b.model_hash);
    /// ```
    pub fn compute(model_id: &str, folder: &Path) -> Self {
        let folder = folder
            .canonicalize()
            .unwrap_or_else(|_| folder.to_path_buf());
        Self {
            model_hash: short_hash(model_id.as_bytes()),
            folder_hash: short_hash(folder.to_string_lossy().as_bytes()),
        }
    }

    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.folder_hash, self.model_hash)
    }
}

fn short_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex()[..HASH_CHARS].to_string()
}

/// Why a file contributed no chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Extract(ExtractError),
    EmptyText,
    Embedding(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Extract(e) => write!(f, "{e}"),
            FailureReason::EmptyText => f.write_str("no text extracted"),
            FailureReason::Embedding(e) => write!(f, "embedding failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Indexed,
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mtime: u64,
    pub status: FileStatus,
    pub chunk_ids: Vec<String>,
}

impl FileRecord {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, FileStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub schema_version: u32,
    pub model_hash: String,
    pub folder_hash: String,
    pub model_id: String,
    pub folder: PathBuf,
    pub generation: u64,
    /// Seconds since the Unix epoch.
    pub built_at: u64,
    pub files: BTreeMap<String, FileRecord>,
}

impl CacheManifest {
    /// An empty manifest for a first build.
    pub fn new(key: &CacheKey, model_id: &str, folder: &Path) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            model_hash: key.model_hash.clone(),
            folder_hash: key.folder_hash.clone(),
            model_id: model_id.to_string(),
            folder: folder.to_path_buf(),
            generation: 0,
            built_at: 0,
            files: BTreeMap::new(),
        }
    }

    /// Check the schema version and that the manifest belongs to `key`.
    pub fn validate(&self, key: &CacheKey) -> std::result::Result<(), LoadError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(LoadError::NotFound);
        }
        if self.model_hash != key.model_hash || self.folder_hash != key.folder_hash
        {
            return Err(LoadError::Corrupt(format!(
                "manifest belongs to {}_{}",
                self.folder_hash, self.model_hash
            )));
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.files.values().map(|r| r.chunk_ids.len()).sum()
    }

    pub fn indexed_files(&self) -> usize {
        self.files.values().filter(|r| !r.is_failed()).count()
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values().filter(|r| r.is_failed())
    }

    pub fn touch(&mut self) {
        self.built_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no usable cache entry")]
    NotFound,
    #[error("cache entry is corrupt: {0}")]
    Corrupt(String),
    #[error("cache entry unreadable: {0}")]
    Io(#[from] std::io::Error),
}

/// A cache entry loaded back into memory.
#[derive(Debug)]
pub struct CachedIndex {
    pub manifest: CacheManifest,
    pub chunks: Vec<StoredChunk>,
}

/// Disk usage of the cache root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    pub fn manifest_path(&self, key: &CacheKey) -> PathBuf {
        self.dir(key).join(MANIFEST_FILE)
    }

    /// Read only the manifest, without validating the chunk payload.
    pub fn peek_manifest(
        &self,
        key: &CacheKey,
    ) -> std::result::Result<CacheManifest, LoadError> {
        let path = self.manifest_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound);
            }
            Err(e) => return Err(LoadError::Io(e)),
        };

        // Look at the version first so an older layout is never parsed.
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| LoadError::Corrupt(e.to_string()))?;
        let version = value.get("schema_version").and_then(|v| v.as_u64());
        if version != Some(u64::from(SCHEMA_VERSION)) {
            return Err(LoadError::NotFound);
        }
        let manifest: CacheManifest = serde_json::from_value(value)
            .map_err(|e| LoadError::Corrupt(e.to_string()))?;
        manifest.validate(key)?;
        Ok(manifest)
    }

    /// Load a complete cache entry.
    ///
    /// Entries with an old schema or any inconsistency are deleted before
    /// the error is returned, so the caller can rebuild from scratch.
    pub fn load(
        &self,
        key: &CacheKey,
    ) -> std::result::Result<CachedIndex, LoadError> {
        let result = self.peek_manifest(key).and_then(|manifest| {
            let chunks = self.load_chunks(key, &manifest)?;
            Ok(CachedIndex { manifest, chunks })
        });

        match result {
            Err(LoadError::NotFound) if self.dir(key).exists() => {
                tracing::info!(
                    dir = %self.dir(key).display(),
                    "discarding cache entry with outdated schema"
                );
                self.discard(key);
                Err(LoadError::NotFound)
            }
            Err(LoadError::Corrupt(reason)) => {
                tracing::warn!(
                    dir = %self.dir(key).display(),
                    %reason,
                    "discarding corrupt cache entry"
                );
                self.discard(key);
                Err(LoadError::Corrupt(reason))
            }
            other => other,
        }
    }

    fn load_chunks(
        &self,
        key: &CacheKey,
        manifest: &CacheManifest,
    ) -> std::result::Result<Vec<StoredChunk>, LoadError> {
        let path = self.dir(key).join(CHUNKS_FILE);
        if !path.exists() {
            return Err(LoadError::Corrupt("chunk payload missing".into()));
        }
        let corrupt = |e: Error| match e {
            Error::Io(io) => LoadError::Io(io),
            other => LoadError::Corrupt(other.to_string()),
        };

        let db = ChunkDb::open(&path).map_err(corrupt)?;
        let generation = db.generation().map_err(corrupt)?;
        if generation != Some(manifest.generation) {
            return Err(LoadError::Corrupt(format!(
                "manifest generation {} but payload generation {generation:?}",
                manifest.generation
            )));
        }
        let chunks = db.read_all().map_err(corrupt)?;
        check_ownership(manifest, &chunks).map_err(LoadError::Corrupt)?;
        Ok(chunks)
    }

    /// Persist `store` and its `manifest` as the entry for `key`.
    pub fn save(
        &self,
        key: &CacheKey,
        manifest: &CacheManifest,
        store: &IndexStore,
    ) -> Result<()> {
        if manifest.generation != store.generation() {
            return Err(Error::Consistency(format!(
                "manifest generation {} does not describe store generation {}",
                manifest.generation,
                store.generation()
            )));
        }
        if manifest.chunk_count() != store.len() {
            return Err(Error::Consistency(format!(
                "manifest owns {} chunks, store holds {}",
                manifest.chunk_count(),
                store.len()
            )));
        }

        let dir = self.dir(key);
        std::fs::create_dir_all(&dir)?;

        {
            let db = ChunkDb::open(&dir.join(CHUNKS_FILE))?;
            let entries = store
                .ids()
                .iter()
                .zip(store.meta())
                .zip(store.chunks())
                .map(|((id, meta), chunk)| StoredChunkRef { id, meta, chunk });
            db.write_generation(manifest.generation, entries)?;
        }

        let bytes = serde_json::to_vec_pretty(manifest)?;
        let path = dir.join(MANIFEST_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(
            dir = %dir.display(),
            generation = manifest.generation,
            "cache entry saved"
        );
        Ok(())
    }

    /// Remove the entry for `key`, if any.
    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        remove_dir_if_exists(&self.dir(key))
    }

    /// Remove every cache entry.
    pub fn clear_all(&self) -> Result<()> {
        remove_dir_if_exists(&self.root)
    }

    pub fn usage(&self) -> Result<CacheUsage> {
        let mut usage = CacheUsage::default();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(usage);
            }
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            usage.entries += 1;
            for file in std::fs::read_dir(entry.path())? {
                usage.bytes += file?.metadata()?.len();
            }
        }
        Ok(usage)
    }

    fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.delete(key) {
            tracing::warn!(error = %e, "could not delete cache entry");
        }
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Every chunk must be owned by exactly the record that lists it.
fn check_ownership(
    manifest: &CacheManifest,
    chunks: &[StoredChunk],
) -> std::result::Result<(), String> {
    if manifest.chunk_count() != chunks.len() {
        return Err(format!(
            "manifest owns {} chunks, payload holds {}",
            manifest.chunk_count(),
            chunks.len()
        ));
    }

    let owners: std::collections::HashMap<&str, &str> = chunks
        .iter()
        .map(|c| (c.id.as_str(), c.meta.file_key.as_str()))
        .collect();
    if owners.len() != chunks.len() {
        return Err("duplicate chunk ids in payload".into());
    }

    let mut dimension = None;
    for chunk in chunks {
        let dim = chunk.chunk.embedding.len();
        if *dimension.get_or_insert(dim) != dim {
            return Err(format!("chunk {} has dimension {dim}", chunk.id));
        }
    }

    for (key, record) in &manifest.files {
        if record.is_failed() && !record.chunk_ids.is_empty() {
            return Err(format!("failed file {key} owns chunks"));
        }
        for id in &record.chunk_ids {
            match owners.get(id.as_str()) {
                Some(owner) if owner == key => {}
                Some(owner) => {
                    return Err(format!("chunk {id} listed by {key} but owned by {owner}"));
                }
                None => return Err(format!("chunk {id} of {key} missing")),
            }
        }
    }
    Ok(())
}
