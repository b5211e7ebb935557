//! One incremental indexing pass over a folder.
//!
//! A pass never edits the generation that searches are reading. It diffs
//! the folder against the manifest, extracts and embeds only the added and
//! modified files, and assembles a fresh [`IndexStore`] from those chunks
//! followed by the chunks of unchanged files carried over with their stored
//! embeddings. The new generation and its manifest are persisted together
//! before the pass returns.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    bm25::{Bm25Params, tokenize},
    cache::{
        CacheKey, CacheManifest, CacheStore, FailureReason, FileRecord,
        FileStatus, LoadError,
    },
    chunking::{ChunkingConfig, chunk_id, chunk_text},
    config::Settings,
    embedding::{Embedder, embed_batched},
    error::{Error, ErrorClass, Result},
    extract::{Extractor, OcrEngine},
    incremental::diff,
    store::{ChunkMeta, DocumentChunk, IndexStore, StoredChunk},
    vector::VectorIndexFactory,
    walker::{DiscoveredFile, discover_files},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexSettings {
    pub chunking: ChunkingConfig,
    pub bm25: Bm25Params,
    pub embed_batch_size: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for IndexSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            chunking: ChunkingConfig {
                chunk_size: settings.chunk_size,
                overlap: settings.chunk_overlap,
            },
            bm25: Bm25Params {
                k1: settings.bm25_k1,
                b: settings.bm25_b,
            },
            embed_batch_size: settings.embed_batch_size,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexRequest {
    pub folder: PathBuf,
    pub recursive: bool,
    /// Document passwords keyed by manifest key (relative path).
    pub passwords: HashMap<String, String>,
}

/// The committed generation a pass starts from, when one is live.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub key: CacheKey,
    pub store: Arc<IndexStore>,
    pub manifest: Arc<CacheManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexProgress {
    /// Files finished so far.
    pub current: usize,
    pub total: usize,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub reason: FailureReason,
}

impl std::fmt::Display for FileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.reason)
    }
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Files extracted and embedded in this pass.
    pub indexed: usize,
    /// Indexed files carried over unchanged. Unchanged failed files are
    /// only listed in `failures`.
    pub cached: usize,
    pub removed: usize,
    pub failures: Vec<FileFailure>,
    pub chunks: usize,
    /// The pass stopped early at a file boundary.
    pub cancelled: bool,
    /// A new generation was written to the cache.
    pub persisted: bool,
    /// Nothing changed; the baseline generation, live or read from the
    /// cache, is reused as is.
    pub unchanged: bool,
    /// A corrupt cache entry was discarded before the pass.
    pub recovered_corrupt_cache: bool,
}

impl IndexReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub key: CacheKey,
    pub store: Arc<IndexStore>,
    pub manifest: Arc<CacheManifest>,
    pub report: IndexReport,
}

/// Drives extraction and embedding for one pass.
pub struct Indexer<'a> {
    pub extractor: &'a dyn Extractor,
    pub embedder: &'a dyn Embedder,
    pub ocr: Option<&'a dyn OcrEngine>,
    pub cache: &'a CacheStore,
    pub vectors: VectorIndexFactory,
    pub settings: IndexSettings,
}

/// Starting point resolved from the live generation or the disk cache.
struct Base {
    store: Arc<IndexStore>,
    manifest: Arc<CacheManifest>,
    live: bool,
}

impl Indexer<'_> {
    /// Run one pass. Cancellation is checked before each file; a cancelled
    /// pass still commits and persists the files it finished.
    pub fn run(
        &self,
        request: &IndexRequest,
        live: Option<&Baseline>,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(IndexProgress),
    ) -> Result<IndexOutcome> {
        let folder = request.folder.canonicalize()?;
        let key = CacheKey::compute(self.embedder.model_id(), &folder);
        let files = discover_files(&folder, request.recursive)?;

        let mut report = IndexReport::default();
        let base = self.resolve_base(&key, &folder, live, &mut report)?;
        let diff = diff(&files, &base.manifest.files, &request.passwords);
        tracing::info!(
            folder = %folder.display(),
            added = diff.added.len(),
            modified = diff.modified.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "indexing folder"
        );

        if diff.is_noop() {
            report.cached = count_indexed(&base.manifest, &diff.unchanged);
            report.chunks = base.store.len();
            report.unchanged = true;
            tracing::debug!(live = base.live, "nothing to index");
            report.failures = collect_failures(&base.manifest);
            return Ok(IndexOutcome {
                key,
                store: base.store,
                manifest: base.manifest,
                report,
            });
        }

        let total = diff.added.len() + diff.modified.len();
        let mut processed_chunks = Vec::new();
        let mut processed_records = Vec::new();

        for (i, file) in diff.pending().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(done = i, total, "indexing cancelled");
                report.cancelled = true;
                break;
            }
            let key = file.key();
            progress(IndexProgress {
                current: i,
                total,
                file: key.clone(),
            });

            let (status, chunk_ids) = match self.process_file(file, request) {
                Ok(chunks) => {
                    let ids = chunks.iter().map(|c| c.id.clone()).collect();
                    processed_chunks.extend(chunks);
                    report.indexed += 1;
                    (FileStatus::Indexed, ids)
                }
                Err(reason) => {
                    tracing::warn!(file = %key, %reason, "file not indexed");
                    report.failures.push(FileFailure {
                        path: key.clone(),
                        reason: reason.clone(),
                    });
                    (FileStatus::Failed { reason }, Vec::new())
                }
            };
            processed_records.push(FileRecord {
                path: key,
                size: file.size,
                mtime: file.mtime,
                status,
                chunk_ids,
            });
        }
        if !report.cancelled {
            progress(IndexProgress {
                current: total,
                total,
                file: String::new(),
            });
        }

        let unchanged: HashSet<&str> =
            diff.unchanged.iter().map(String::as_str).collect();
        let mut manifest = CacheManifest::new(
            &key,
            self.embedder.model_id(),
            &folder,
        );
        manifest.generation = base.manifest.generation + 1;
        manifest.touch();
        for (path, record) in &base.manifest.files {
            if unchanged.contains(path.as_str()) {
                manifest.files.insert(path.clone(), record.clone());
            }
        }
        for record in processed_records {
            manifest.files.insert(record.path.clone(), record);
        }

        let mut entries = processed_chunks;
        entries.extend(retained_chunks(&base, &unchanged)?);

        report.cached = count_indexed(&base.manifest, &diff.unchanged);
        report.removed = diff.removed.len();
        report.failures.extend(
            collect_failures(&base.manifest)
                .into_iter()
                .filter(|f| unchanged.contains(f.path.as_str())),
        );

        let store = IndexStore::assemble(
            manifest.generation,
            entries,
            self.settings.bm25,
            (self.vectors)(),
        )?;
        if manifest.chunk_count() != store.len() {
            return Err(Error::Consistency(format!(
                "manifest owns {} chunks, new generation holds {}",
                manifest.chunk_count(),
                store.len()
            )));
        }
        report.chunks = store.len();

        match self.cache.save(&key, &manifest, &store) {
            Ok(()) => report.persisted = true,
            Err(e) if e.class() == ErrorClass::ConsistencyViolation => {
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache not saved, index kept in memory only");
            }
        }

        tracing::info!(
            generation = manifest.generation,
            indexed = report.indexed,
            cached = report.cached,
            failed = report.failures.len(),
            chunks = report.chunks,
            "generation built"
        );

        Ok(IndexOutcome {
            key,
            store: Arc::new(store),
            manifest: Arc::new(manifest),
            report,
        })
    }

    fn resolve_base(
        &self,
        key: &CacheKey,
        folder: &std::path::Path,
        live: Option<&Baseline>,
        report: &mut IndexReport,
    ) -> Result<Base> {
        if let Some(live) = live.filter(|l| &l.key == key) {
            return Ok(Base {
                store: live.store.clone(),
                manifest: live.manifest.clone(),
                live: true,
            });
        }

        match self.cache.load(key) {
            Ok(cached) => {
                let generation = cached.manifest.generation;
                match IndexStore::assemble(
                    generation,
                    cached.chunks,
                    self.settings.bm25,
                    (self.vectors)(),
                ) {
                    Ok(store) => {
                        tracing::debug!(generation, "resuming from cache");
                        return Ok(Base {
                            store: Arc::new(store),
                            manifest: Arc::new(cached.manifest),
                            live: false,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cached generation unusable, rebuilding");
                        self.cache.delete(key)?;
                        report.recovered_corrupt_cache = true;
                    }
                }
            }
            Err(LoadError::NotFound) => {}
            Err(LoadError::Corrupt(_)) => report.recovered_corrupt_cache = true,
            Err(LoadError::Io(e)) => return Err(e.into()),
        }

        Ok(Base {
            store: Arc::new(IndexStore::empty(0, (self.vectors)())?),
            manifest: Arc::new(CacheManifest::new(
                key,
                self.embedder.model_id(),
                folder,
            )),
            live: false,
        })
    }

    fn process_file(
        &self,
        file: &DiscoveredFile,
        request: &IndexRequest,
    ) -> std::result::Result<Vec<StoredChunk>, FailureReason> {
        let key = file.key();
        let password = request.passwords.get(&key).map(String::as_str);
        let text = self
            .extractor
            .extract(&file.absolute_path, password, self.ocr)
            .map_err(FailureReason::Extract)?;

        let chunks = chunk_text(&text, self.settings.chunking);
        if chunks.is_empty() {
            return Err(FailureReason::EmptyText);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors =
            embed_batched(self.embedder, &texts, self.settings.embed_batch_size)
                .map_err(|e| FailureReason::Embedding(e.to_string()))?;

        let source = file.file_name();
        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| StoredChunk {
                id: chunk_id(&key, chunk.index),
                meta: ChunkMeta {
                    file_key: key.clone(),
                    source: source.clone(),
                    path: file.absolute_path.clone(),
                    chunk_index: chunk.index,
                    mtime: file.mtime,
                },
                chunk: DocumentChunk {
                    path: file.absolute_path.clone(),
                    chunk_index: chunk.index,
                    tokens: tokenize(&chunk.text),
                    text: chunk.text,
                    embedding,
                    offset: chunk.start_offset,
                },
            })
            .collect())
    }
}

/// Chunks of unchanged files, in their previous generation order.
fn retained_chunks(
    base: &Base,
    unchanged: &HashSet<&str>,
) -> Result<Vec<StoredChunk>> {
    let mut out = Vec::new();
    for key in unchanged {
        let Some(record) = base.manifest.files.get(*key) else {
            continue;
        };
        for id in &record.chunk_ids {
            if base.store.position(id).is_none() {
                return Err(Error::Consistency(format!(
                    "manifest lists chunk {id} missing from generation {}",
                    base.store.generation()
                )));
            }
        }
    }

    for pos in 0..base.store.len() {
        let Some(entry) = base.store.stored_chunk(pos) else {
            break;
        };
        if unchanged.contains(entry.meta.file_key.as_str()) {
            out.push(entry);
        }
    }
    Ok(out)
}

fn count_indexed(manifest: &CacheManifest, keys: &[String]) -> usize {
    keys.iter()
        .filter(|key| {
            manifest
                .files
                .get(key.as_str())
                .is_some_and(|record| !record.is_failed())
        })
        .count()
}

fn collect_failures(manifest: &CacheManifest) -> Vec<FileFailure> {
    manifest
        .files
        .values()
        .filter_map(|record| match &record.status {
            FileStatus::Failed { reason } => Some(FileFailure {
                path: record.path.clone(),
                reason: reason.clone(),
            }),
            FileStatus::Indexed => None,
        })
        .collect()
}
