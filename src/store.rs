//! The in-memory index: one immutable generation of chunks and the
//! lexical and vector structures derived from them.
//!
//! A generation is assembled in one step from its full chunk list and is
//! never edited afterwards. The indexer produces the next generation
//! instead, which keeps the parallel arrays aligned by construction.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    bm25::{Bm25Index, Bm25Params},
    error::{Error, Result},
    vector::VectorIndex,
};

/// A chunk of extracted text together with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub path: PathBuf,
    pub chunk_index: usize,
    pub text: String,
    pub tokens: Vec<String>,
    pub embedding: Vec<f32>,
    /// Byte offset of the chunk in the extracted text.
    pub offset: usize,
}

/// Display metadata for a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Manifest key of the owning file.
    pub file_key: String,
    /// File name shown to users.
    pub source: String,
    pub path: PathBuf,
    pub chunk_index: usize,
    /// Modification time of the owning file, nanoseconds since the epoch.
    pub mtime: u64,
}

/// A chunk ready to be placed in a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub id: String,
    pub meta: ChunkMeta,
    pub chunk: DocumentChunk,
}

pub struct IndexStore {
    generation: u64,
    chunks: Vec<DocumentChunk>,
    ids: Vec<String>,
    meta: Vec<ChunkMeta>,
    bm25: Option<Bm25Index>,
    vectors: Box<dyn VectorIndex>,
    positions: HashMap<String, usize>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("generation", &self.generation)
            .field("chunks", &self.chunks.len())
            .field("bm25", &self.bm25.is_some())
            .field("vectors", &self.vectors.len())
            .finish()
    }
}

impl IndexStore {
    /// Build a generation from its complete, ordered chunk list.
    ///
    /// `vectors` must be empty; it is filled with every chunk's embedding.
    /// Fails with a consistency error on duplicate ids.
    pub fn assemble(
        generation: u64,
        entries: Vec<StoredChunk>,
        params: Bm25Params,
        mut vectors: Box<dyn VectorIndex>,
    ) -> Result<Self> {
        if !vectors.is_empty() {
            return Err(Error::Consistency(
                "new generation handed a non-empty vector index".into(),
            ));
        }

        let mut chunks = Vec::with_capacity(entries.len());
        let mut ids = Vec::with_capacity(entries.len());
        let mut meta = Vec::with_capacity(entries.len());
        let mut positions = HashMap::with_capacity(entries.len());

        for (pos, entry) in entries.into_iter().enumerate() {
            if positions.insert(entry.id.clone(), pos).is_some() {
                return Err(Error::Consistency(format!(
                    "duplicate chunk id {}",
                    entry.id
                )));
            }
            vectors.upsert(&entry.id, &entry.chunk.embedding)?;
            ids.push(entry.id);
            meta.push(entry.meta);
            chunks.push(entry.chunk);
        }

        let tokens: Vec<Vec<String>> =
            chunks.iter().map(|c| c.tokens.clone()).collect();
        let bm25 = Bm25Index::build(&tokens, params);

        let store = Self {
            generation,
            chunks,
            ids,
            meta,
            bm25,
            vectors,
            positions,
        };
        store.check_consistency()?;
        Ok(store)
    }

    /// A generation with no documents and no lexical index.
    pub fn empty(generation: u64, vectors: Box<dyn VectorIndex>) -> Result<Self> {
        Self::assemble(generation, Vec::new(), Bm25Params::default(), vectors)
    }

    /// Verify that every parallel structure describes the same chunk list.
    pub fn check_consistency(&self) -> Result<()> {
        let n = self.chunks.len();
        if self.ids.len() != n || self.meta.len() != n || self.positions.len() != n {
            return Err(Error::Consistency(format!(
                "store arrays misaligned: chunks={n} ids={} meta={}",
                self.ids.len(),
                self.meta.len()
            )));
        }
        match &self.bm25 {
            Some(bm25) if bm25.len() != n => {
                return Err(Error::Consistency(format!(
                    "bm25 built over {} documents, store holds {n}",
                    bm25.len()
                )));
            }
            None if n > 0 => {
                return Err(Error::Consistency(
                    "non-empty store without a bm25 index".into(),
                ));
            }
            _ => {}
        }
        if self.vectors.len() != n {
            return Err(Error::Consistency(format!(
                "vector index holds {} entries, store holds {n}",
                self.vectors.len()
            )));
        }
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[DocumentChunk] {
        &self.chunks
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn meta(&self) -> &[ChunkMeta] {
        &self.meta
    }

    pub fn bm25(&self) -> Option<&Bm25Index> {
        self.bm25.as_ref()
    }

    pub fn vectors(&self) -> &dyn VectorIndex {
        self.vectors.as_ref()
    }

    /// Position of chunk `id` in the parallel arrays.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Copy out the chunk at `pos` so it can be carried into a new generation.
    pub fn stored_chunk(&self, pos: usize) -> Option<StoredChunk> {
        Some(StoredChunk {
            id: self.ids.get(pos)?.clone(),
            meta: self.meta.get(pos)?.clone(),
            chunk: self.chunks.get(pos)?.clone(),
        })
    }

    /// Number of distinct files with chunks in this generation.
    pub fn file_count(&self) -> usize {
        let mut keys: Vec<&str> =
            self.meta.iter().map(|m| m.file_key.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.len()
    }
}
