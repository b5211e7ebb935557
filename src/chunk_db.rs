use std::path::{Path, PathBuf};

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};
use serde::{Deserialize, Serialize};

use crate::{
    bm25::tokenize,
    error::{Error, Result},
    store::{ChunkMeta, DocumentChunk, StoredChunk},
};

/// Chunk text and metadata as JSON, keyed by position in the generation.
const CHUNKS: TableDefinition<u64, &str> = TableDefinition::new("chunks");

/// Embeddings keyed by the same position.
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");

const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const GENERATION_KEY: &str = "generation";

/// Header size: 4 bytes embedding dimension.
const HEADER_SIZE: usize = 4;

#[derive(Serialize, Deserialize)]
struct ChunkRow {
    id: String,
    meta: ChunkMeta,
    path: PathBuf,
    chunk_index: usize,
    offset: usize,
    text: String,
}

/// On-disk payload of one cached generation.
///
/// Binary format per vector entry:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
///
/// Tokens are not stored; they are recomputed from the text on load.
pub struct ChunkDb {
    db: Database,
}

impl ChunkDb {
    /// Open or create a chunk database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(CHUNKS)?;
        txn.open_table(VECTORS)?;
        txn.open_table(META)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Replace the stored payload with `chunks`, tagged with `generation`,
    /// in a single transaction.
    pub fn write_generation<'a>(
        &self,
        generation: u64,
        chunks: impl IntoIterator<Item = StoredChunkRef<'a>>,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut rows = txn.open_table(CHUNKS)?;
            let mut vectors = txn.open_table(VECTORS)?;
            rows.retain(|_, _| false)?;
            vectors.retain(|_, _| false)?;

            for (pos, entry) in chunks.into_iter().enumerate() {
                let pos = pos as u64;
                let row = ChunkRow {
                    id: entry.id.to_string(),
                    meta: entry.meta.clone(),
                    path: entry.chunk.path.clone(),
                    chunk_index: entry.chunk.chunk_index,
                    offset: entry.chunk.offset,
                    text: entry.chunk.text.clone(),
                };
                rows.insert(pos, serde_json::to_string(&row)?.as_str())?;

                let bytes = encode_vector(&entry.chunk.embedding);
                vectors.insert(pos, bytes.as_slice())?;
            }

            let mut meta = txn.open_table(META)?;
            meta.insert(GENERATION_KEY, generation)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Generation tag of the stored payload, if one was ever written.
    pub fn generation(&self) -> Result<Option<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        Ok(table.get(GENERATION_KEY)?.map(|g| g.value()))
    }

    /// Load every stored chunk in generation order.
    ///
    /// Malformed rows and missing vectors are reported as
    /// [`Error::CacheCorrupt`].
    pub fn read_all(&self) -> Result<Vec<StoredChunk>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(CHUNKS)?;
        let vectors = txn.open_table(VECTORS)?;

        if rows.len()? != vectors.len()? {
            return Err(Error::CacheCorrupt(format!(
                "{} chunk rows but {} vectors",
                rows.len()?,
                vectors.len()?
            )));
        }

        let mut out = Vec::with_capacity(rows.len()? as usize);
        for (expected, row) in rows.iter()?.enumerate() {
            let (key, value) = row?;
            let pos = key.value();
            if pos != expected as u64 {
                return Err(Error::CacheCorrupt(format!(
                    "chunk rows not contiguous at position {pos}"
                )));
            }

            let row: ChunkRow = serde_json::from_str(value.value())
                .map_err(|e| Error::CacheCorrupt(e.to_string()))?;
            let embedding = match vectors.get(pos)? {
                Some(guard) => decode_vector(guard.value())?,
                None => {
                    return Err(Error::CacheCorrupt(format!(
                        "no vector stored for {}",
                        row.id
                    )));
                }
            };

            out.push(StoredChunk {
                id: row.id,
                meta: row.meta,
                chunk: DocumentChunk {
                    path: row.path,
                    chunk_index: row.chunk_index,
                    tokens: tokenize(&row.text),
                    text: row.text,
                    embedding,
                    offset: row.offset,
                },
            });
        }

        Ok(out)
    }
}

/// Borrowed view of a chunk for [`ChunkDb::write_generation`].
#[derive(Clone, Copy)]
pub struct StoredChunkRef<'a> {
    pub id: &'a str,
    pub meta: &'a ChunkMeta,
    pub chunk: &'a DocumentChunk,
}

/// Dimension header (u32 LE) followed by the raw f32 values.
fn encode_vector(data: &[f32]) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(data));
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(data));
    bytes
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::CacheCorrupt("truncated vector header".into()));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&bytes[..HEADER_SIZE]);
    let dimension = u32::from_le_bytes(header) as usize;

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != dimension * 4 {
        return Err(Error::CacheCorrupt(format!(
            "vector payload of {} bytes for dimension {dimension}",
            payload.len()
        )));
    }
    // redb values carry no alignment guarantee.
    Ok(bytemuck::pod_collect_to_vec(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::stored;

    fn refs(chunks: &[StoredChunk]) -> Vec<StoredChunkRef<'_>> {
        chunks
            .iter()
            .map(|c| StoredChunkRef {
                id: &c.id,
                meta: &c.meta,
                chunk: &c.chunk,
            })
            .collect()
    }

    #[test]
    fn fresh_db_has_no_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let db = ChunkDb::open(&tmp.path().join("chunks.redb")).unwrap();
        assert_eq!(db.generation().unwrap(), None);
        assert!(db.read_all().unwrap().is_empty());
    }

    #[test]
    fn write_then_read_preserves_order() {
        let tmp = tempfile::tempdir().unwrap();
        let db = ChunkDb::open(&tmp.path().join("chunks.redb")).unwrap();
        let chunks = vec![
            stored("b.txt", 0, "연차 휴가 규정"),
            stored("a.txt", 0, "alpha"),
            stored("a.txt", 1, "beta"),
        ];
        db.write_generation(4, refs(&chunks)).unwrap();

        assert_eq!(db.generation().unwrap(), Some(4));
        assert_eq!(db.read_all().unwrap(), chunks);
    }

    #[test]
    fn rewrite_replaces_previous_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chunks.redb");
        let db = ChunkDb::open(&path).unwrap();
        let first = vec![stored("a.txt", 0, "one"), stored("a.txt", 1, "two")];
        db.write_generation(1, refs(&first)).unwrap();

        let second = vec![stored("c.txt", 0, "three")];
        db.write_generation(2, refs(&second)).unwrap();
        drop(db);

        let reopened = ChunkDb::open(&path).unwrap();
        assert_eq!(reopened.generation().unwrap(), Some(2));
        assert_eq!(reopened.read_all().unwrap(), second);
    }

    #[test]
    fn vector_blob_carries_its_dimension() {
        let data = [0.25f32, -1.5, 3.0];
        let bytes = encode_vector(&data);
        assert_eq!(bytes.len(), HEADER_SIZE + 12);
        assert_eq!(bytes[..HEADER_SIZE], 3u32.to_le_bytes());
        assert_eq!(decode_vector(&bytes).unwrap(), data);
        assert_eq!(decode_vector(&encode_vector(&[])).unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn truncated_vector_is_corrupt() {
        assert!(matches!(
            decode_vector(&[1, 0]),
            Err(Error::CacheCorrupt(_))
        ));
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        assert!(matches!(decode_vector(&bytes), Err(Error::CacheCorrupt(_))));
    }
}
