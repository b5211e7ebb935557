//! Vector similarity search over chunk embeddings.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::error::{Error, Result};

/// A nearest-neighbour index keyed by chunk id.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector stored under `id`.
    fn upsert(&mut self, id: &str, vector: &[f32]) -> Result<()>;

    /// Remove `id`, returning whether it was present.
    fn remove(&mut self, id: &str) -> bool;

    /// The `k` most similar entries, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Produces empty vector indexes for fresh generations.
pub type VectorIndexFactory = fn() -> Box<dyn VectorIndex>;

/// Exact cosine-similarity search over every stored vector.
#[derive(Debug, Default)]
pub struct FlatIndex {
    dimension: Option<usize>,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    positions: HashMap<String, usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed() -> Box<dyn VectorIndex> {
        Box::new(Self::new())
    }
}

fn normalized(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter().map(|v| v / norm).collect()
    } else {
        vector.to_vec()
    }
}

impl VectorIndex for FlatIndex {
    fn upsert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        match self.dimension {
            Some(dim) if dim != vector.len() => {
                return Err(Error::Embedding(format!(
                    "vector for {id} has dimension {}, index expects {dim}",
                    vector.len()
                )));
            }
            None => self.dimension = Some(vector.len()),
            _ => {}
        }

        let vector = normalized(vector);
        match self.positions.get(id) {
            Some(&pos) => self.vectors[pos] = vector,
            None => {
                self.positions.insert(id.to_string(), self.ids.len());
                self.ids.push(id.to_string());
                self.vectors.push(vector);
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(pos) = self.positions.remove(id) else {
            return false;
        };
        self.ids.swap_remove(pos);
        self.vectors.swap_remove(pos);
        if let Some(moved) = self.ids.get(pos) {
            self.positions.insert(moved.clone(), pos);
        }
        true
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        if k == 0 || self.dimension != Some(query.len()) {
            return Vec::new();
        }

        let query = normalized(query);
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_iter()
            .enumerate()
            .map(|(i, v)| {
                (i, v.iter().zip(&query).map(|(a, b)| a * b).sum::<f32>())
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1).then_with(|| self.ids[a.0].cmp(&self.ids[b.0]))
        });
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, sim)| (self.ids[i].clone(), sim))
            .collect()
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_vector_first() {
        let mut index = FlatIndex::new();
        index.upsert("x", &[1.0, 0.0]).unwrap();
        index.upsert("y", &[0.0, 1.0]).unwrap();
        index.upsert("xy", &[1.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.1], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "x");
        assert_eq!(hits[1].0, "xy");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut index = FlatIndex::new();
        index.upsert("a", &[1.0, 0.0]).unwrap();
        index.upsert("a", &[0.0, 1.0]).unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn remove_keeps_other_entries_addressable() {
        let mut index = FlatIndex::new();
        for (id, v) in [("a", [1.0, 0.0]), ("b", [0.0, 1.0]), ("c", [1.0, 1.0])]
        {
            index.upsert(id, &v).unwrap();
        }

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert_eq!(index.len(), 2);

        index.upsert("c", &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 2);
        let ids: Vec<_> =
            index.search(&[0.0, 1.0], 5).into_iter().map(|h| h.0).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let mut index = FlatIndex::new();
        index.upsert("a", &[1.0, 0.0]).unwrap();
        assert!(index.upsert("b", &[1.0, 0.0, 0.0]).is_err());
        assert!(index.search(&[1.0, 0.0, 0.0], 3).is_empty());
    }
}
