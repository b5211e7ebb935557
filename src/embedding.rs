use std::sync::Arc;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Turns text into fixed-size vectors.
///
/// Implementations must be deterministic for a fixed model identity: the
/// cache relies on stored vectors matching what a fresh call would return.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    /// Embed a batch of document texts, one vector per input.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query. Models with asymmetric encoders override this.
    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(&[query.to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("empty query embedding".into()))
    }
}

/// Resolves a model id to a ready-to-use embedder.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_id: &str) -> Result<Arc<dyn Embedder>>;
}

/// Embed `texts` in batches of `batch_size`, checking that every input got
/// exactly one vector.
pub fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed(batch)?;
        if vectors.len() != batch.len() {
            return Err(Error::Embedding(format!(
                "{} returned {} vectors for {} texts",
                embedder.model_id(),
                vectors.len(),
                batch.len()
            )));
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Collapse per-token embeddings `[batch, tokens, dim]` into one unit
/// vector per document by averaging the non-padding token rows.
pub fn pool_token_embeddings(embeddings: &Tensor) -> Result<Vec<Vec<f32>>> {
    let (_, _, dimension) = embeddings.dims3()?;
    let rows = embeddings.to_dtype(DType::F32)?.to_vec3::<f32>()?;

    Ok(rows
        .into_iter()
        .map(|tokens| mean_of_nonzero_rows(&tokens, dimension))
        .collect())
}

fn mean_of_nonzero_rows(tokens: &[Vec<f32>], dimension: usize) -> Vec<f32> {
    let mut sum = vec![0.0f32; dimension];
    let mut count = 0usize;
    for row in tokens {
        if row.iter().all(|v| *v == 0.0) {
            continue;
        }
        for (acc, v) in sum.iter_mut().zip(row) {
            *acc += v;
        }
        count += 1;
    }
    if count == 0 {
        return sum;
    }

    let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        sum.iter_mut().for_each(|v| *v /= norm);
    }
    sum
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    struct Doubling;

    impl Embedder for Doubling {
        fn model_id(&self) -> &str {
            "doubling"
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32 * 2.0]).collect())
        }
    }

    struct Short;

    impl Embedder for Short {
        fn model_id(&self) -> &str {
            "short"
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0]])
        }
    }

    #[test]
    fn batches_preserve_order() {
        let texts: Vec<String> =
            ["a", "bb", "ccc", "dddd", "eeeee"].map(String::from).to_vec();
        let vectors = embed_batched(&Doubling, &texts, 2).unwrap();
        assert_eq!(
            vectors,
            vec![vec![2.0], vec![4.0], vec![6.0], vec![8.0], vec![10.0]]
        );
    }

    #[test]
    fn short_batch_is_an_error() {
        let texts: Vec<String> = ["a", "b"].map(String::from).to_vec();
        assert!(matches!(
            embed_batched(&Short, &texts, 10),
            Err(Error::Embedding(_))
        ));
    }

    #[test]
    fn default_query_embedding_uses_embed() {
        assert_eq!(Doubling.embed_query("abc").unwrap(), vec![6.0]);
    }

    #[test]
    fn pooling_skips_padding_and_normalizes() {
        let data: Vec<f32> = vec![
            3.0, 0.0, // token
            0.0, 4.0, // token
            0.0, 0.0, // padding
        ];
        let tensor = Tensor::from_vec(data, (1, 3, 2), &Device::Cpu).unwrap();
        let pooled = pool_token_embeddings(&tensor).unwrap();

        assert_eq!(pooled.len(), 1);
        let v = &pooled[0];
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }
}
