//! Hybrid ranking: vector similarity and BM25 merged into one list.
//!
//! The two score sets live on unrelated scales, so each is min-max
//! normalized over its own candidates before the weighted sum. A chunk
//! found by only one retriever keeps its entry with a zero for the other.

use std::{cmp::Ordering, collections::HashMap, path::PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;

use crate::{
    bm25::tokenize,
    config::Settings,
    embedding::Embedder,
    error::{Error, Result},
    store::IndexStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub vector: f32,
    pub bm25: f32,
}

impl Weights {
    /// Used when hybrid ranking is turned off.
    pub const VECTOR_ONLY: Weights = Weights {
        vector: 1.0,
        bm25: 0.0,
    };
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            bm25: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchSettings {
    pub weights: Weights,
    pub default_results: usize,
    pub max_results: usize,
    pub min_query_chars: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SearchSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            weights: Weights {
                vector: settings.vector_weight,
                bm25: settings.bm25_weight,
            },
            default_results: settings.default_results,
            max_results: settings.max_results,
            min_query_chars: settings.min_query_chars,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Score,
    /// File name ascending, then score.
    Filename,
    /// Newest file first, then score.
    Mtime,
}

/// Post-ranking restrictions on which chunks may be returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Allowed extensions, without the leading dot.
    pub extensions: Vec<String>,
    /// Substring of the file name, or a glob when it contains `*`, `?` or `[`.
    pub name: Option<String>,
    /// Substring of the path relative to the indexed folder.
    pub path: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty() && self.name.is_none() && self.path.is_none()
    }

    fn compile(&self) -> Result<CompiledFilters> {
        let name = match self.name.as_deref() {
            None => None,
            Some(pattern) if pattern.contains(['*', '?', '[']) => {
                let glob = GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        Error::Query(format!("bad name pattern {pattern:?}: {e}"))
                    })?;
                Some(NameMatcher::Glob(glob.compile_matcher()))
            }
            Some(pattern) => Some(NameMatcher::Substring(pattern.to_lowercase())),
        };

        Ok(CompiledFilters {
            extensions: self
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            name,
            path: self.path.as_deref().map(str::to_lowercase),
        })
    }
}

enum NameMatcher {
    Substring(String),
    Glob(GlobMatcher),
}

struct CompiledFilters {
    extensions: Vec<String>,
    name: Option<NameMatcher>,
    path: Option<String>,
}

impl CompiledFilters {
    fn accepts(&self, file_key: &str, source: &str) -> bool {
        if !self.extensions.is_empty() {
            let ext = source
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_lowercase())
                .unwrap_or_default();
            if !self.extensions.contains(&ext) {
                return false;
            }
        }
        match &self.name {
            Some(NameMatcher::Substring(s)) if !source.to_lowercase().contains(s) => {
                return false;
            }
            Some(NameMatcher::Glob(g)) if !g.is_match(source) => return false,
            _ => {}
        }
        match &self.path {
            Some(p) => file_key.to_lowercase().contains(p),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    /// Requested result count; the configured default when absent.
    pub k: Option<usize>,
    pub hybrid: bool,
    pub filters: SearchFilters,
    pub sort: SortMode,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hybrid: true,
            ..Self::default()
        }
    }
}

/// How a hit's final score was put together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Raw cosine similarity, when the chunk was a vector candidate.
    pub vector: Option<f32>,
    pub vector_norm: f32,
    /// 1-based rank among vector candidates.
    pub vector_rank: Option<usize>,
    /// Raw BM25 score, when positive.
    pub bm25: Option<f32>,
    pub bm25_norm: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub file: String,
    pub source: String,
    pub path: PathBuf,
    pub chunk_index: usize,
    pub text: String,
    pub offset: usize,
    pub mtime: u64,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchResponse {
    Hits { generation: u64, hits: Vec<SearchHit> },
    /// Nothing is indexed yet, or the index was cleared.
    NoIndex,
    QueryTooShort { min_chars: usize },
}

/// Min-max normalize `scores` into `[0, 1]`.
///
/// Non-finite inputs become 0. When every finite input is equal they all
/// become 1.
///
/// # Examples
///
/// ```
/// use docseek::hybrid::normalize_scores;
///
/// assert_eq!(normalize_scores(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
/// assert_eq!(normalize_scores(&[5.0, 5.0]), vec![1.0, 1.0]);
/// assert_eq!(normalize_scores(&[f32::NAN, 1.0]), vec![0.0, 1.0]);
/// ```
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let (min, max) = scores
        .iter()
        .filter(|s| s.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    if !min.is_finite() {
        return vec![0.0; scores.len()];
    }

    let range = max - min;
    scores
        .iter()
        .map(|&s| {
            if !s.is_finite() {
                0.0
            } else if range <= f32::EPSILON {
                1.0
            } else {
                (s - min) / range
            }
        })
        .collect()
}

/// A chunk position with its merged score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ranked {
    pub position: usize,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

/// Merge vector and BM25 results over `store`.
///
/// The vector index contributes its top `2 * candidates` entries. BM25
/// contributes every positive score unless `query_tokens` is `None`. The
/// result holds every chunk either side found, best first.
pub fn rank(
    store: &IndexStore,
    query_vector: &[f32],
    query_tokens: Option<&[String]>,
    weights: Weights,
    candidates: usize,
) -> Vec<Ranked> {
    let mut merged: HashMap<usize, ScoreBreakdown> = HashMap::new();

    let vector_hits: Vec<(usize, f32)> = store
        .vectors()
        .search(query_vector, candidates.saturating_mul(2))
        .into_iter()
        .filter_map(|(id, score)| store.position(&id).map(|pos| (pos, score)))
        .collect();
    let raw: Vec<f32> = vector_hits.iter().map(|(_, s)| *s).collect();
    for (rank, ((pos, score), norm)) in vector_hits
        .iter()
        .zip(normalize_scores(&raw))
        .enumerate()
    {
        let entry = merged.entry(*pos).or_default();
        entry.vector = Some(*score);
        entry.vector_norm = norm;
        entry.vector_rank = Some(rank + 1);
    }

    if let (Some(tokens), Some(bm25)) = (query_tokens, store.bm25()) {
        let lexical = bm25.scores(tokens);
        let raw: Vec<f32> = lexical.iter().map(|(_, s)| *s).collect();
        for ((pos, score), norm) in lexical.iter().zip(normalize_scores(&raw)) {
            let entry = merged.entry(*pos).or_default();
            entry.bm25 = Some(*score);
            entry.bm25_norm = norm;
        }
    }

    let mut ranked: Vec<Ranked> = merged
        .into_iter()
        .map(|(position, breakdown)| Ranked {
            position,
            score: weights.vector * breakdown.vector_norm
                + weights.bm25 * breakdown.bm25_norm,
            breakdown,
        })
        .collect();

    let meta = store.meta();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| match (a.breakdown.vector_rank, b.breakdown.vector_rank) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| meta[a.position].path.cmp(&meta[b.position].path))
            .then_with(|| {
                meta[a.position].chunk_index.cmp(&meta[b.position].chunk_index)
            })
    });
    ranked
}

/// Answer `query` against one committed generation.
///
/// `index` is `None` when no model is loaded, no index has been built, or
/// the index was cleared.
pub fn search(
    index: Option<(&IndexStore, &dyn Embedder)>,
    query: &SearchQuery,
    settings: &SearchSettings,
) -> Result<SearchResponse> {
    let text = query.text.trim();
    if text.chars().count() < settings.min_query_chars {
        return Ok(SearchResponse::QueryTooShort {
            min_chars: settings.min_query_chars,
        });
    }
    let Some((store, embedder)) = index.filter(|(s, _)| !s.is_empty()) else {
        return Ok(SearchResponse::NoIndex);
    };

    let filters = query.filters.compile()?;
    let k = query
        .k
        .unwrap_or(settings.default_results)
        .clamp(1, settings.max_results.max(1));
    let candidates = if query.filters.is_empty() { k } else { store.len() };

    let query_vector = embedder.embed_query(text)?;
    let tokens = query.hybrid.then(|| tokenize(text));
    let weights = if query.hybrid {
        settings.weights
    } else {
        Weights::VECTOR_ONLY
    };

    let meta = store.meta();
    let chunks = store.chunks();
    let mut hits: Vec<SearchHit> =
        rank(store, &query_vector, tokens.as_deref(), weights, candidates)
            .into_iter()
            .filter(|r| {
                let m = &meta[r.position];
                filters.accepts(&m.file_key, &m.source)
            })
            .take(k)
            .map(|r| {
                let m = &meta[r.position];
                let chunk = &chunks[r.position];
                SearchHit {
                    id: store.ids()[r.position].clone(),
                    file: m.file_key.clone(),
                    source: m.source.clone(),
                    path: m.path.clone(),
                    chunk_index: m.chunk_index,
                    text: chunk.text.clone(),
                    offset: chunk.offset,
                    mtime: m.mtime,
                    score: r.score,
                    breakdown: r.breakdown,
                }
            })
            .collect();

    match query.sort {
        SortMode::Score => {}
        SortMode::Filename => hits.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| b.score.total_cmp(&a.score))
        }),
        SortMode::Mtime => hits.sort_by(|a, b| {
            b.mtime.cmp(&a.mtime).then_with(|| b.score.total_cmp(&a.score))
        }),
    }

    tracing::debug!(query = text, k, hits = hits.len(), "search finished");
    Ok(SearchResponse::Hits {
        generation: store.generation(),
        hits,
    })
}
