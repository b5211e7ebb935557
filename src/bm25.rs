//! Lexical scoring with Okapi BM25.
//!
//! The tokenizer is tuned for mixed Korean/English text: it lowercases,
//! drops punctuation, strips a single trailing postposition from
//! agglutinated Korean words and discards very short tokens and stopwords.
//!
//! An index is only ever built over a non-empty corpus; [`Bm25Index::build`]
//! returns `None` otherwise so callers must treat lexical scoring as absent.

use std::collections::HashMap;

use rayon::prelude::*;

/// Tokens shorter than this (in chars) are dropped.
const MIN_TOKEN_CHARS: usize = 2;

/// Single-syllable Korean postpositions stripped from the end of a token.
const PARTICLES: &[&str] = &[
    "은", "는", "이", "가", "을", "를", "의", "에", "로", "와", "과", "도",
    "만",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "are", "was", "from", "into",
    "그리고", "또는", "하는", "있는", "있다", "에서", "으로",
];

/// Split `text` into normalized search terms.
///
/// # Examples
///
/// ```
/// use docseek::bm25::tokenize;
///
/// assert_eq!(tokenize("휴가 규정은 Rust-based"), vec!["휴가", "규정", "rust", "based"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .map(strip_particle)
        .filter(|t| {
            t.chars().count() >= MIN_TOKEN_CHARS && !STOPWORDS.contains(&t.as_str())
        })
        .collect()
}

fn strip_particle(token: &str) -> String {
    let len = token.chars().count();
    for particle in PARTICLES {
        if len > particle.chars().count() + 1
            && let Some(stem) = token.strip_suffix(particle)
        {
            return stem.to_string();
        }
    }
    token.to_string()
}

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// BM25 statistics over a fixed, non-empty document set.
#[derive(Debug, Clone)]
pub struct Bm25Index {
    params: Bm25Params,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f32,
    idf: HashMap<String, f32>,
}

impl Bm25Index {
    /// Build an index over pre-tokenized documents.
    ///
    /// Returns `None` for an empty corpus.
    pub fn build(docs: &[Vec<String>], params: Bm25Params) -> Option<Self> {
        if docs.is_empty() {
            return None;
        }

        let term_freqs: Vec<HashMap<String, u32>> = docs
            .par_iter()
            .map(|tokens| {
                let mut tf = HashMap::new();
                for token in tokens {
                    *tf.entry(token.clone()).or_insert(0) += 1;
                }
                tf
            })
            .collect();

        let mut doc_freqs: HashMap<&str, usize> = HashMap::new();
        for tf in &term_freqs {
            for term in tf.keys() {
                *doc_freqs.entry(term.as_str()).or_insert(0) += 1;
            }
        }

        let n = docs.len() as f32;
        let idf = doc_freqs
            .into_iter()
            .map(|(term, df)| {
                let df = df as f32;
                (term.to_string(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();

        let doc_lens: Vec<usize> = docs.iter().map(Vec::len).collect();
        let total: usize = doc_lens.iter().sum();
        let avg = total as f32 / n;
        // A corpus of token-less chunks still gets a usable denominator.
        let avg_doc_len = if avg > 0.0 { avg } else { 1.0 };

        Some(Self {
            params,
            term_freqs,
            doc_lens,
            avg_doc_len,
            idf,
        })
    }

    /// Number of documents the index was built over.
    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Score every document against `query`, keeping only positive scores.
    ///
    /// Returns `(document position, score)` pairs in position order.
    pub fn scores(&self, query: &[String]) -> Vec<(usize, f32)> {
        let terms: Vec<(&str, f32)> = {
            let mut seen = std::collections::HashSet::new();
            query
                .iter()
                .filter(|t| seen.insert(t.as_str()))
                .filter_map(|t| self.idf.get(t).map(|idf| (t.as_str(), *idf)))
                .collect()
        };
        if terms.is_empty() {
            return Vec::new();
        }

        let Bm25Params { k1, b } = self.params;
        (0..self.len())
            .into_par_iter()
            .filter_map(|i| {
                let tf = &self.term_freqs[i];
                let norm =
                    1.0 - b + b * (self.doc_lens[i] as f32 / self.avg_doc_len);
                let score: f32 = terms
                    .iter()
                    .filter_map(|(term, idf)| {
                        let f = *tf.get(*term)? as f32;
                        Some(idf * f * (k1 + 1.0) / (f + k1 * norm))
                    })
                    .sum();
                (score > 0.0).then_some((i, score))
            })
            .collect()
    }
}
