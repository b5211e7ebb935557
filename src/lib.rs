//! docseek - hybrid keyword and semantic search over a folder of documents.
//!
//! A folder is extracted, chunked and embedded into an immutable index
//! generation combining a vector index with BM25 statistics. Results for
//! unchanged files are reused from an on-disk cache, so re-indexing only
//! pays for what changed. A [`coordinator`] serializes model loads, index
//! passes, searches and downloads, and reports progress as signals.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docseek::{
//!     CacheStore, DataDir, DocumentExtractor, FlatIndex, ModelManager,
//!     coordinator::{self, CoordinatorConfig, Services, Signal},
//!     hybrid::SearchQuery,
//!     indexer::IndexRequest,
//! };
//!
//! # async fn run() -> docseek::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let services = Services {
//!     loader: Arc::new(ModelManager::new(Some(data_dir.models_dir()?))),
//!     extractor: Arc::new(DocumentExtractor),
//!     ocr: None,
//!     vectors: FlatIndex::boxed,
//!     cache: CacheStore::new(data_dir.cache_root()),
//!     download: None,
//! };
//! let (handle, mut signals) =
//!     coordinator::spawn(services, CoordinatorConfig::default());
//!
//! let op = handle.load_model(docseek::model_manager::DEFAULT_MODEL_ID).await?;
//! coordinator::wait_for(&mut signals, op, |_, _, _| {}).await;
//!
//! let op = handle
//!     .index(IndexRequest {
//!         folder: "/path/to/docs".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! coordinator::wait_for(&mut signals, op, |current, total, file| {
//!     eprintln!("[{current}/{total}] {file}");
//! })
//! .await;
//!
//! let op = handle.search(SearchQuery::new("travel expense policy")).await?;
//! if let Some(Signal::Completed { outcome, .. }) =
//!     coordinator::wait_for(&mut signals, op, |_, _, _| {}).await
//! {
//!     println!("{outcome:?}");
//! }
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bm25;
pub mod cache;
pub mod chunk_db;
pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod data_dir;
pub mod diagnostics;
pub mod download;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod hybrid;
pub mod incremental;
pub mod indexer;
pub mod model_manager;
pub mod operation;
pub mod runtime;
pub mod store;
pub mod text_util;
pub mod vector;
pub mod walker;

pub use cache::CacheStore;
pub use config::Settings;
pub use data_dir::DataDir;
pub use embedding::{Embedder, ModelLoader};
pub use error::{Error, Result};
pub use extract::{DocumentExtractor, Extractor, OcrEngine};
pub use model_manager::ModelManager;
pub use store::IndexStore;
pub use vector::{FlatIndex, VectorIndex};
