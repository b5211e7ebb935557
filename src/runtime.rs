//! The coordinator's state and its all-or-nothing transitions.
//!
//! Nothing here is shared: the coordinator loop owns the single
//! [`RuntimeState`] and is the only caller of its mutating methods. Every
//! protocol step that touches more than one field is one method, so a
//! failure part-way can never leave the model and the index out of step.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    cache::CacheUsage,
    embedding::Embedder,
    error::{Error, Result},
    indexer::Baseline,
    operation::{
        ActiveOperation, OperationId, OperationKind, OperationRegistry, Rejected,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ModelLoading,
    Indexing,
    Searching,
    Downloading,
    ShuttingDown,
}

/// Which user actions are currently allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Controls {
    pub can_search: bool,
    pub can_index: bool,
    pub can_switch_model: bool,
    pub can_clear_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    /// Completed with per-file failures.
    Partial,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastOperation {
    pub id: OperationId,
    pub status: OutcomeStatus,
    pub summary: String,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
}

fn millis<S: serde::Serializer>(
    d: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub model: Option<String>,
    pub folder: Option<PathBuf>,
    pub phase: Phase,
    pub active: Vec<OperationId>,
    pub generation: Option<u64>,
    pub chunks: usize,
    pub files: usize,
    pub failed_files: Vec<String>,
    pub bm25: bool,
    pub controls: Controls,
    pub last: Option<LastOperation>,
    pub cache: Option<CacheUsage>,
}

#[derive(Default)]
pub struct RuntimeState {
    model_id: Option<String>,
    embedder: Option<Arc<dyn Embedder>>,
    folder: Option<PathBuf>,
    index: Option<Baseline>,
    operations: OperationRegistry,
    shutting_down: bool,
    last: Option<LastOperation>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("model_id", &self.model_id)
            .field("folder", &self.folder)
            .field("generation", &self.index.as_ref().map(|i| i.store.generation()))
            .field("operations", &self.operations)
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub fn folder(&self) -> Option<&PathBuf> {
        self.folder.as_ref()
    }

    /// The last committed generation, if any.
    pub fn index(&self) -> Option<&Baseline> {
        self.index.as_ref()
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn last_operation(&self) -> Option<&LastOperation> {
        self.last.as_ref()
    }

    pub fn phase(&self) -> Phase {
        if self.shutting_down {
            return Phase::ShuttingDown;
        }
        let ops = &self.operations;
        if ops.is_active(OperationKind::Load) {
            Phase::ModelLoading
        } else if ops.is_active(OperationKind::Index) {
            Phase::Indexing
        } else if ops.is_active(OperationKind::Download) {
            Phase::Downloading
        } else if ops.is_active(OperationKind::Search) {
            Phase::Searching
        } else {
            Phase::Idle
        }
    }

    pub fn controls(&self) -> Controls {
        let ops = &self.operations;
        let open = !self.shutting_down;
        let loading = ops.is_active(OperationKind::Load);
        let indexing = ops.is_active(OperationKind::Index);
        let searching = ops.is_active(OperationKind::Search);
        Controls {
            can_search: open
                && !loading
                && !searching
                && self.embedder.is_some()
                && self.index.as_ref().is_some_and(|i| !i.store.is_empty()),
            can_index: open && !loading && !indexing && self.embedder.is_some(),
            can_switch_model: open && !loading && !indexing && !searching,
            can_clear_cache: open && !indexing,
        }
    }

    /// Admit an operation of `kind` if the current state allows it.
    pub fn admit(&mut self, kind: OperationKind) -> std::result::Result<ActiveOperation, Rejected> {
        if self.shutting_down {
            return Err(Rejected::ShuttingDown);
        }
        let blockers: &[OperationKind] = match kind {
            OperationKind::Load => &[OperationKind::Index, OperationKind::Search],
            OperationKind::Index | OperationKind::Search => &[OperationKind::Load],
            OperationKind::Download => &[],
        };
        if let Some(active) = blockers
            .iter()
            .find_map(|k| self.operations.get(*k))
            .map(|op| op.id)
        {
            return Err(Rejected::Conflict { active });
        }
        if kind == OperationKind::Index && self.embedder.is_none() {
            return Err(Rejected::NoModel);
        }
        self.operations.admit(kind)
    }

    pub fn finish(&mut self, id: OperationId) -> Option<ActiveOperation> {
        self.operations.finish(id)
    }

    pub fn cancel(&self, kind: OperationKind) -> Option<OperationId> {
        self.operations.cancel(kind)
    }

    /// Enter shutdown and cancel everything still running.
    pub fn begin_shutdown(&mut self) -> Vec<OperationId> {
        self.shutting_down = true;
        self.operations.cancel_all()
    }

    /// Install a freshly loaded model.
    ///
    /// A different model invalidates the index, which is dropped in the same
    /// step. Returns whether the index was kept.
    pub fn switch_model(&mut self, model_id: String, embedder: Arc<dyn Embedder>) -> bool {
        let same = self.model_id.as_deref() == Some(model_id.as_str());
        if !same {
            self.index = None;
        }
        self.model_id = Some(model_id);
        self.embedder = Some(embedder);
        same
    }

    /// Drop the in-memory index and manifest.
    pub fn clear_index(&mut self) {
        self.index = None;
    }

    /// Make `index` the generation searches read from.
    pub fn commit_generation(&mut self, folder: PathBuf, index: Baseline) -> Result<()> {
        if self.model_id.as_deref() != Some(index.manifest.model_id.as_str()) {
            return Err(Error::Consistency(format!(
                "generation built with {} but {:?} is loaded",
                index.manifest.model_id, self.model_id
            )));
        }
        if index.manifest.generation != index.store.generation()
            || index.manifest.chunk_count() != index.store.len()
        {
            return Err(Error::Consistency(format!(
                "manifest generation {} ({} chunks) does not describe \
                 store generation {} ({} chunks)",
                index.manifest.generation,
                index.manifest.chunk_count(),
                index.store.generation(),
                index.store.len()
            )));
        }
        index.store.check_consistency()?;

        self.folder = Some(folder);
        self.index = Some(index);
        Ok(())
    }

    pub fn record(&mut self, last: LastOperation) {
        self.last = Some(last);
    }

    pub fn status(&self, cache: Option<CacheUsage>) -> StatusReport {
        let index = self.index.as_ref();
        StatusReport {
            model: self.model_id.clone(),
            folder: self.folder.clone(),
            phase: self.phase(),
            active: self.operations.ids(),
            generation: index.map(|i| i.store.generation()),
            chunks: index.map_or(0, |i| i.store.len()),
            files: index.map_or(0, |i| i.manifest.indexed_files()),
            failed_files: index
                .map(|i| i.manifest.failed_files().map(|r| r.path.clone()).collect())
                .unwrap_or_default(),
            bm25: index.is_some_and(|i| i.store.bm25().is_some()),
            controls: self.controls(),
            last: self.last.clone(),
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        bm25::Bm25Params,
        cache::{CacheKey, CacheManifest, FileRecord, FileStatus},
        store::{IndexStore, tests::stored},
        vector::FlatIndex,
    };

    struct Fixed(&'static str);

    impl Embedder for Fixed {
        fn model_id(&self) -> &str {
            self.0
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn baseline(model: &str) -> Baseline {
        let key = CacheKey::compute(model, Path::new("/docs"));
        let store = IndexStore::assemble(
            1,
            vec![stored("a.txt", 0, "alpha")],
            Bm25Params::default(),
            FlatIndex::boxed(),
        )
        .unwrap();
        let mut manifest = CacheManifest::new(&key, model, Path::new("/docs"));
        manifest.generation = 1;
        manifest.files.insert(
            "a.txt".into(),
            FileRecord {
                path: "a.txt".into(),
                size: 5,
                mtime: 1,
                status: FileStatus::Indexed,
                chunk_ids: vec!["a.txt#0".into()],
            },
        );
        Baseline {
            key,
            store: Arc::new(store),
            manifest: Arc::new(manifest),
        }
    }

    fn loaded(model: &'static str) -> RuntimeState {
        let mut state = RuntimeState::new();
        state.switch_model(model.into(), Arc::new(Fixed(model)));
        state
    }

    #[test]
    fn index_requires_a_model() {
        let mut state = RuntimeState::new();
        assert_eq!(
            state.admit(OperationKind::Index).unwrap_err(),
            Rejected::NoModel
        );
        assert!(!state.controls().can_index);
        assert!(state.controls().can_switch_model);
    }

    #[test]
    fn index_is_blocked_while_loading() {
        let mut state = loaded("a");
        let load = state.admit(OperationKind::Load).unwrap();
        assert_eq!(state.phase(), Phase::ModelLoading);
        assert_eq!(
            state.admit(OperationKind::Index).unwrap_err(),
            Rejected::Conflict { active: load.id }
        );
        assert!(!state.controls().can_index);
    }

    #[test]
    fn search_waits_for_a_reload_to_finish() {
        let mut state = loaded("a");
        state.commit_generation("/docs".into(), baseline("a")).unwrap();
        let load = state.admit(OperationKind::Load).unwrap();

        assert!(!state.controls().can_search);
        assert_eq!(
            state.admit(OperationKind::Search).unwrap_err(),
            Rejected::Conflict { active: load.id }
        );
        // Downloads do not touch the loaded model.
        assert!(state.admit(OperationKind::Download).is_ok());

        state.finish(load.id);
        assert!(state.controls().can_search);
        assert!(state.admit(OperationKind::Search).is_ok());
    }

    #[test]
    fn model_switch_is_blocked_by_index_and_search() {
        let mut state = loaded("a");
        let search = state.admit(OperationKind::Search).unwrap();
        assert!(!state.controls().can_switch_model);
        assert_eq!(
            state.admit(OperationKind::Load).unwrap_err(),
            Rejected::Conflict { active: search.id }
        );
        state.finish(search.id);
        assert!(state.admit(OperationKind::Load).is_ok());
    }

    #[test]
    fn switching_to_another_model_drops_the_index() {
        let mut state = loaded("a");
        state.commit_generation("/docs".into(), baseline("a")).unwrap();
        assert!(state.controls().can_search);

        assert!(state.switch_model("a".into(), Arc::new(Fixed("a"))));
        assert!(state.index().is_some());

        assert!(!state.switch_model("b".into(), Arc::new(Fixed("b"))));
        assert!(state.index().is_none());
        assert_eq!(state.model_id(), Some("b"));
        assert!(!state.controls().can_search);
    }

    #[test]
    fn commit_rejects_foreign_model() {
        let mut state = loaded("b");
        let err = state
            .commit_generation("/docs".into(), baseline("a"))
            .unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
        assert!(state.index().is_none());
    }

    #[test]
    fn clear_index_is_total() {
        let mut state = loaded("a");
        state.commit_generation("/docs".into(), baseline("a")).unwrap();
        state.clear_index();

        let status = state.status(None);
        assert_eq!(status.chunks, 0);
        assert!(!status.bm25);
        assert_eq!(status.generation, None);
        assert_eq!(status.folder, Some(PathBuf::from("/docs")));
    }

    #[test]
    fn shutdown_rejects_everything() {
        let mut state = loaded("a");
        let download = state.admit(OperationKind::Download).unwrap();
        let cancelled = state.begin_shutdown();

        assert_eq!(cancelled, vec![download.id]);
        assert!(download.cancel.is_cancelled());
        assert_eq!(state.phase(), Phase::ShuttingDown);
        assert_eq!(
            state.admit(OperationKind::Search).unwrap_err(),
            Rejected::ShuttingDown
        );
        let controls = state.controls();
        assert!(!controls.can_index && !controls.can_search && !controls.can_clear_cache);
    }
}
