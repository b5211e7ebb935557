//! The operation coordinator.
//!
//! One tokio task owns the [`RuntimeState`]. Callers talk to it through a
//! cloneable [`CoordinatorHandle`]; admission answers come back on a
//! oneshot, everything else arrives later as a [`Signal`]. Workers run on
//! the blocking pool (downloads on the async runtime), compute their result
//! without touching the state, and report back over a channel. The loop
//! then applies the result through one state transition.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    cache::CacheStore,
    config::Settings,
    download::{DownloadPlan, DownloadReport, run_downloads},
    embedding::{Embedder, ModelLoader},
    error::{Error, ErrorClass, Result},
    extract::{Extractor, OcrEngine},
    hybrid::{self, SearchQuery, SearchResponse, SearchSettings},
    indexer::{
        Baseline, IndexOutcome, IndexReport, IndexRequest, IndexSettings, Indexer,
    },
    operation::{OperationId, OperationKind, Rejected},
    runtime::{LastOperation, OutcomeStatus, RuntimeState, StatusReport},
    vector::VectorIndexFactory,
};

const COMMAND_BUFFER: usize = 32;

/// The collaborators workers call into.
pub struct Services {
    pub loader: Arc<dyn ModelLoader>,
    pub extractor: Arc<dyn Extractor>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub vectors: VectorIndexFactory,
    pub cache: CacheStore,
    /// How to run model downloads; downloads are refused without one.
    pub download: Option<DownloadPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorConfig {
    pub index: IndexSettings,
    pub search: SearchSettings,
    /// How long shutdown waits for each operation to stop.
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for CoordinatorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            index: IndexSettings::from(settings),
            search: SearchSettings::from(settings),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// What a successful operation produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    ModelLoaded { model_id: String, index_kept: bool },
    /// An index pass was committed. `report.cancelled` marks a pass that
    /// stopped early and committed only the files it finished.
    Indexed { generation: u64, report: IndexReport },
    Searched(SearchResponse),
    Downloaded(DownloadReport),
}

/// Progress and results, in the order they happened.
#[derive(Debug, Clone)]
pub enum Signal {
    Progress {
        op: OperationId,
        current: usize,
        total: usize,
        label: String,
    },
    Completed {
        op: OperationId,
        outcome: Outcome,
    },
    Failed {
        op: OperationId,
        error: String,
        debug: String,
    },
    Cancelled {
        op: OperationId,
    },
}

impl Signal {
    pub fn op(&self) -> OperationId {
        match self {
            Signal::Progress { op, .. }
            | Signal::Completed { op, .. }
            | Signal::Failed { op, .. }
            | Signal::Cancelled { op } => *op,
        }
    }

    /// Whether this is the last signal of its operation.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Progress { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Operations that stopped within the timeout.
    pub stopped: Vec<OperationId>,
    /// Operations that did not respond and were left behind.
    pub abandoned: Vec<OperationId>,
}

enum Command {
    LoadModel {
        model_id: String,
        reply: oneshot::Sender<Result<OperationId>>,
    },
    Index {
        request: IndexRequest,
        reply: oneshot::Sender<Result<OperationId>>,
    },
    Search {
        query: SearchQuery,
        reply: oneshot::Sender<Result<OperationId>>,
    },
    Download {
        models: Vec<String>,
        reply: oneshot::Sender<Result<OperationId>>,
    },
    Cancel {
        kind: OperationKind,
        reply: oneshot::Sender<Option<OperationId>>,
    },
    ClearCache {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
}

enum WorkerResult {
    Loaded {
        model_id: String,
        result: Result<Arc<dyn Embedder>>,
    },
    Indexed(Result<IndexOutcome>),
    Searched(Result<SearchResponse>),
    Downloaded(Result<DownloadReport>),
    Panicked(String),
}

struct Finished {
    id: OperationId,
    result: WorkerResult,
}

/// Sends commands to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

/// Start the coordinator on the current tokio runtime.
pub fn spawn(
    services: Services,
    config: CoordinatorConfig,
) -> (CoordinatorHandle, mpsc::UnboundedReceiver<Signal>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    let actor = Actor {
        state: RuntimeState::new(),
        services: Arc::new(services),
        config,
        signals: signal_tx,
        reports: report_tx,
        tasks: HashMap::new(),
    };
    tokio::spawn(actor.run(command_rx, report_rx));

    (
        CoordinatorHandle {
            commands: command_tx,
        },
        signal_rx,
    )
}

/// Run `future` to completion on a fresh multi-threaded runtime.
///
/// Once it returns, blocking work still in flight gets at most `grace` to
/// finish before the runtime is torn down. An abandoned load or index worker
/// cannot be interrupted mid-file, so dropping the runtime normally would
/// wait for it.
pub fn block_on<F: Future>(grace: Duration, future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Load `model_id` and make it current once loaded.
    pub async fn load_model(&self, model_id: impl Into<String>) -> Result<OperationId> {
        let model_id = model_id.into();
        self.request(|reply| Command::LoadModel { model_id, reply })
            .await?
    }

    pub async fn index(&self, request: IndexRequest) -> Result<OperationId> {
        self.request(|reply| Command::Index { request, reply }).await?
    }

    pub async fn search(&self, query: SearchQuery) -> Result<OperationId> {
        self.request(|reply| Command::Search { query, reply }).await?
    }

    pub async fn download(&self, models: Vec<String>) -> Result<OperationId> {
        self.request(|reply| Command::Download { models, reply })
            .await?
    }

    /// Request cancellation of the running operation of `kind`, if any.
    pub async fn cancel(&self, kind: OperationKind) -> Result<Option<OperationId>> {
        self.request(|reply| Command::Cancel { kind, reply }).await
    }

    /// Delete every cache entry and drop the in-memory index.
    pub async fn clear_cache(&self) -> Result<()> {
        self.request(|reply| Command::ClearCache { reply }).await?
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Cancel everything, wait a bounded time for it, and stop the loop.
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Receive signals until the terminal one for `op`.
///
/// Progress of `op` is passed to `progress`; signals of other operations
/// are discarded. Returns `None` if the coordinator stopped first.
pub async fn wait_for(
    signals: &mut mpsc::UnboundedReceiver<Signal>,
    op: OperationId,
    mut progress: impl FnMut(usize, usize, &str),
) -> Option<Signal> {
    while let Some(signal) = signals.recv().await {
        if signal.op() != op {
            continue;
        }
        match signal {
            Signal::Progress {
                current,
                total,
                ref label,
                ..
            } => progress(current, total, label),
            terminal => return Some(terminal),
        }
    }
    None
}

struct Actor {
    state: RuntimeState,
    services: Arc<Services>,
    config: CoordinatorConfig,
    signals: mpsc::UnboundedSender<Signal>,
    reports: mpsc::UnboundedSender<Finished>,
    tasks: HashMap<OperationId, JoinHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Finished>,
    ) {
        tracing::debug!("coordinator started");
        loop {
            tokio::select! {
                Some(finished) = reports.recv() => self.complete(finished),
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let report = self.shutdown(&mut reports).await;
                        let _ = reply.send(report);
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown(&mut reports).await;
                        break;
                    }
                },
            }
        }
        tracing::debug!("coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::LoadModel { model_id, reply } => {
                let _ = reply.send(self.start_load(model_id));
            }
            Command::Index { request, reply } => {
                let _ = reply.send(self.start_index(request));
            }
            Command::Search { query, reply } => {
                let _ = reply.send(self.start_search(query));
            }
            Command::Download { models, reply } => {
                let _ = reply.send(self.start_download(models));
            }
            Command::Cancel { kind, reply } => {
                let cancelled = self.state.cancel(kind);
                if let Some(id) = cancelled {
                    tracing::info!(op = %id, "cancellation requested");
                }
                let _ = reply.send(cancelled);
            }
            Command::ClearCache { reply } => {
                let _ = reply.send(self.clear_cache().await);
            }
            Command::Status { reply } => {
                let cache = self.services.cache.clone();
                let usage = tokio::task::spawn_blocking(move || cache.usage())
                    .await
                    .ok()
                    .and_then(|usage| usage.ok());
                let _ = reply.send(self.state.status(usage));
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn start_load(&mut self, model_id: String) -> Result<OperationId> {
        let op = self.state.admit(OperationKind::Load)?;
        let services = self.services.clone();
        self.spawn_blocking(op.id, move || WorkerResult::Loaded {
            result: services.loader.load(&model_id),
            model_id,
        });
        Ok(op.id)
    }

    fn start_index(&mut self, request: IndexRequest) -> Result<OperationId> {
        let op = self.state.admit(OperationKind::Index)?;
        let Some(embedder) = self.state.embedder().cloned() else {
            self.state.finish(op.id);
            return Err(Rejected::NoModel.into());
        };
        let live = self.state.index().cloned();
        let services = self.services.clone();
        let settings = self.config.index;
        let signals = self.signals.clone();
        let cancel = op.cancel.clone();
        let id = op.id;

        self.spawn_blocking(id, move || {
            let indexer = Indexer {
                extractor: services.extractor.as_ref(),
                embedder: embedder.as_ref(),
                ocr: services.ocr.as_deref(),
                cache: &services.cache,
                vectors: services.vectors,
                settings,
            };
            WorkerResult::Indexed(indexer.run(
                &request,
                live.as_ref(),
                &cancel,
                &mut |p| {
                    let _ = signals.send(Signal::Progress {
                        op: id,
                        current: p.current,
                        total: p.total,
                        label: p.file,
                    });
                },
            ))
        });
        Ok(id)
    }

    fn start_search(&mut self, query: SearchQuery) -> Result<OperationId> {
        let op = self.state.admit(OperationKind::Search)?;
        // The worker reads the generation committed at admission.
        let store = self.state.index().map(|i| i.store.clone());
        let embedder = self.state.embedder().cloned();
        let settings = self.config.search;

        self.spawn_blocking(op.id, move || {
            WorkerResult::Searched(hybrid::search(
                store.as_deref().zip(embedder.as_deref()),
                &query,
                &settings,
            ))
        });
        Ok(op.id)
    }

    fn start_download(&mut self, models: Vec<String>) -> Result<OperationId> {
        let Some(plan) = self.services.download.clone() else {
            return Err(Error::Config("model downloads are not configured".into()));
        };
        let op = self.state.admit(OperationKind::Download)?;
        let signals = self.signals.clone();
        let cancel = op.cancel.clone();
        let id = op.id;

        self.spawn_async(id, async move {
            let mut progress = |current: usize, total: usize, label: &str| {
                let _ = signals.send(Signal::Progress {
                    op: id,
                    current,
                    total,
                    label: label.to_string(),
                });
            };
            WorkerResult::Downloaded(
                run_downloads(&plan, &models, &cancel, &mut progress).await,
            )
        });
        Ok(id)
    }

    async fn clear_cache(&mut self) -> Result<()> {
        if self.state.is_shutting_down() {
            return Err(Rejected::ShuttingDown.into());
        }
        if let Some(op) = self.state.operations().get(OperationKind::Index) {
            return Err(Rejected::Conflict { active: op.id }.into());
        }
        if let Some(id) = self.state.cancel(OperationKind::Search) {
            tracing::debug!(op = %id, "search result will be discarded");
        }

        let cache = self.services.cache.clone();
        tokio::task::spawn_blocking(move || cache.clear_all())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.state.clear_index();
        tracing::info!(root = %self.services.cache.root().display(), "cache cleared");
        Ok(())
    }

    fn spawn_blocking<F>(&mut self, id: OperationId, work: F)
    where
        F: FnOnce() -> WorkerResult + Send + 'static,
    {
        let span = tracing::info_span!("op", id = %id, kind = %id.kind);
        let reports = self.reports.clone();
        let handle = tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || span.in_scope(work)).await
            {
                Ok(result) => result,
                Err(e) => WorkerResult::Panicked(e.to_string()),
            };
            let _ = reports.send(Finished { id, result });
        });
        self.tasks.insert(id, handle);
    }

    fn spawn_async<F>(&mut self, id: OperationId, work: F)
    where
        F: Future<Output = WorkerResult> + Send + 'static,
    {
        let span = tracing::info_span!("op", id = %id, kind = %id.kind);
        let reports = self.reports.clone();
        let handle = tokio::spawn(async move {
            let result = work.instrument(span).await;
            let _ = reports.send(Finished { id, result });
        });
        self.tasks.insert(id, handle);
    }

    /// Apply a worker's result to the state and emit its terminal signal.
    fn complete(&mut self, Finished { id, result }: Finished) {
        self.tasks.remove(&id);
        let Some(op) = self.state.finish(id) else {
            tracing::warn!(op = %id, "result for an unknown operation");
            return;
        };
        let cancelled = op.cancel.is_cancelled();

        let (signal, status, summary) = match result {
            WorkerResult::Loaded { model_id, result } => match result {
                Ok(_) if cancelled => cancelled_signal(id),
                Ok(embedder) => {
                    let index_kept = self.state.switch_model(model_id.clone(), embedder);
                    tracing::info!(model = %model_id, index_kept, "model loaded");
                    let summary = format!("loaded {model_id}");
                    (
                        Signal::Completed {
                            op: id,
                            outcome: Outcome::ModelLoaded {
                                model_id,
                                index_kept,
                            },
                        },
                        OutcomeStatus::Completed,
                        summary,
                    )
                }
                Err(e) => failed_signal(id, &e),
            },
            WorkerResult::Indexed(Ok(outcome)) => self.commit_index(id, outcome),
            WorkerResult::Indexed(Err(e)) => failed_signal(id, &e),
            WorkerResult::Searched(_) if cancelled => cancelled_signal(id),
            WorkerResult::Searched(Ok(response)) => {
                let summary = match &response {
                    SearchResponse::Hits { hits, .. } => format!("{} hits", hits.len()),
                    SearchResponse::NoIndex => "no index".to_string(),
                    SearchResponse::QueryTooShort { .. } => "query too short".to_string(),
                };
                (
                    Signal::Completed {
                        op: id,
                        outcome: Outcome::Searched(response),
                    },
                    OutcomeStatus::Completed,
                    summary,
                )
            }
            WorkerResult::Searched(Err(e)) => failed_signal(id, &e),
            WorkerResult::Downloaded(Ok(report)) if report.cancelled => cancelled_signal(id),
            WorkerResult::Downloaded(Ok(report)) => {
                let status = if report.failed.is_empty() {
                    OutcomeStatus::Completed
                } else {
                    OutcomeStatus::Partial
                };
                let summary = format!(
                    "{} downloaded, {} failed",
                    report.downloaded.len(),
                    report.failed.len()
                );
                (
                    Signal::Completed {
                        op: id,
                        outcome: Outcome::Downloaded(report),
                    },
                    status,
                    summary,
                )
            }
            WorkerResult::Downloaded(Err(e)) => failed_signal(id, &e),
            WorkerResult::Panicked(message) => {
                tracing::error!(op = %id, %message, "worker panicked");
                (
                    Signal::Failed {
                        op: id,
                        error: "worker panicked".to_string(),
                        debug: message.clone(),
                    },
                    OutcomeStatus::Failed,
                    message,
                )
            }
        };

        self.state.record(LastOperation {
            id,
            status,
            summary,
            elapsed: op.started.elapsed(),
        });
        let _ = self.signals.send(signal);
    }

    fn commit_index(
        &mut self,
        id: OperationId,
        outcome: IndexOutcome,
    ) -> (Signal, OutcomeStatus, String) {
        let IndexOutcome {
            key,
            store,
            manifest,
            report,
        } = outcome;
        let generation = store.generation();
        let folder = manifest.folder.clone();

        if let Err(e) = self.state.commit_generation(
            folder,
            Baseline {
                key,
                store,
                manifest,
            },
        ) {
            return failed_signal(id, &e);
        }

        let status = if report.cancelled {
            OutcomeStatus::Cancelled
        } else if report.is_partial() {
            OutcomeStatus::Partial
        } else {
            OutcomeStatus::Completed
        };
        let summary = format!(
            "{} indexed, {} cached, {} removed, {} failed",
            report.indexed,
            report.cached,
            report.removed,
            report.failures.len()
        );
        (
            Signal::Completed {
                op: id,
                outcome: Outcome::Indexed { generation, report },
            },
            status,
            summary,
        )
    }

    async fn shutdown(
        &mut self,
        reports: &mut mpsc::UnboundedReceiver<Finished>,
    ) -> ShutdownReport {
        let cancelled = self.state.begin_shutdown();
        tracing::info!(active = cancelled.len(), "shutting down");

        let mut tasks: Vec<_> = self.tasks.drain().collect();
        tasks.sort_by_key(|(id, _)| *id);

        let mut report = ShutdownReport::default();
        for (id, mut handle) in tasks {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
                Ok(_) => report.stopped.push(id),
                Err(_) => {
                    tracing::warn!(op = %id, "operation ignored cancellation, abandoning it");
                    handle.abort();
                    report.abandoned.push(id);
                }
            }
        }

        while let Ok(finished) = reports.try_recv() {
            self.complete(finished);
        }
        report
    }
}

fn cancelled_signal(id: OperationId) -> (Signal, OutcomeStatus, String) {
    tracing::info!(op = %id, "operation cancelled");
    (
        Signal::Cancelled { op: id },
        OutcomeStatus::Cancelled,
        "cancelled".to_string(),
    )
}

fn failed_signal(id: OperationId, error: &Error) -> (Signal, OutcomeStatus, String) {
    if error.class() == ErrorClass::ConsistencyViolation {
        tracing::error!(op = %id, %error, "internal consistency violation");
    } else {
        tracing::warn!(op = %id, %error, "operation failed");
    }
    (
        Signal::Failed {
            op: id,
            error: error.to_string(),
            debug: format!("{error:?}"),
        },
        OutcomeStatus::Failed,
        error.to_string(),
    )
}
