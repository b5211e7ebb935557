use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use kdam::{Bar, BarExt, tqdm};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ModelAction};
use docseek::{
    CacheStore, DataDir, DocumentExtractor, FlatIndex, ModelManager, Settings,
    config::MODEL_ENV_VAR,
    coordinator::{
        self, CoordinatorConfig, CoordinatorHandle, Outcome, Services, Signal,
    },
    diagnostics,
    download::{self, DownloadPlan, DownloadReport},
    error::{self, Error},
    hybrid::{SearchFilters, SearchQuery, SearchResponse},
    indexer::{IndexReport, IndexRequest},
    model_manager::DEFAULT_MODEL_ID,
    operation::OperationId,
    runtime::StatusReport,
    text_util::extract_snippet,
};

const LOG_ENV_VAR: &str = "DOCSEEK_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let mut settings = Settings::load(&data_dir.settings_file());
    settings.apply_overrides(cli.model.as_deref());
    settings.validate()?;

    // Workers abandoned at shutdown must not hold up process exit.
    coordinator::block_on(settings.shutdown_timeout(), run(cli, data_dir, settings))?
}

async fn run(cli: Cli, data_dir: DataDir, settings: Settings) -> error::Result<()> {
    let settings_path = data_dir.settings_file();
    match cli.command {
        Command::Completions(args) => args.generate(),
        Command::FetchModel(args) => {
            let snapshot = download::fetch_model(&args.model, &args.dest)?;
            println!("{}", snapshot.display());
        }
        Command::Model { action } => {
            cmd_model(action, &settings_path, &settings, cli.model.as_deref())?;
        }
        Command::ClearCache => {
            let session = Session::start(&data_dir, &settings)?;
            let result = session.handle.clear_cache().await;
            session.close().await;
            result?;
            eprintln!("Cache cleared.");
        }
        Command::Download(args) => {
            let models = if args.models.is_empty() {
                vec![settings.model.clone()]
            } else {
                args.models
            };
            let mut session = Session::start(&data_dir, &settings)?;
            let result = session.download(models).await;
            session.close().await;
            print_download(&result?);
        }
        Command::Index(args) => {
            let mut session = Session::start(&data_dir, &settings)?;
            let request = IndexRequest {
                folder: args.folder.clone(),
                recursive: args.recursive || settings.recursive,
                passwords: args.passwords.into_iter().collect(),
            };
            let result = async {
                session.load_model(&settings.model).await?;
                session.index(request).await
            }
            .await;
            session.close().await;

            let report = result?;
            print_index_report(&report);
            remember_folder(&settings_path, &args.folder);
        }
        Command::Search(args) => {
            let folder = match args.folder.clone() {
                Some(folder) => folder,
                None => settings.recent_folders.first().cloned().ok_or_else(|| {
                    Error::Config("no folder given and none indexed yet".into())
                })?,
            };
            let query = SearchQuery {
                text: args.query.clone(),
                k: args.count,
                hybrid: settings.hybrid && !args.no_hybrid,
                filters: SearchFilters {
                    extensions: args.extensions.clone(),
                    name: args.name.clone(),
                    path: args.path.clone(),
                },
                sort: args.sort.into(),
            };

            let mut session = Session::start(&data_dir, &settings)?;
            let result = async {
                session.load_model(&settings.model).await?;
                session.quiet = true;
                session
                    .index(IndexRequest {
                        folder,
                        recursive: settings.recursive,
                        passwords: HashMap::new(),
                    })
                    .await?;
                session.search(query).await
            }
            .await;
            session.close().await;

            let response = result?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_search(&response, &args.query);
            }
        }
        Command::Status(args) => {
            let mut session = Session::start(&data_dir, &settings)?;
            let result = async {
                if let Some(folder) = args.folder.clone() {
                    session.open_quietly(&settings, folder).await?;
                }
                session.handle.status().await
            }
            .await;
            session.close().await;

            let status = result?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status, &data_dir, &settings);
            }
        }
        Command::Diagnostics(args) => {
            let mut session = Session::start(&data_dir, &settings)?;
            let result = async {
                if let Some(folder) = args.folder.clone() {
                    session.open_quietly(&settings, folder).await?;
                }
                session.handle.status().await
            }
            .await;
            session.close().await;

            let status = result?;
            let items = diagnostics::export(
                &args.output,
                &diagnostics::Bundle {
                    environment: &diagnostics::Environment::collect(&data_dir),
                    status: &status,
                    settings_file: &settings_path,
                    cache: &CacheStore::new(data_dir.cache_root()),
                },
            )?;
            for item in items.iter().filter(|i| !i.included) {
                eprintln!(
                    "Skipped {}: {}",
                    item.name,
                    item.error.as_deref().unwrap_or("unavailable")
                );
            }
            println!("Wrote {}", args.output.display());
        }
        Command::Shell(args) => {
            let mut session = Session::start(&data_dir, &settings)?;
            let result = run_shell(&mut session, &settings, args).await;
            session.close().await;
            result?;
        }
    }

    Ok(())
}

/// A running coordinator plus the receiving end of its signals.
struct Session {
    handle: CoordinatorHandle,
    signals: mpsc::UnboundedReceiver<Signal>,
    /// Suppress progress bars and summaries for housekeeping passes.
    quiet: bool,
}

impl Session {
    fn start(data_dir: &DataDir, settings: &Settings) -> error::Result<Self> {
        let models_dir = data_dir.models_dir()?;
        let services = Services {
            loader: Arc::new(ModelManager::new(Some(models_dir.clone()))),
            extractor: Arc::new(DocumentExtractor),
            ocr: None,
            vectors: FlatIndex::boxed,
            cache: CacheStore::new(data_dir.cache_root()),
            download: Some(DownloadPlan::current_exe(
                models_dir,
                settings.download_poll(),
            )?),
        };
        let (handle, signals) =
            coordinator::spawn(services, CoordinatorConfig::from(settings));
        Ok(Self {
            handle,
            signals,
            quiet: false,
        })
    }

    /// Wait for the terminal signal of `op`, drawing progress and turning
    /// Ctrl-C into a cancellation request.
    async fn wait(&mut self, op: OperationId, desc: &str) -> error::Result<Signal> {
        let mut bar: Option<Bar> = None;
        let mut interrupted = false;
        let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

        loop {
            tokio::select! {
                signal = self.signals.recv() => {
                    let Some(signal) = signal else {
                        return Err(Error::Stopped);
                    };
                    if signal.op() != op {
                        continue;
                    }
                    match signal {
                        Signal::Progress { current, total, label, .. } => {
                            if self.quiet || total == 0 {
                                continue;
                            }
                            let bar = bar.get_or_insert_with(|| {
                                tqdm!(total = total, desc = desc.to_string(), unit = "item")
                            });
                            bar.set_postfix(label);
                            let _ = bar.update_to(current);
                        }
                        terminal => {
                            if let Some(mut bar) = bar {
                                let _ = bar.refresh();
                                eprintln!();
                            }
                            return Ok(terminal);
                        }
                    }
                }
                _ = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    eprintln!("Cancelling {op}...");
                    self.handle.cancel(op.kind).await?;
                }
            }
        }
    }

    async fn load_model(&mut self, model_id: &str) -> error::Result<()> {
        let op = self.handle.load_model(model_id).await?;
        match self.wait(op, "Loading model").await? {
            Signal::Completed { .. } => Ok(()),
            Signal::Failed { error, .. } => Err(Error::Model(error)),
            _ => Err(Error::Model(format!("loading {model_id} was cancelled"))),
        }
    }

    /// Load the configured model and bring `folder` in from the cache
    /// without drawing progress.
    async fn open_quietly(
        &mut self,
        settings: &Settings,
        folder: PathBuf,
    ) -> error::Result<()> {
        self.load_model(&settings.model).await?;
        self.quiet = true;
        self.index(IndexRequest {
            folder,
            recursive: settings.recursive,
            passwords: HashMap::new(),
        })
        .await?;
        Ok(())
    }

    async fn index(&mut self, request: IndexRequest) -> error::Result<IndexReport> {
        let op = self.handle.index(request).await?;
        match self.wait(op, "Indexing").await? {
            Signal::Completed {
                outcome: Outcome::Indexed { report, .. },
                ..
            } => Ok(report),
            Signal::Failed {
                error,
                debug: detail,
                ..
            } => {
                tracing::debug!(%detail, "index failed");
                Err(failed(op, error))
            }
            other => Err(unexpected(op, &other)),
        }
    }

    async fn search(&mut self, query: SearchQuery) -> error::Result<SearchResponse> {
        let op = self.handle.search(query).await?;
        match self.wait(op, "Searching").await? {
            Signal::Completed {
                outcome: Outcome::Searched(response),
                ..
            } => Ok(response),
            Signal::Failed { error, .. } => Err(failed(op, error)),
            other => Err(unexpected(op, &other)),
        }
    }

    async fn download(&mut self, models: Vec<String>) -> error::Result<DownloadReport> {
        let op = self.handle.download(models).await?;
        match self.wait(op, "Downloading").await? {
            Signal::Completed {
                outcome: Outcome::Downloaded(report),
                ..
            } => Ok(report),
            Signal::Cancelled { .. } => Err(Error::Download("cancelled".into())),
            Signal::Failed { error, .. } => Err(Error::Download(error)),
            other => Err(unexpected(op, &other)),
        }
    }

    async fn close(self) {
        match self.handle.shutdown().await {
            Ok(report) if !report.abandoned.is_empty() => {
                tracing::warn!(abandoned = ?report.abandoned, "some operations did not stop");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "coordinator already stopped"),
        }
    }
}

fn failed(op: OperationId, message: String) -> Error {
    Error::Failed {
        op: op.to_string(),
        message,
    }
}

fn unexpected(op: OperationId, signal: &Signal) -> Error {
    Error::Consistency(format!("{op} ended with {signal:?}"))
}

async fn run_shell(
    session: &mut Session,
    settings: &Settings,
    args: cli::ShellArgs,
) -> error::Result<()> {
    session.load_model(&settings.model).await?;
    let request = IndexRequest {
        folder: args.folder.clone(),
        recursive: args.recursive || settings.recursive,
        passwords: HashMap::new(),
    };
    print_index_report(&session.index(request.clone()).await?);

    eprintln!("Type a query, or :status, :reindex, :clear, :quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            ":q" | ":quit" | ":exit" => break,
            ":status" => {
                let status = session.handle.status().await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            ":reindex" => match session.index(request.clone()).await {
                Ok(report) => print_index_report(&report),
                Err(e) => eprintln!("Error: {e}"),
            },
            ":clear" => match session.handle.clear_cache().await {
                Ok(()) => eprintln!("Cache cleared."),
                Err(e) => eprintln!("Error: {e}"),
            },
            query => {
                let mut search = SearchQuery::new(query);
                search.hybrid = settings.hybrid;
                match session.search(search).await {
                    Ok(response) => print_search(&response, query),
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
        }
    }
    Ok(())
}

fn cmd_model(
    action: ModelAction,
    settings_path: &Path,
    resolved: &Settings,
    cli_model: Option<&str>,
) -> error::Result<()> {
    match action {
        ModelAction::Show { json } => {
            let stored = Settings::load(settings_path);
            let source = if cli_model.is_some() {
                "cli"
            } else if std::env::var(MODEL_ENV_VAR).is_ok_and(|m| !m.trim().is_empty()) {
                "env"
            } else if stored.model != DEFAULT_MODEL_ID {
                "settings"
            } else {
                "default"
            };
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "model": resolved.model, "source": source })
                );
            } else {
                println!("{} ({source})", resolved.model);
            }
        }
        ModelAction::Set { model } => {
            let mut stored = Settings::load(settings_path);
            stored.model = model;
            stored.save(settings_path)?;
            eprintln!("Default model set to {}.", stored.model);
        }
        ModelAction::Clear => {
            let mut stored = Settings::load(settings_path);
            stored.model = DEFAULT_MODEL_ID.to_string();
            stored.save(settings_path)?;
            eprintln!("Default model reset to {DEFAULT_MODEL_ID}.");
        }
    }
    Ok(())
}

/// Record `folder` in the settings file without persisting CLI overrides.
fn remember_folder(settings_path: &Path, folder: &Path) {
    let folder = folder
        .canonicalize()
        .unwrap_or_else(|_| folder.to_path_buf());
    let mut stored = Settings::load(settings_path);
    stored.remember_folder(&folder);
    if let Err(e) = stored.save(settings_path) {
        tracing::warn!(error = %e, "could not update recent folders");
    }
}

fn print_index_report(report: &IndexReport) {
    if report.cancelled {
        eprintln!("Indexing cancelled; finished files were kept.");
    }
    if report.unchanged {
        eprintln!("Index is up to date ({} chunks).", report.chunks);
    } else {
        eprintln!(
            "Indexed {} files, reused {}, removed {} ({} chunks).",
            report.indexed, report.cached, report.removed, report.chunks
        );
    }
    if report.recovered_corrupt_cache {
        eprintln!("A corrupt cache entry was discarded and rebuilt.");
    }
    if !report.persisted && !report.unchanged {
        eprintln!("Warning: the index could not be saved and will be rebuilt next time.");
    }
    if !report.failures.is_empty() {
        eprintln!("{} files could not be indexed:", report.failures.len());
        for failure in &report.failures {
            eprintln!("  {failure}");
        }
    }
}

fn print_search(response: &SearchResponse, query: &str) {
    match response {
        SearchResponse::NoIndex => {
            println!("Nothing is indexed yet. Run `docseek index <folder>` first.");
        }
        SearchResponse::QueryTooShort { min_chars } => {
            println!("Query must be at least {min_chars} characters.");
        }
        SearchResponse::Hits { hits, .. } if hits.is_empty() => {
            println!("No results found.");
        }
        SearchResponse::Hits { hits, .. } => {
            for (i, hit) in hits.iter().enumerate() {
                let b = &hit.breakdown;
                println!(
                    "{}. {} #{}  (score {:.3}; vector {:.3}{}, bm25 {:.3})",
                    i + 1,
                    hit.file,
                    hit.chunk_index,
                    hit.score,
                    b.vector_norm,
                    b.vector_rank.map(|r| format!(" rank {r}")).unwrap_or_default(),
                    b.bm25_norm
                );
                println!("   {}", hit.path.display());
                if let Some((snippet, _)) = extract_snippet(&hit.text, query) {
                    for line in snippet.lines() {
                        println!("   | {line}");
                    }
                }
            }
        }
    }
}

fn print_status(status: &StatusReport, data_dir: &DataDir, settings: &Settings) {
    println!("Data directory: {}", data_dir.root().display());
    println!(
        "Model: {}",
        status.model.as_deref().unwrap_or(settings.model.as_str())
    );
    if let Some(folder) = &status.folder {
        println!("Folder: {}", folder.display());
        println!(
            "Index: generation {}, {} files, {} chunks, bm25 {}",
            status.generation.unwrap_or(0),
            status.files,
            status.chunks,
            if status.bm25 { "ready" } else { "absent" }
        );
        for file in &status.failed_files {
            println!("  not indexed: {file}");
        }
    }
    if let Some(cache) = &status.cache {
        println!(
            "Cache: {} entries, {:.1} MiB",
            cache.entries,
            cache.bytes as f64 / (1024.0 * 1024.0)
        );
    }
    if !settings.recent_folders.is_empty() {
        println!("Recent folders:");
        for folder in &settings.recent_folders {
            println!("  {}", folder.display());
        }
    }
}

fn print_download(report: &DownloadReport) {
    for model in &report.downloaded {
        eprintln!("Downloaded {model}.");
    }
    for (model, reason) in &report.failed {
        eprintln!("Failed to download {model}: {reason}");
    }
}
