//! Model downloads, each run in a child process so it can be killed.
//!
//! The parent re-executes itself with the hidden `fetch-model` subcommand,
//! polls the child and kills it when the operation is cancelled.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde::Serialize;
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    model_manager::local_snapshot,
};

/// Overrides the executable used for downloads.
pub const FETCH_EXE_ENV_VAR: &str = "DOCSEEK_FETCH_EXE";

/// How to start one download process.
///
/// The child is run as `program leading_args... <model> --dest <models_dir>`.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub program: PathBuf,
    pub leading_args: Vec<OsString>,
    pub models_dir: PathBuf,
    pub poll: Duration,
}

impl DownloadPlan {
    /// Run downloads through this executable's `fetch-model` subcommand.
    pub fn current_exe(models_dir: PathBuf, poll: Duration) -> Result<Self> {
        let program = match std::env::var_os(FETCH_EXE_ENV_VAR) {
            Some(exe) if !exe.is_empty() => PathBuf::from(exe),
            _ => std::env::current_exe()?,
        };
        Ok(Self {
            program,
            leading_args: vec!["fetch-model".into()],
            models_dir,
            poll,
        })
    }

    fn command(&self, model_id: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(model_id)
            .arg("--dest")
            .arg(&self.models_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub downloaded: Vec<String>,
    /// Models that failed, with the child's error output.
    pub failed: Vec<(String, String)>,
    pub cancelled: bool,
}

enum ChildOutcome {
    Success,
    Failed(String),
    Cancelled,
}

/// Download `models` one after another.
///
/// A failed model does not stop the remaining ones. Cancellation is noticed
/// within one poll interval; the running child is killed and the remaining
/// models are skipped.
pub async fn run_downloads(
    plan: &DownloadPlan,
    models: &[String],
    cancel: &CancellationToken,
    progress: &mut (dyn FnMut(usize, usize, &str) + Send),
) -> Result<DownloadReport> {
    std::fs::create_dir_all(&plan.models_dir)?;
    let mut report = DownloadReport::default();

    for (i, model) in models.iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        progress(i, models.len(), model);
        tracing::info!(model = %model, "downloading model");

        match run_child(plan, model, cancel).await? {
            ChildOutcome::Success => report.downloaded.push(model.clone()),
            ChildOutcome::Failed(reason) => {
                tracing::warn!(model = %model, %reason, "download failed");
                report.failed.push((model.clone(), reason));
            }
            ChildOutcome::Cancelled => {
                report.cancelled = true;
                break;
            }
        }
    }
    if !report.cancelled {
        progress(models.len(), models.len(), "");
    }
    Ok(report)
}

async fn run_child(
    plan: &DownloadPlan,
    model: &str,
    cancel: &CancellationToken,
) -> Result<ChildOutcome> {
    let mut child = plan.command(model).spawn().map_err(|e| {
        Error::Download(format!("could not start {}: {e}", plan.program.display()))
    })?;

    let stderr = child.stderr.take();
    let collector = tokio::spawn(async move {
        let mut out = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut out).await;
        }
        out
    });

    loop {
        if let Some(status) = child.try_wait()? {
            let output = collector.await.unwrap_or_default();
            if status.success() {
                return Ok(ChildOutcome::Success);
            }
            let detail = output.trim();
            return Ok(ChildOutcome::Failed(if detail.is_empty() {
                format!("exited with {status}")
            } else {
                detail.to_string()
            }));
        }
        if cancel.is_cancelled() {
            tracing::info!(model, "killing download");
            child.start_kill()?;
            child.wait().await?;
            collector.abort();
            return Ok(ChildOutcome::Cancelled);
        }
        tokio::time::sleep(plan.poll).await;
    }
}

/// Fetch every file of `model_id` from the HuggingFace Hub into `dest`.
///
/// Runs in the `fetch-model` child process. Returns the snapshot directory.
pub fn fetch_model(model_id: &str, dest: &Path) -> Result<PathBuf> {
    let hub = |e: hf_hub::api::sync::ApiError| Error::Download(e.to_string());

    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_cache_dir(dest.to_path_buf())
        .with_progress(false)
        .build()
        .map_err(hub)?;
    let repo = api.model(model_id.to_string());
    let info = repo.info().map_err(hub)?;

    for sibling in &info.siblings {
        tracing::debug!(file = %sibling.rfilename, "fetching");
        repo.get(&sibling.rfilename).map_err(hub)?;
    }

    local_snapshot(dest, model_id).ok_or_else(|| Error::NotFound {
        kind: "snapshot",
        name: model_id.to_string(),
    })
}
