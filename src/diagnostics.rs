//! Diagnostic bundles attached to bug reports.
//!
//! A bundle is a zip with the environment, the runtime status, the settings
//! file and the cache manifest of the indexed folder. Document text and
//! chunk payloads are never included.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use serde::Serialize;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    cache::{CacheKey, CacheStore, SCHEMA_VERSION},
    data_dir::DataDir,
    error::Result,
    runtime::StatusReport,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub version: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
    pub data_dir: PathBuf,
    pub cache_root: PathBuf,
    pub models_dir: PathBuf,
    pub cache_schema_version: u32,
}

impl Environment {
    pub fn collect(data_dir: &DataDir) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            data_dir: data_dir.root().to_path_buf(),
            cache_root: data_dir.cache_root(),
            models_dir: data_dir.root().join("models"),
            cache_schema_version: SCHEMA_VERSION,
        }
    }
}

/// One entry the bundle tried to include.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleItem {
    pub name: String,
    pub included: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What goes into a bundle.
pub struct Bundle<'a> {
    pub environment: &'a Environment,
    pub status: &'a StatusReport,
    pub settings_file: &'a Path,
    pub cache: &'a CacheStore,
}

/// Write `bundle` as a zip at `path`.
///
/// Missing optional files do not fail the export; they are listed as not
/// included in the bundle's own `manifest.json`.
pub fn export(path: &Path, bundle: &Bundle<'_>) -> Result<Vec<BundleItem>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(File::create(path)?);
    let mut items = Vec::new();

    for (name, json) in [
        ("environment.json", serde_json::to_vec_pretty(bundle.environment)?),
        ("status.json", serde_json::to_vec_pretty(bundle.status)?),
    ] {
        zip.start_file(name, options)?;
        zip.write_all(&json)?;
        items.push(BundleItem {
            name: name.to_string(),
            included: true,
            error: None,
        });
    }

    let mut copy = |name: &str, src: &Path| -> Result<()> {
        match std::fs::read(src) {
            Ok(bytes) => {
                zip.start_file(name, options)?;
                zip.write_all(&bytes)?;
                items.push(BundleItem {
                    name: name.to_string(),
                    included: true,
                    error: None,
                });
            }
            Err(e) => items.push(BundleItem {
                name: name.to_string(),
                included: false,
                error: Some(e.to_string()),
            }),
        }
        Ok(())
    };

    copy("settings.json", bundle.settings_file)?;
    if let (Some(model), Some(folder)) =
        (bundle.status.model.as_deref(), bundle.status.folder.as_deref())
    {
        let key = CacheKey::compute(model, folder);
        copy("cache/manifest.json", &bundle.cache.manifest_path(&key))?;
    }

    zip.start_file("manifest.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(&items)?)?;
    zip.finish()?;

    tracing::info!(path = %path.display(), items = items.len(), "diagnostics exported");
    Ok(items)
}
