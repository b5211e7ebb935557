//! User-facing settings persisted as JSON in the data directory.
//!
//! Every field has a default, so a partial or older settings file still
//! loads. An unreadable file is logged and replaced by defaults rather than
//! blocking startup.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model_manager::DEFAULT_MODEL_ID,
};

pub const MODEL_ENV_VAR: &str = "DOCSEEK_MODEL";

/// Number of folders remembered in [`Settings::recent_folders`].
pub const MAX_RECENT_FOLDERS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
    pub vector_weight: f32,
    pub bm25_weight: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub default_results: usize,
    pub max_results: usize,
    pub min_query_chars: usize,
    pub recursive: bool,
    pub hybrid: bool,
    pub shutdown_timeout_ms: u64,
    pub download_poll_ms: u64,
    pub recent_folders: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL_ID.to_string(),
            chunk_size: 800,
            chunk_overlap: 80,
            embed_batch_size: 100,
            vector_weight: 0.7,
            bm25_weight: 0.3,
            bm25_k1: 1.5,
            bm25_b: 0.75,
            default_results: 3,
            max_results: 10,
            min_query_chars: 2,
            recursive: false,
            hybrid: true,
            shutdown_timeout_ms: 5_000,
            download_poll_ms: 300,
            recent_folders: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or cannot be parsed.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "settings unreadable, using defaults"
                );
                return Self::default();
            }
        };

        match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "settings malformed, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Write settings atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Apply `DOCSEEK_MODEL` and an explicit CLI override, in that order.
    pub fn apply_overrides(&mut self, cli_model: Option<&str>) {
        if let Ok(model) = std::env::var(MODEL_ENV_VAR)
            && !model.trim().is_empty()
        {
            self.model = model;
        }
        if let Some(model) = cli_model {
            self.model = model.to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(self.vector_weight >= 0.0 && self.bm25_weight >= 0.0) {
            return Err(Error::Config(
                "ranking weights must be non-negative".into(),
            ));
        }
        if self.max_results == 0 || self.embed_batch_size == 0 {
            return Err(Error::Config(
                "max_results and embed_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Move `folder` to the front of the recent list.
    pub fn remember_folder(&mut self, folder: &Path) {
        self.recent_folders.retain(|f| f != folder);
        self.recent_folders.insert(0, folder.to_path_buf());
        self.recent_folders.truncate(MAX_RECENT_FOLDERS);
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn download_poll(&self) -> Duration {
        Duration::from_millis(self.download_poll_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load(&tmp.path().join("settings.json"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"chunk_size": 400, "hybrid": false}"#)
            .unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.chunk_size, 400);
        assert!(!settings.hybrid);
        assert_eq!(settings.chunk_overlap, 80);
        assert_eq!(settings.vector_weight, 0.7);
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        let settings = Settings {
            model: "custom/model".into(),
            recursive: true,
            ..Settings::default()
        };
        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path), settings);
        assert!(!tmp.path().join("settings.json.tmp").exists());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk() {
        let settings = Settings {
            chunk_size: 100,
            chunk_overlap: 100,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_negative_weight() {
        let settings = Settings {
            bm25_weight: -0.1,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn recent_folders_are_capped_and_deduplicated() {
        let mut settings = Settings::default();
        for i in 0..7 {
            settings.remember_folder(Path::new(&format!("/docs/{i}")));
        }
        settings.remember_folder(Path::new("/docs/3"));

        assert_eq!(settings.recent_folders.len(), MAX_RECENT_FOLDERS);
        assert_eq!(settings.recent_folders[0], PathBuf::from("/docs/3"));
        assert_eq!(
            settings
                .recent_folders
                .iter()
                .filter(|f| **f == PathBuf::from("/docs/3"))
                .count(),
            1
        );
    }
}
