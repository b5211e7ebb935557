use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "DOCSEEK_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The DOCSEEK_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/docseek/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("docseek")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    /// Directory holding one cache entry per (folder, model) pair.
    ///
    /// Not created eagerly: clearing the cache removes it entirely.
    pub fn cache_root(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn models_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("models");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.settings_file(), tmp.path().join("settings.json"));
        assert_eq!(dir.cache_root(), tmp.path().join("cache"));
    }

    #[test]
    fn models_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let models = dir.models_dir().unwrap();

        assert!(models.exists());
        assert_eq!(models, tmp.path().join("models"));
    }

    #[test]
    fn resolve_creates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());
    }
}
