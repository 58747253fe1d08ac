//! Where docsift keeps its state.
//!
//! ```text
//! <root>/config.redb   settings, directories, model pointer, topic tree
//! <root>/store/        records, vectors and the text index
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "DOCSIFT_DATA_DIR";

const CONFIG_DB_FILE: &str = "config.redb";
const STORE_DIR: &str = "store";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Pick the root and create it if needed.
    ///
    /// `explicit` (the `--data-dir` flag) wins over a non-empty
    /// `DOCSIFT_DATA_DIR`, which wins over the XDG data home.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(DATA_DIR_ENV_VAR) {
                Some(value) if !value.is_empty() => PathBuf::from(value),
                _ => xdg_data_home()?,
            },
        };
        Ok(Self {
            root: ensure_dir(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_DB_FILE)
    }

    /// The document store directory, created on first use.
    pub fn store_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.root.join(STORE_DIR))
    }
}

fn xdg_data_home() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix("docsift")
        .get_data_home()
        .ok_or_else(|| Error::Config("could not determine XDG data home directory".into()))
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf> {
    std::fs::create_dir_all(&path).map_err(|_| Error::DataDir(path.clone()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_lives_under_the_explicit_root() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.config_db(), tmp.path().join("config.redb"));
        let store = dir.store_dir().unwrap();
        assert!(store.is_dir());
        assert_eq!(store, tmp.path().join("store"));
    }

    #[test]
    fn missing_roots_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(dir.root().is_dir());
    }

    #[test]
    fn a_file_in_the_way_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("taken");
        std::fs::write(&blocker, "x").unwrap();
        assert!(matches!(
            DataDir::resolve(Some(&blocker)),
            Err(Error::DataDir(path)) if path == blocker
        ));
    }
}
