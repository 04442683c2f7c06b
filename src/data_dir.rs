use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The ANNOSEARCH_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/annosearch/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("ANNOSEARCH_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("annosearch")
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

    /// Location of the redb file holding index rows and settings.
    pub fn index_db(&self) -> PathBuf {
        self.root.join("index.redb")
    }

    /// Parent directory of the per-project Tantivy indexes.
    pub fn indexes_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("indexes");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    pub fn default_workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }
}
