//! Directories owned by the orchestrator

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::OrchestratorError;
use crate::filesys::file::File;

#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        matches!(fs::metadata(&self.path).await, Ok(m) if m.is_dir())
    }

    /// Creates the directory with any missing parents
    pub async fn create(&self) -> Result<(), OrchestratorError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// `name` inside this directory; nothing is touched on disk
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }
}
