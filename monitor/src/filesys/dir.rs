//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::MonitorError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), MonitorError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Create a uniquely named directory under the system temp dir
    pub async fn create_temp_dir(prefix: &str) -> Result<Dir, MonitorError> {
        let temp_dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        fs::create_dir_all(&temp_dir).await?;
        Ok(Dir::new(temp_dir))
    }
}
