//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::MonitorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the monitor
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Requests seeded into the in-memory store at startup
    pub fn requests_file(&self) -> File {
        File::new(self.base_dir.join("requests.json"))
    }

    /// Get the logs directory (monitor logs and step output)
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Default working directory of deployment scripts
    pub fn scripts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("scripts"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), MonitorError> {
        self.logs_dir().create().await?;
        self.scripts_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/deploymon");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".deploymon");

        Self::new(base_dir)
    }
}
