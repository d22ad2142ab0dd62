//! Device identity
//!
//! A producer's id must survive restarts so that listeners and queued commands
//! keep pointing at it. `FileIdentity` generates a UUID once and stores it in
//! the platform data directory.

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Error, Result};

const IDENTITY_FILE: &str = "device_id";

/// Source of a stable per-device identifier
pub trait DeviceIdentity {
    fn device_id(&self) -> Result<String>;
}

/// Fixed identifier, e.g. from configuration
#[derive(Debug, Clone)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self(device_id.into())
    }
}

impl DeviceIdentity for StaticIdentity {
    fn device_id(&self) -> Result<String> {
        let id = self.0.trim();
        if id.is_empty() {
            return Err(Error::Config("Device id is empty".to_string()));
        }
        Ok(id.to_string())
    }
}

/// Identifier generated on first use and persisted to a file
#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
}

impl FileIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Identity file in the platform data directory
    pub fn in_data_dir() -> Result<Self> {
        let dirs = AppConfig::project_dirs()
            .ok_or_else(|| Error::Config("No home directory for device identity".to_string()))?;
        Ok(Self::new(dirs.data_dir().join(IDENTITY_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceIdentity for FileIdentity {
    fn device_id(&self) -> Result<String> {
        if self.path.exists() {
            let stored = std::fs::read_to_string(&self.path)?;
            let stored = stored.trim();
            if !stored.is_empty() {
                return Ok(stored.to_string());
            }
            tracing::warn!("Empty identity file {}, regenerating", self.path.display());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let id = Uuid::new_v4().to_string();
        std::fs::write(&self.path, &id)?;
        tracing::info!("Generated device id {} at {}", id, self.path.display());
        Ok(id)
    }
}

/// Configured id when set, otherwise the persisted one
pub fn resolve(configured: Option<&str>) -> Result<String> {
    match configured {
        Some(id) => StaticIdentity::new(id).device_id(),
        None => FileIdentity::in_data_dir()?.device_id(),
    }
}
