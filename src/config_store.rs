// src/config_store.rs - Persistence seam and consistent config snapshots

use crate::config::Config;
use crate::error::{Result, TankError};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// External configuration persistence
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn save(&self, config: &Config) -> Result<()>;
}

/// Load from `store`, falling back to built-in defaults on any failure.
pub fn load_or_default(store: &dyn ConfigStore) -> Config {
    match store.load().and_then(|config| {
        config
            .validate()
            .map_err(|e| TankError::Configuration(e.to_string()))?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            warn!("Configuration unusable ({}), using built-in defaults", e);
            Config::default()
        }
    }
}

// ============================================================================
// FILE STORE
// ============================================================================

/// YAML file on local disk
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Config> {
        Config::from_file(&self.path).map_err(|e| match e {
            TankError::Configuration(_) => e,
            other => TankError::Configuration(format!("{}: {}", self.path.display(), other)),
        })
    }

    fn save(&self, config: &Config) -> Result<()> {
        config.validate()?;
        std::fs::write(&self.path, config.to_yaml()?)?;
        info!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-process store for tests and embedded use
#[derive(Default)]
pub struct MemoryConfigStore {
    stored: Mutex<Option<Config>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            stored: Mutex::new(Some(config)),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Config> {
        self.stored
            .lock()
            .clone()
            .ok_or_else(|| TankError::Configuration("no configuration stored".to_string()))
    }

    fn save(&self, config: &Config) -> Result<()> {
        config.validate()?;
        *self.stored.lock() = Some(config.clone());
        Ok(())
    }
}

// ============================================================================
// SNAPSHOT HANDLE
// ============================================================================

/// Shared configuration. Readers take an immutable snapshot for a whole
/// calculation pass; writers swap in a new one atomically.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Validate and publish a new configuration
    pub fn replace(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        info!("Configuration updated");
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
