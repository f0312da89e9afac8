//! Live configuration with wholesale swap on successful reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{resolve, ConfigError, ConfigFile, Conf, ResolvedConfig, ServiceDiscovery};

/// Read only the `conf` section, e.g. to set up discovery before resolving.
pub async fn read_conf(path: &Path) -> Result<Conf, ConfigError> {
    let raw = tokio::fs::read(path).await?;
    Ok(ConfigFile::parse(&raw)?.conf)
}

/// Holds the active [`ResolvedConfig`] behind a read/write lock.
///
/// A reload resolves into a fresh value and swaps the pointer only on
/// success, so a bad file leaves the previous configuration in force.
pub struct ConfigStore {
    path: PathBuf,
    hostname: String,
    discovery: Arc<dyn ServiceDiscovery>,
    current: RwLock<Arc<ResolvedConfig>>,
}

impl ConfigStore {
    /// Load and resolve `path`. Failure here is fatal to the caller.
    pub async fn open(
        path: impl Into<PathBuf>,
        hostname: impl Into<String>,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Self, ConfigError> {
        let store = Self {
            path: path.into(),
            hostname: hostname.into(),
            discovery,
            current: RwLock::new(Arc::new(ResolvedConfig::default())),
        };
        store.reload().await?;
        Ok(store)
    }

    /// The configuration currently in force.
    pub fn current(&self) -> Arc<ResolvedConfig> {
        self.current.read().clone()
    }

    /// Re-read and re-resolve the file, replacing the live configuration.
    pub async fn reload(&self) -> Result<Arc<ResolvedConfig>, ConfigError> {
        let raw = tokio::fs::read(&self.path).await?;
        let resolved = Arc::new(resolve(&raw, &self.hostname, self.discovery.as_ref()).await?);

        *self.current.write() = resolved.clone();
        tracing::info!(
            path = %self.path.display(),
            targets = resolved.targets.len(),
            "Configuration loaded"
        );
        Ok(resolved)
    }
}
