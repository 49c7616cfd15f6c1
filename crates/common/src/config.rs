//! Tunnel configuration loading
//!
//! The tunnel engine is configured with a JSON object read from disk, plus the
//! absolute path of a data root directory it may write to. The directory is
//! created before a session starts and injected into the JSON under the
//! `DataRootDirectory` key. Embedded server entries are an opaque text blob
//! passed to the engine verbatim.

use crate::constants::DATA_ROOT_DIRECTORY_KEY;
use crate::error::{Result, TunnelError};
use crate::validation::validate_data_root;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolved configuration for one tunnel session
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    params: Map<String, Value>,
    data_root_directory: PathBuf,
}

impl TunnelConfig {
    /// Build a config from raw JSON and the data root directory
    ///
    /// The JSON must be an object. The data root must be absolute; it is
    /// written into the object under `DataRootDirectory`, replacing any value
    /// already there.
    pub fn from_json(raw: &[u8], data_root_directory: impl Into<PathBuf>) -> Result<Self> {
        let data_root_directory = data_root_directory.into();
        validate_data_root(&data_root_directory)?;

        let value: Value = serde_json::from_slice(raw)?;
        let Value::Object(mut params) = value else {
            return Err(TunnelError::Config(
                "tunnel config must be a JSON object".to_string(),
            ));
        };

        let root = data_root_directory.to_string_lossy().into_owned();
        params.insert(DATA_ROOT_DIRECTORY_KEY.to_string(), Value::String(root));

        Ok(Self {
            params,
            data_root_directory,
        })
    }

    /// Absolute path of the engine's data root directory
    pub fn data_root_directory(&self) -> &Path {
        &self.data_root_directory
    }

    /// Look up a single tunnel parameter
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Serialize the full parameter object, including `DataRootDirectory`
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.params)?)
    }
}

/// Supplies the tunnel configuration and embedded server list for a session
pub trait ConfigProvider: Send + Sync {
    /// Load the config; failure is fatal for the session
    fn provide_config(&self) -> Result<TunnelConfig>;

    /// Load the embedded server entries, if any are configured
    fn provide_embedded_server_list(&self) -> Result<Option<String>>;
}

/// Reads the config and server entries from files on disk
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    config_path: PathBuf,
    server_entries_path: Option<PathBuf>,
    data_root_directory: PathBuf,
}

impl FileConfigProvider {
    pub fn new(
        config_path: impl Into<PathBuf>,
        server_entries_path: Option<PathBuf>,
        data_root_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            server_entries_path,
            data_root_directory: data_root_directory.into(),
        }
    }

    /// Create the data root directory (with parents) and return its absolute path
    pub fn ensure_data_root_directory(&self) -> Result<PathBuf> {
        let root = std::path::absolute(&self.data_root_directory)?;
        fs::create_dir_all(&root).map_err(|e| {
            TunnelError::Config(format!(
                "failed to create data root directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(root)
    }
}

impl ConfigProvider for FileConfigProvider {
    fn provide_config(&self) -> Result<TunnelConfig> {
        let root = self.ensure_data_root_directory()?;
        debug!("Tunnel data root directory: {}", root.display());

        let raw = fs::read(&self.config_path).map_err(|e| {
            TunnelError::Config(format!(
                "failed to read tunnel config {}: {}",
                self.config_path.display(),
                e
            ))
        })?;

        TunnelConfig::from_json(&raw, root).map_err(|e| match e {
            TunnelError::Config(_) => e,
            other => TunnelError::Config(format!(
                "failed to parse tunnel config {}: {}",
                self.config_path.display(),
                other
            )),
        })
    }

    fn provide_embedded_server_list(&self) -> Result<Option<String>> {
        let Some(path) = &self.server_entries_path else {
            return Ok(None);
        };

        match fs::read_to_string(path) {
            Ok(entries) => Ok(Some(entries)),
            Err(e) => {
                warn!("Failed to read embedded server entries {}: {}", path.display(), e);
                Err(TunnelError::Config(format!(
                    "failed to read embedded server entries {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}
