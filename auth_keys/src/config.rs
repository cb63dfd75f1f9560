use crate::error::AuthKeysError;
use crate::fs_lock::default_lock_path;
use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Where a [`crate::Store`] keeps its files
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
pub struct StoreConfig {
    /// The authorized_keys file
    pub path: PathBuf,
    /// Sidecar file used to serialize writers, `<path>.lockfile` when not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<PathBuf>,
    /// Directory for the temporary copy made during a write, must be on the same
    /// filesystem as `path`. The directory of `path` when not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> StoreConfig {
        StoreConfig {
            path: path.into(),
            lock_path: None,
            temp_dir: None,
        }
    }

    /// Reads a toml config file
    pub fn load(path: &Path) -> Result<StoreConfig, AuthKeysError> {
        let mut config_toml = String::new();

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                error!("Could not open config file {}", path.display());
                return Err(e.into());
            }
        };
        file.read_to_string(&mut config_toml)?;

        let config: StoreConfig = toml::from_str(&config_toml)?;
        if config.path.as_os_str().is_empty() {
            return Err(AuthKeysError::ConfigError(
                "path must not be empty".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| default_lock_path(&self.path))
    }
}
