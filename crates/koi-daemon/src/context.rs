use std::path::PathBuf;

use koi_paths::KoiPaths;

use crate::errors::DaemonError;
use crate::types::{DaemonConfig, load_daemon_config};

/// Everything resolved at boot that the components need: where state lives
/// and how the supervisor is configured.
///
/// Built once and passed by reference to every constructor.
#[derive(Debug, Clone)]
pub struct DaemonContext {
    pub paths: KoiPaths,
    pub config: DaemonConfig,
}

impl DaemonContext {
    pub fn new(paths: KoiPaths, config: DaemonConfig) -> Self {
        Self { paths, config }
    }

    /// Resolve the state directory (or use `home`) and load its config.
    pub fn load(home: Option<PathBuf>) -> Result<Self, DaemonError> {
        let paths = match home {
            Some(dir) => KoiPaths::from_dir(dir),
            None => KoiPaths::resolve().map_err(|e| DaemonError::ConfigInvalid(e.to_string()))?,
        };
        let config = load_daemon_config(&paths)?;
        Ok(Self { paths, config })
    }

    /// Helper executable: the configured override or `<bin dir>/koishell`.
    pub fn helper_path(&self) -> PathBuf {
        self.config
            .helper_path
            .clone()
            .unwrap_or_else(|| self.paths.helper_binary())
    }

    /// Create every state directory.
    pub fn ensure_dirs(&self) -> Result<(), DaemonError> {
        for dir in self.paths.all_dirs() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
