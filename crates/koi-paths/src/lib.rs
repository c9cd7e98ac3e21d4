use std::path::{Path, PathBuf};

/// Environment variable that overrides the state directory.
pub const HOME_ENV: &str = "KOI_HOME";

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found; set $HOME or $KOI_HOME")]
    HomeNotFound,
}

/// Centralized path construction for the `~/.koi/` directory layout.
///
/// Single source of truth for every path the supervisor touches. Use
/// `resolve()` in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct KoiPaths {
    koi_dir: PathBuf,
}

impl KoiPaths {
    /// Resolve paths from `$KOI_HOME`, falling back to `~/.koi`.
    pub fn resolve() -> Result<Self, PathError> {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self {
                koi_dir: PathBuf::from(dir),
            });
        }
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            koi_dir: home.join(".koi"),
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(koi_dir: PathBuf) -> Self {
        Self { koi_dir }
    }

    /// The base `~/.koi` directory.
    pub fn koi_dir(&self) -> &Path {
        &self.koi_dir
    }

    // --- Top-level subdirectories ---

    pub fn lock_dir(&self) -> PathBuf {
        self.koi_dir.join("lock")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.koi_dir.join("bin")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.koi_dir.join("config")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.koi_dir.join("instances")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.koi_dir.join("logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.koi_dir.join("tmp")
    }

    /// Directories the supervisor creates at boot.
    pub fn all_dirs(&self) -> [PathBuf; 6] {
        [
            self.lock_dir(),
            self.bin_dir(),
            self.config_dir(),
            self.instances_dir(),
            self.log_dir(),
            self.temp_dir(),
        ]
    }

    // --- Files ---

    /// The singleton lock record: `~/.koi/lock/daemon.lock`.
    pub fn daemon_lock_file(&self) -> PathBuf {
        self.lock_dir().join("daemon.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("koi.toml")
    }

    /// The UI helper executable shipped next to the instance binaries.
    pub fn helper_binary(&self) -> PathBuf {
        self.bin_dir().join(executable_name("koishell"))
    }

    // --- Parameterized paths ---

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances_dir().join(sanitize(name))
    }

    pub fn instance_log_file(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", sanitize(name)))
    }
}

fn sanitize(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

fn executable_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}
