use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use koi_paths::KoiPaths;
use serde::{Deserialize, Serialize};

use crate::errors::DaemonError;

/// Supervisor configuration, read from `<config dir>/koi.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Start instances marked `autostart` at boot.
    /// Default: true
    #[serde(default = "default_true")]
    pub start_instances: bool,

    /// Seconds an instance or helper gets to honor a stop before it is killed.
    /// Default: 5
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Per-request timeout on the control endpoint, in seconds.
    /// Default: 3
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Helper executable. Default: `<bin dir>/koishell`.
    #[serde(default)]
    pub helper_path: Option<PathBuf>,

    /// `KEY=VALUE` entries injected into every instance.
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default, rename = "instance")]
    pub instances: Vec<InstanceConfig>,
}

/// One managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory. Default: the instance's own directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl DaemonConfig {
    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.stop_timeout_secs == 0 {
            return Err(DaemonError::ConfigInvalid(
                "stop_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(DaemonError::ConfigInvalid(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        if let Some(entry) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(DaemonError::ConfigInvalid(format!(
                "env entry '{entry}' must have the form KEY=VALUE"
            )));
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            if instance.name.trim().is_empty() {
                return Err(DaemonError::ConfigInvalid(
                    "instance name must not be empty".to_string(),
                ));
            }
            // Names become file names under the instances and log dirs.
            if matches!(instance.name.as_str(), "." | "..")
                || instance.name.contains(['/', '\\'])
            {
                return Err(DaemonError::ConfigInvalid(format!(
                    "instance name '{}' must not be a path",
                    instance.name
                )));
            }
            if instance.command.trim().is_empty() {
                return Err(DaemonError::ConfigInvalid(format!(
                    "instance '{}' has an empty command",
                    instance.name
                )));
            }
            if !seen.insert(instance.name.as_str()) {
                return Err(DaemonError::ConfigInvalid(format!(
                    "duplicate instance name '{}'",
                    instance.name
                )));
            }
        }
        Ok(())
    }

    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn stop_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            start_instances: true,
            stop_timeout_secs: default_stop_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            helper_path: None,
            env: Vec::new(),
            instances: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    3
}

/// Load configuration from `<config dir>/koi.toml`.
///
/// A missing or unreadable file yields defaults. Values that parse but fail
/// validation abort with `ConfigInvalid`.
pub fn load_daemon_config(paths: &KoiPaths) -> Result<DaemonConfig, DaemonError> {
    let config_path = paths.config_file();

    let config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<DaemonConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };
    config.validate()?;
    tracing::debug!(
        event = "daemon.config.load_completed",
        path = %config_path.display(),
        instances = config.instances.len(),
    );
    Ok(config)
}

/// Runtime status of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub uptime_secs: u64,
    pub host: String,
    pub port: String,
    /// Configured instances.
    pub instance_count: usize,
    /// Instances with a live process.
    pub running_count: usize,
    /// Helper processes currently in flight.
    pub helpers_in_flight: usize,
}

pub use crate::protocol::messages::{InstanceInfo, InstanceStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert!(config.start_instances);
        assert_eq!(config.stop_timeout_secs, 5);
        assert_eq!(config.request_timeout_secs, 3);
        assert!(config.helper_path.is_none());
        assert!(config.instances.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
stop_timeout_secs = 10
env = ["NODE_ENV=production"]

[[instance]]
name = "default"
command = "node"
args = ["index.js"]
env = { KOISHI_PORT = "5140" }

[[instance]]
name = "staging"
command = "/usr/bin/yarn"
cwd = "/srv/staging"
autostart = false
"#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.stop_timeout_secs, 10);
        assert_eq!(config.request_timeout_secs, 3);
        assert_eq!(config.instances.len(), 2);

        let default = config.instance("default").unwrap();
        assert_eq!(default.args, vec!["index.js"]);
        assert_eq!(default.env["KOISHI_PORT"], "5140");
        assert!(default.autostart);
        assert!(default.cwd.is_none());

        let staging = config.instance("staging").unwrap();
        assert!(!staging.autostart);
        assert_eq!(staging.cwd, Some(PathBuf::from("/srv/staging")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeouts_fail() {
        let mut config = DaemonConfig::default();
        config.stop_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stop_timeout_secs"));

        let mut config = DaemonConfig::default();
        config.request_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[test]
    fn test_validate_env_entry_needs_equals() {
        let mut config = DaemonConfig::default();
        config.env = vec!["JUSTAKEY".to_string()];
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "config_invalid");
        assert!(err.to_string().contains("JUSTAKEY"));
    }

    #[test]
    fn test_validate_duplicate_instance_names() {
        let toml = r#"
[[instance]]
name = "a"
command = "node"

[[instance]]
name = "a"
command = "node"
"#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate instance name"));
    }

    #[test]
    fn test_validate_empty_instance_name() {
        let toml = r#"
[[instance]]
name = " "
command = "node"
"#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_path_like_instance_names() {
        for name in ["..", ".", "a/b", "a\\b", "../escape"] {
            let config = DaemonConfig {
                instances: vec![InstanceConfig {
                    name: name.to_string(),
                    command: "node".to_string(),
                    args: Vec::new(),
                    cwd: None,
                    env: Default::default(),
                    autostart: true,
                }],
                ..DaemonConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("must not be a path"), "{name}");
        }
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KoiPaths::from_dir(dir.path().to_path_buf());
        let config = load_daemon_config(&paths).unwrap();
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_load_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KoiPaths::from_dir(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        std::fs::write(paths.config_file(), "this is = = not toml").unwrap();
        let config = load_daemon_config(&paths).unwrap();
        assert_eq!(config.stop_timeout_secs, 5);
    }

    #[test]
    fn test_load_invalid_values_fail() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KoiPaths::from_dir(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        std::fs::write(paths.config_file(), "stop_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            load_daemon_config(&paths),
            Err(DaemonError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_status_serde() {
        let status = DaemonStatus {
            pid: 12345,
            uptime_secs: 60,
            host: "127.0.0.1".to_string(),
            port: "41234".to_string(),
            instance_count: 2,
            running_count: 1,
            helpers_in_flight: 0,
        };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: DaemonStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
