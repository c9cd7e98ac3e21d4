use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

use tracing::warn;

/// Environment overrides applied on top of the inherited environment of an
/// instance process, in application order.
///
/// `PATH` gets `bin_dir` prepended, then global `KEY=VALUE` entries apply,
/// then per-instance entries. Later entries win.
pub fn build_instance_env(
    bin_dir: &Path,
    global: &[String],
    instance: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(1 + global.len() + instance.len());

    if let Some(path) = prepend_path(bin_dir, std::env::var_os("PATH")) {
        env.push(("PATH".to_string(), path));
    }

    for entry in global {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.push((key.to_string(), value.to_string()));
            }
            _ => warn!(event = "daemon.proc.env_entry_skipped", entry = %entry),
        }
    }

    env.extend(instance.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn prepend_path(bin_dir: &Path, current: Option<OsString>) -> Option<String> {
    let mut dirs = vec![bin_dir.to_path_buf()];
    if let Some(current) = current {
        dirs.extend(std::env::split_paths(&current));
    }
    match std::env::join_paths(dirs) {
        Ok(joined) => Some(joined.to_string_lossy().into_owned()),
        Err(e) => {
            warn!(event = "daemon.proc.path_join_failed", error = %e);
            None
        }
    }
}

/// Look up the value a key ends up with after the overrides apply.
pub fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
