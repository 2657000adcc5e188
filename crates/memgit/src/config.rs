use std::{
    env, fs,
    path::{Path, PathBuf},
};

use libmemgit::{MemgitError, Result};
use serde::Deserialize;

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "MEMGIT_CONFIG";

/// Settings read from a TOML config file. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `[commit]` section.
    pub commit: CommitConfig,
    /// `[transport]` section.
    pub transport: TransportConfig,
}

/// What the commit looks like and where files go.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommitConfig {
    /// Author and committer name.
    pub author: Option<String>,
    /// Author and committer email.
    pub email: Option<String>,
    /// Commit message.
    pub message: Option<String>,
    /// Directory the per-run directory is created under.
    pub base_dir: Option<String>,
}

/// How the remote is reached.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Environment variable holding the private key.
    pub credential_env: Option<String>,
    /// Known-hosts file used to verify SSH host keys.
    pub known_hosts: Option<String>,
    /// Skip host key verification.
    pub accept_unknown_host_keys: Option<bool>,
}

impl Config {
    /// Read and parse the config file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            MemgitError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|e| {
            MemgitError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Load the config named by `flag`, else by `MEMGIT_CONFIG`, else defaults.
    pub fn discover(flag: Option<&str>) -> Result<Self> {
        let path = match flag {
            Some(path) => Some(expand_tilde(path)),
            None => env::var(CONFIG_ENV)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| expand_tilde(&value)),
        };
        match path {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~")
        && let Ok(home) = env::var("HOME")
    {
        return PathBuf::from(path.replacen("~", &home, 1));
    }
    PathBuf::from(path)
}
