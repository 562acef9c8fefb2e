// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon-wide configuration. Mirrors the teacher's `config/cfgfile.rs`
//! shape (a `Deserialize` struct tree for the YAML file, `Option<T>` for
//! every key that has a sane default) plus the environment-variable
//! override the teacher's `config/env.rs` applies on top of the file.

use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, StoreResult};

/// The `repository` section of the config file.
#[derive(Deserialize, Debug, PartialEq, Default)]
pub struct ConfigKeyRepository {
    /// Installation root; falls back to `DEFAULT_REPOSITORY_PATH`.
    pub path: Option<PathBuf>,
}

/// The `timeouts` section (all in milliseconds in the file).
#[derive(Deserialize, Debug, PartialEq)]
pub struct ConfigKeyTimeouts {
    pub lock_ms: Option<u64>,
    pub event_phase_ms: Option<u64>,
}

impl Default for ConfigKeyTimeouts {
    fn default() -> Self {
        Self {
            lock_ms: Some(5_000),
            event_phase_ms: Some(5_000),
        }
    }
}

/// The `shm` section.
#[derive(Deserialize, Debug, PartialEq)]
pub struct ConfigKeyShm {
    pub main_region_bytes: Option<usize>,
    pub extended_region_initial_bytes: Option<usize>,
}

impl Default for ConfigKeyShm {
    fn default() -> Self {
        Self {
            main_region_bytes: Some(64 * 1024),
            extended_region_initial_bytes: Some(256 * 1024),
        }
    }
}

/// The `notifications` section.
#[derive(Deserialize, Debug, PartialEq)]
pub struct ConfigKeyNotifications {
    pub max_file_bytes: Option<usize>,
}

impl Default for ConfigKeyNotifications {
    fn default() -> Self {
        Self {
            max_file_bytes: Some(treestore_common::DEFAULT_NOTIF_FILE_CAP_BYTES),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub repository: ConfigKeyRepository,
    #[serde(default)]
    pub timeouts: ConfigKeyTimeouts,
    #[serde(default)]
    pub shm: ConfigKeyShm,
    #[serde(default)]
    pub notifications: ConfigKeyNotifications,
    pub log_level: Option<String>,
}

impl Config {
    /// Parses the YAML config file at `path`.
    pub fn load_file(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::invalid_arg(format!("malformed configuration: {e}")))
    }

    /// Applies the `REPOSITORY_PATH` environment override on top of the
    /// file (or default) value, matching spec.md §6 "Environment".
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(treestore_common::ENV_REPOSITORY_PATH) {
            self.repository.path = Some(PathBuf::from(path));
        }
        self
    }

    pub fn repository_path(&self) -> PathBuf {
        self.repository
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(treestore_common::DEFAULT_REPOSITORY_PATH))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.lock_ms.unwrap_or(5_000))
    }

    pub fn event_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.event_phase_ms.unwrap_or(5_000))
    }

    pub fn main_region_bytes(&self) -> usize {
        self.shm.main_region_bytes.unwrap_or(64 * 1024)
    }

    pub fn extended_region_initial_bytes(&self) -> usize {
        self.shm.extended_region_initial_bytes.unwrap_or(256 * 1024)
    }

    pub fn notif_max_file_bytes(&self) -> usize {
        self.notifications
            .max_file_bytes
            .unwrap_or(treestore_common::DEFAULT_NOTIF_FILE_CAP_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timeouts() {
        let cfg = Config::default();
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(5_000));
        assert_eq!(cfg.repository_path(), PathBuf::from(treestore_common::DEFAULT_REPOSITORY_PATH));
    }

    #[test]
    fn parses_partial_yaml() {
        let cfg: Config = serde_yaml::from_str("repository:\n  path: /tmp/ts\n").unwrap();
        assert_eq!(cfg.repository_path(), PathBuf::from("/tmp/ts"));
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn env_override_wins_over_file() {
        std::env::set_var(treestore_common::ENV_REPOSITORY_PATH, "/tmp/ts-env");
        let cfg: Config = serde_yaml::from_str("repository:\n  path: /tmp/ts-file\n").unwrap();
        let cfg = cfg.with_env_overrides();
        assert_eq!(cfg.repository_path(), PathBuf::from("/tmp/ts-env"));
        std::env::remove_var(treestore_common::ENV_REPOSITORY_PATH);
    }
}
