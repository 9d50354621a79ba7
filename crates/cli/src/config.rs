// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

// VPN Engine - CLI Config Module
// Where the CLI finds the daemon

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use vpn_engine_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,
}

impl CliConfig {
    /// Load `~/.config/vpn-engine/cli.toml`, or defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read CLI configuration")?;

        toml::from_str(&contents).context("Failed to parse CLI configuration")
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("vpn-engine").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpn_engine_common::ClientConnectionMode;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load_from(&dir.path().join("cli.toml")).unwrap();
        assert_eq!(
            config.daemon_config.connection_mode,
            ClientConnectionMode::UnixSocket
        );
    }

    #[test]
    fn test_http_mode_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        fs::write(
            &path,
            "connection_mode = \"http\"\ndaemon_addr = \"127.0.0.1:9000\"\n",
        )
        .unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon_config.connection_mode, ClientConnectionMode::Http);
        assert_eq!(
            config.daemon_config.daemon_base_url(),
            "http://127.0.0.1:9000"
        );
    }
}
