/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::engine::EngineOptions;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

pub const DEFAULT_BIND: &str = "127.0.0.1:40302";

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
}
impl Config {
    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let conf_str = fs::read_to_string(path)
            .context(format!("Unable to read config file {}", path.display()))?;
        Config::try_from_str(&conf_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    pub fn orchestrator(&self) -> anyhow::Result<&OrchestratorConfig> {
        self.orchestrator
            .as_ref()
            .context("Missing [orchestrator] section with spawn and stop commands")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Address workers are told to call back on. Defaults to `bind`.
    pub advertise: Option<String>,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            advertise: None,
        }
    }
}
impl ServerConfig {
    pub fn callback_addr(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.bind)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OrchestratorConfig {
    pub spawn: String,
    pub stop: String,
    pub cleanup: Option<String>,
    /// Kill a spawn, stop or cleanup command still running after this many seconds.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_ms: u64,
    pub expect_timeout_secs: Option<u64>,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            expect_timeout_secs: None,
        }
    }
}
impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        EngineOptions {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            expect_timeout: config.expect_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() -> anyhow::Result<()> {
        let cfg = Config::try_from_str("")?;
        assert_eq!(cfg.server, ServerConfig::default());
        assert_eq!(cfg.server.callback_addr(), DEFAULT_BIND);
        assert!(cfg.orchestrator().is_err());

        let opts = EngineOptions::from(&cfg.engine);
        assert_eq!(opts.poll_interval, Duration::from_secs(1));
        assert_eq!(opts.expect_timeout, None);
        Ok(())
    }

    #[test]
    fn can_load_full_config() -> anyhow::Result<()> {
        let cfg = Config::try_from_str(
            r#"
            [server]
            bind = "0.0.0.0:40302"
            advertise = "10.1.2.3:40302"

            [orchestrator]
            spawn = "systemctl start worker@{id}"
            stop = "systemctl stop worker@{id}"
            cleanup = "systemctl reset-failed"
            timeout_secs = 30

            [engine]
            poll_interval_ms = 250
            expect_timeout_secs = 600
            "#,
        )?;

        assert_eq!(cfg.server.callback_addr(), "10.1.2.3:40302");
        let orch = cfg.orchestrator()?;
        assert_eq!(orch.stop, "systemctl stop worker@{id}");
        assert_eq!(orch.cleanup.as_deref(), Some("systemctl reset-failed"));
        assert_eq!(orch.timeout_secs, Some(30));

        let opts = EngineOptions::from(&cfg.engine);
        assert_eq!(opts.poll_interval, Duration::from_millis(250));
        assert_eq!(opts.expect_timeout, Some(Duration::from_secs(600)));
        Ok(())
    }

    #[test]
    fn bad_toml_is_reported() {
        let res = Config::try_from_str("[server]\nbind = 12");
        assert!(res.is_err());
    }
}
