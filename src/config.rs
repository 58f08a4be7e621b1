/*
 * Copyright (c) 2026 DoppelDB contributors. All rights reserved.
 *
 * DoppelDB - MongoDB wire-compatible proxy over relational storage
 *
 * @file config.rs
 * @brief DoppelDB configuration management
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::DoppelError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub proxy: ProxyConfig,
    pub backend: BackendConfig,
    pub mode: Mode,
    pub state_dir: String,
    pub repl_set_name: Option<String>,
    pub auth: bool,
    pub users: Vec<UserConfig>,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryState,
    pub debug_addr: Option<String>,
    pub cursors: CursorConfig,
    pub capped_cleanup: CappedCleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub addr: String,
    pub unix: Option<String>,
    pub tls: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub tls_ca_file: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:27017".to_string(),
            unix: None,
            tls: false,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub addr: Option<String>,
    pub tls: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub tls_ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub postgresql_url: Option<String>,
    pub sqlite_url: Option<String>,
    pub pool_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            postgresql_url: None,
            sqlite_url: None,
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Normal,
    Proxy,
    DiffNormal,
    DiffProxy,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Mode::Normal),
            "proxy" => Ok(Mode::Proxy),
            "diff-normal" => Ok(Mode::DiffNormal),
            "diff-proxy" => Ok(Mode::DiffProxy),
            other => Err(format!(
                "invalid mode '{}', expected normal|proxy|diff-normal|diff-proxy",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryState {
    Enabled,
    Disabled,
    #[default]
    Undecided,
}

impl std::str::FromStr for TelemetryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(TelemetryState::Enabled),
            "disabled" => Ok(TelemetryState::Disabled),
            "undecided" => Ok(TelemetryState::Undecided),
            other => Err(format!(
                "invalid telemetry state '{}', expected enabled|disabled|undecided",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub db: String,
    pub name: String,
    pub password: String,
    pub roles: Vec<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            db: "admin".to_string(),
            name: String::new(),
            password: String::new(),
            roles: vec!["readWrite".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "console".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub idle_timeout_secs: u64,
    pub tick_interval_secs: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            tick_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CappedCleanupConfig {
    pub interval_secs: u64,
    pub percent: u8,
}

impl Default for CappedCleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            percent: 10,
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Startup-time consistency checks; failures here are fatal.
    pub fn validate(&self) -> std::result::Result<(), DoppelError> {
        match (&self.backend.postgresql_url, &self.backend.sqlite_url) {
            (Some(_), Some(_)) => Err(DoppelError::Config(
                "exactly one of postgresql-url and sqlite-url must be set".to_string(),
            )),
            (None, None) => Err(DoppelError::Config(
                "one of postgresql-url or sqlite-url is required".to_string(),
            )),
            _ => Ok(()),
        }?;

        if self.listen.tls
            && (self.listen.tls_cert_file.is_none() || self.listen.tls_key_file.is_none())
        {
            return Err(DoppelError::Config(
                "listen-tls requires listen-tls-cert-file and listen-tls-key-file".to_string(),
            ));
        }

        if self.mode != Mode::Normal && self.proxy.addr.is_none() {
            return Err(DoppelError::Config(format!(
                "mode {:?} requires proxy-addr",
                self.mode
            )));
        }

        if !["debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(DoppelError::Config(format!(
                "invalid log-level '{}'",
                self.logging.level
            )));
        }
        if !["console", "text", "json"].contains(&self.logging.format.as_str()) {
            return Err(DoppelError::Config(format!(
                "invalid log-format '{}'",
                self.logging.format
            )));
        }
        if self.capped_cleanup.percent == 0 || self.capped_cleanup.percent > 100 {
            return Err(DoppelError::Config(
                "capped cleanup percent must be in 1..=100".to_string(),
            ));
        }
        Ok(())
    }
}
