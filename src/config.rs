use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::auth::AuthSettings;
use crate::node::ConnectionSettings;
use crate::resources::DiskSpaceGuard;

const ENV_PREFIX: &str = "TETHER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub data_dir: PathBuf,
    /// YAML file seeding nodes and users
    pub inventory_file: Option<PathBuf>,
    pub monitor: MonitorConfig,
    pub auth: AuthConfig,
    pub transport: TransportConfig,
    pub disk: DiskConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_secs: u64,
    pub handshake_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_ttl_hours: i64,
    pub max_failed_attempts: usize,
    pub lockout_window_mins: i64,
    /// Expired-token purge period; 0 disables.
    pub cleanup_interval_mins: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Dial nodes over plaintext. Never implied by missing certificates.
    pub insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub critical_percent: f64,
    pub min_free_gb: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: PathBuf::from("/var/lib/tether"),
            inventory_file: None,
            monitor: MonitorConfig::default(),
            auth: AuthConfig::default(),
            transport: TransportConfig::default(),
            disk: DiskConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            handshake_timeout_secs: 2,
            request_timeout_secs: 15,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_hours: 168,
            max_failed_attempts: 5,
            lockout_window_mins: 30,
            cleanup_interval_mins: 60,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/"),
            critical_percent: 95.0,
            min_free_gb: 1.0,
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/tether/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("tether").join("config.toml"))
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.data_dir.join("ssl")
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            tick: Duration::from_secs(self.monitor.tick_secs),
            handshake_timeout: Duration::from_secs(self.monitor.handshake_timeout_secs),
            request_timeout: Duration::from_secs(self.monitor.request_timeout_secs),
        }
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            token_ttl: chrono::Duration::hours(self.auth.token_ttl_hours),
            max_failed_attempts: self.auth.max_failed_attempts,
            lockout_window: chrono::Duration::minutes(self.auth.lockout_window_mins),
        }
    }

    pub fn disk_guard(&self) -> DiskSpaceGuard {
        DiskSpaceGuard::new(
            self.disk.path.clone(),
            self.disk.critical_percent,
            self.disk.min_free_gb,
        )
    }
}

fn figment(path: Option<&Path>, env_prefix: &str) -> Result<Figment> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    let file = match path {
        Some(p) => {
            if !p.exists() {
                bail!("config file {} does not exist", p.display());
            }
            Some(p.to_path_buf())
        }
        None => Config::default_path().ok().filter(|p| p.exists()),
    };

    if let Some(file) = file {
        let is_yaml = matches!(
            file.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        figment = if is_yaml {
            figment.merge(Yaml::file(file))
        } else {
            figment.merge(Toml::file(file))
        };
    }

    Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
}

/// Defaults, then the config file, then `TETHER_*` environment variables.
/// CLI flags are applied by the caller.
pub fn load(path: Option<&Path>) -> Result<Config> {
    figment(path, ENV_PREFIX)?
        .extract()
        .context("invalid configuration")
}
