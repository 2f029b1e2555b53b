//! Probe configuration, loaded from YAML plus environment overrides
//! (SPEC_FULL.md §6 "Config file format"), the way `angzarr`'s
//! `src/config/mod.rs` layers `config::Config` over env vars.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name, tried first in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "vantage-probe.yaml";
/// Env var naming an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "VANTAGE_CONFIG";
/// Prefix for environment-variable overrides (`VANTAGE__HOST__HOST_ID=foo`).
pub const CONFIG_ENV_PREFIX: &str = "VANTAGE";
/// Env var read by the binary to configure `tracing_subscriber::EnvFilter`.
pub const LOG_ENV_VAR: &str = "VANTAGE_LOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Top-level probe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This host's stable identifier, prefixed onto every NodeID (spec.md §3).
    /// Defaults to the machine's hostname at load time.
    pub host_id: String,
    /// Probe loop tick interval (spec.md §4.7, default 1s).
    #[serde(with = "humantime_serde")]
    pub publish_interval: Duration,
    /// Per-`Report()` call timeout budget (spec.md §4.7 step 1).
    #[serde(with = "humantime_serde")]
    pub reporter_timeout: Duration,
    pub host: HostConfig,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
    pub conntrack: ConntrackConfig,
    pub sniffer: SnifferConfig,
    pub resolver: ResolverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: default_host_id(),
            publish_interval: Duration::from_secs(1),
            reporter_timeout: Duration::from_millis(500),
            host: HostConfig::default(),
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            conntrack: ConntrackConfig::default(),
            sniffer: SnifferConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

fn default_host_id() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub enabled: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,
    /// Docker daemon socket; `None` uses bollard's platform default.
    pub socket: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "docker"),
            socket: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub enabled: bool,
    /// Namespace to watch; `None` watches cluster-wide.
    pub namespace: Option<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "kubernetes"),
            namespace: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    pub enabled: bool,
    /// Seed `activeFlows` from a `conntrack -L` snapshot at startup (spec.md §4.4).
    pub existing_connections: bool,
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "conntrack"),
            existing_connections: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnifferConfig {
    pub enabled: bool,
    pub device: String,
    /// Fraction of wall-clock time spent decoding (spec.md §4.5 "Duty-cycling").
    pub sample_rate: f64,
    /// The `on + off` window `sample_rate` is divided over (spec.md §9 `quantum`).
    #[serde(with = "humantime_serde")]
    pub quantum: Duration,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "sniffer"),
            device: "eth0".to_string(),
            sample_rate: 0.01,
            quantum: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    #[serde(with = "humantime_serde")]
    pub throttle: Duration,
    #[serde(with = "humantime_serde")]
    pub negative_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(1),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from (in increasing priority order): defaults,
    /// `vantage-probe.yaml` in the working directory, the file named by
    /// `--config`/`VANTAGE_CONFIG`, then `VANTAGE__*` environment variables
    /// (SPEC_FULL.md §6).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Environment, File, FileFormat};

        let mut builder = ::config::Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        } else if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loadable_without_a_config_file() {
        let config = Config::default();
        assert_eq!(config.publish_interval, Duration::from_secs(1));
        assert!(!config.host_id.is_empty());
    }
}
