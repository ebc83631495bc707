//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ignet_core::{NodeConfig, SpoolDirs, Timeouts};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/ignet/config.toml or /etc/ignet/config.toml.
/// Env overrides: IGNET_NODE_NAME, IGNET_POLL_INTERVAL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our node name, sent with NETP.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Local IPv4 address outgoing connections bind to.
    #[serde(default)]
    pub bind_address: Option<std::net::Ipv4Addr>,
    /// Minimum seconds between full polls of every neighbor.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How often the poller looks for outbound spool work.
    #[serde(default = "default_poll_tick")]
    pub poll_tick_secs: u64,
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, rename = "neighbor")]
    pub neighbors: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpoolConfig {
    #[serde(default = "default_net_in")]
    pub net_in: PathBuf,
    #[serde(default = "default_net_out")]
    pub net_out: PathBuf,
    #[serde(default = "default_tmp")]
    pub tmp: PathBuf,
    /// Administrator mailbox: one file per notice.
    #[serde(default = "default_aide")]
    pub aide: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_line_secs")]
    pub line_secs: u64,
    #[serde(default = "default_blob_secs")]
    pub blob_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn default_node_name() -> String {
    "localnode".to_string()
}
fn default_poll_interval() -> u64 {
    3600
}
fn default_poll_tick() -> u64 {
    60
}
fn default_net_in() -> PathBuf {
    PathBuf::from("/var/spool/ignet/netin")
}
fn default_net_out() -> PathBuf {
    PathBuf::from("/var/spool/ignet/netout")
}
fn default_tmp() -> PathBuf {
    PathBuf::from("/var/spool/ignet/nettmp")
}
fn default_aide() -> PathBuf {
    PathBuf::from("/var/spool/ignet/aide")
}
fn default_connect_secs() -> u64 {
    100
}
fn default_line_secs() -> u64 {
    100
}
fn default_blob_secs() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            bind_address: None,
            poll_interval_secs: default_poll_interval(),
            poll_tick_secs: default_poll_tick(),
            spool: SpoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            debug: false,
            neighbors: Vec::new(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            net_in: default_net_in(),
            net_out: default_net_out(),
            tmp: default_tmp(),
            aide: default_aide(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            line_secs: default_line_secs(),
            blob_secs: default_blob_secs(),
        }
    }
}

impl Config {
    pub fn spool_dirs(&self) -> SpoolDirs {
        SpoolDirs {
            net_in: self.spool.net_in.clone(),
            net_out: self.spool.net_out.clone(),
            tmp: self.spool.tmp.clone(),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.timeouts.connect_secs),
            line: Duration::from_secs(self.timeouts.line_secs),
            blob: Duration::from_secs(self.timeouts.blob_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_secs(self.poll_tick_secs.max(1))
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c);
    Ok(c)
}

fn apply_env(c: &mut Config) {
    if let Ok(s) = std::env::var("IGNET_NODE_NAME") {
        if !s.is_empty() {
            c.node_name = s;
        }
    }
    if let Ok(s) = std::env::var("IGNET_POLL_INTERVAL") {
        if let Ok(secs) = s.parse::<u64>() {
            c.poll_interval_secs = secs;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ignet/config.toml"));
    }
    out.push(PathBuf::from("/etc/ignet/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
