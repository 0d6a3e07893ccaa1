//! Proxy configuration: TOML file + CLI overrides.
//!
//! All of this is startup-only; the resolved [`ProxyConfig`] is read-only
//! once listeners are running. Invalid configuration is never retried.

use crate::resolver::DiscoverySpec;
use portbridge_core::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    /// (source_port, target_port) pairs sharing one resolved host.
    #[serde(default)]
    pub forwards: Vec<ForwardPair>,
    pub target: TargetSection,
    /// Allow-list entries: literals and `<prefix>.*` wildcards.
    #[serde(default)]
    pub allow: Vec<String>,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_source_ip")]
    pub source_ip: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub restart_trigger_ports: Vec<u16>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            source_ip: default_source_ip(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            restart_trigger_ports: Vec::new(),
        }
    }
}

/// One forwarding endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ForwardPair {
    pub source_port: u16,
    pub target_port: u16,
}

/// `[target]` section: a static host or a discovery command, exactly one.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSection {
    pub host: Option<String>,
    pub discovery: Option<DiscoverySection>,
}

/// `[target.discovery]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    pub command: String,
    pub tag: String,
    pub index: usize,
}

fn default_source_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_connect_timeout() -> u64 {
    10
}

/// How the backend host is obtained at startup.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    Static(String),
    Discover(DiscoverySpec),
}

/// Resolved configuration (defaults applied, CLI overrides merged).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub source_ip: IpAddr,
    pub forwards: Vec<ForwardPair>,
    pub target: TargetSpec,
    pub allow: Vec<String>,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub restart_trigger_ports: HashSet<u16>,
}

impl ProxyConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: &Path,
        cli_source_ip: Option<&str>,
        cli_idle_timeout: Option<u64>,
    ) -> BridgeResult<Self> {
        let expanded = expand_tilde(config_path);
        if !expanded.exists() {
            return Err(BridgeError::ConfigInvalid(format!(
                "missing config file {}",
                expanded.display()
            )));
        }
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded)
            .map_err(|e| BridgeError::ConfigInvalid(format!("cannot read config: {e}")))?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| BridgeError::ConfigInvalid(format!("config parse error: {e}")))?;
        Self::resolve(file, cli_source_ip, cli_idle_timeout)
    }

    /// Validate a parsed file and merge CLI overrides on top.
    pub(crate) fn resolve(
        file: ConfigFile,
        cli_source_ip: Option<&str>,
        cli_idle_timeout: Option<u64>,
    ) -> BridgeResult<Self> {
        if file.forwards.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "no forwards configured".to_string(),
            ));
        }

        let target = match (file.target.host, file.target.discovery) {
            (Some(host), None) => TargetSpec::Static(host),
            (None, Some(d)) => TargetSpec::Discover(DiscoverySpec {
                command: d.command,
                tag: d.tag,
                index: d.index,
            }),
            (Some(_), Some(_)) => {
                return Err(BridgeError::ConfigInvalid(
                    "target.host and target.discovery are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(BridgeError::ConfigInvalid(
                    "target requires either host or discovery".to_string(),
                ))
            }
        };

        let source_ip_str = cli_source_ip
            .map(str::to_string)
            .unwrap_or(file.proxy.source_ip);
        let source_ip: IpAddr = source_ip_str
            .parse()
            .map_err(|_| BridgeError::ConfigInvalid(format!("invalid source_ip '{source_ip_str}'")))?;

        let idle_timeout_secs = cli_idle_timeout.unwrap_or(file.proxy.idle_timeout_secs);

        if file.allow.is_empty() {
            warn!("allow-list is empty: every inbound connection will be rejected");
        }

        Ok(Self {
            source_ip,
            forwards: file.forwards,
            target,
            allow: file.allow,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            connect_timeout: Duration::from_secs(file.proxy.connect_timeout_secs),
            restart_trigger_ports: file.proxy.restart_trigger_ports.into_iter().collect(),
        })
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
