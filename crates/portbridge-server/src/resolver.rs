//! Backend address discovery, run once before any listener starts.
//!
//! The backend host either comes straight from the config or from a
//! one-shot shell command whose stdout is scanned for a tagged line (the
//! multipass `list`-style output of the original deployment). The
//! resolved host is read-only for the rest of the process lifetime.

use portbridge_core::{BridgeError, BridgeResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

/// Shell-based discovery parameters.
#[derive(Debug, Clone)]
pub struct DiscoverySpec {
    /// Command passed to `sh -c`.
    pub command: String,
    /// Lines whose trimmed form starts with `<tag> ` are candidates.
    pub tag: String,
    /// Whitespace-separated field to extract from the matching line.
    pub index: usize,
}

/// One-shot resolver for the backend host.
pub struct TargetResolver;

impl TargetResolver {
    /// Run the discovery command and extract the backend host from its
    /// output. Not retried; a failure is startup-fatal.
    pub async fn discover(spec: &DiscoverySpec) -> BridgeResult<String> {
        info!(command = %spec.command, tag = %spec.tag, "discovering backend host");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .output()
            .await
            .map_err(|e| BridgeError::DiscoveryFailed(format!("cannot run command: {e}")))?;

        if output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr.lines().next().unwrap_or("no output");
            return Err(BridgeError::DiscoveryFailed(first.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let host = parse_discovery_output(&stdout, &spec.tag, spec.index)?;
        info!(host = %host, "backend host discovered");
        Ok(host)
    }

    /// Resolve `host:port` to a socket address via the system resolver.
    /// The first returned address wins.
    pub async fn lookup(host: &str, port: u16) -> BridgeResult<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| BridgeError::DiscoveryFailed(format!("cannot resolve {host}: {e}")))?;
        addrs
            .next()
            .ok_or_else(|| BridgeError::DiscoveryFailed(format!("no addresses for {host}")))
    }

    /// One-shot TCP probe: does anything answer on `host:port` within
    /// `timeout`? The connection is dropped immediately either way.
    pub async fn port_ready(host: &str, port: u16, timeout: Duration) -> bool {
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "port probe failed");
                false
            }
            Err(_) => {
                debug!(addr = %addr, "port probe timed out");
                false
            }
        }
    }
}

/// Extract field `index` from the first line whose trimmed form starts
/// with `<tag> `.
fn parse_discovery_output(stdout: &str, tag: &str, index: usize) -> BridgeResult<String> {
    let prefix = format!("{tag} ");
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(&prefix))
        .ok_or_else(|| {
            BridgeError::DiscoveryFailed(format!("no line tagged '{tag}' in command output"))
        })?;

    line.split_whitespace().nth(index).map(str::to_string).ok_or_else(|| {
        BridgeError::DiscoveryFailed(format!(
            "tagged line has no field at index {index}: '{line}'"
        ))
    })
}
