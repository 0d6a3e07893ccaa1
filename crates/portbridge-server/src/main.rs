//! portbridge-server: authorizing TCP port-forwarding proxy.
//!
//! Resolves the backend host once at startup, then runs one listener per
//! configured (source_port, target_port) pair. Listeners share the
//! shutdown coordinator and the process instance id, nothing else.

mod config;
mod listener;
mod registry;
mod relay;
mod resolver;
mod shutdown;

use clap::Parser;
use config::{ProxyConfig, TargetSpec};
use futures_util::future::join_all;
use listener::{ListenerBinding, ListenerService};
use portbridge_core::{instance_id, AllowList, BridgeError};
use resolver::TargetResolver;
use shutdown::ShutdownCoordinator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// portbridge-server — authorizing TCP port-forwarding proxy
#[derive(Parser, Debug)]
#[command(name = "portbridge-server", version, about = "Authorizing TCP port-forwarding proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.portbridge/config.toml")]
    config: String,

    /// Listen address override
    #[arg(long)]
    source_ip: Option<String>,

    /// Idle timeout override, in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Skip the startup source/target port probes
    #[arg(long)]
    skip_probes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let instance = instance_id();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %instance,
        "starting portbridge-server"
    );

    let cfg = match ProxyConfig::load(
        Path::new(&cli.config),
        cli.source_ip.as_deref(),
        cli.idle_timeout,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Resolve the backend host once, before any listener starts. The
    // result is read-only for the rest of the process lifetime.
    let host = match &cfg.target {
        TargetSpec::Static(host) => host.clone(),
        TargetSpec::Discover(spec) => match TargetResolver::discover(spec).await {
            Ok(host) => host,
            Err(e) => {
                error!(error = %e, "unable to obtain target address");
                std::process::exit(1);
            }
        },
    };

    if !cli.skip_probes {
        for fwd in &cfg.forwards {
            if TargetResolver::port_ready("127.0.0.1", fwd.source_port, PROBE_TIMEOUT).await {
                error!(port = fwd.source_port, "source port is already in use");
                std::process::exit(1);
            }
            if !TargetResolver::port_ready(&host, fwd.target_port, PROBE_TIMEOUT).await {
                error!(host = %host, port = fwd.target_port, "target does not respond");
                std::process::exit(1);
            }
        }
    }

    let allow = Arc::new(AllowList::parse(&cfg.allow));
    info!(entries = allow.len(), "allow-list loaded");

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<BridgeError>(4);

    let mut tasks = Vec::new();
    for fwd in &cfg.forwards {
        let target = match TargetResolver::lookup(&host, fwd.target_port).await {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "cannot resolve target endpoint");
                std::process::exit(1);
            }
        };
        let binding = ListenerBinding {
            source_ip: cfg.source_ip,
            source_port: fwd.source_port,
            target,
            idle_timeout: cfg.idle_timeout,
            connect_timeout: cfg.connect_timeout,
            restart_trigger_ports: cfg.restart_trigger_ports.clone(),
        };
        let svc = ListenerService::new(binding, allow.clone(), fatal_tx.clone());
        let cancel = coordinator.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = svc.run(cancel).await {
                error!(error = %e, "listener failed");
            }
        }));
    }
    drop(fatal_tx);

    // Signal watcher: first signal starts the drain, later ones only log.
    let coord = coordinator.clone();
    tokio::spawn(async move {
        loop {
            let reason = shutdown_signal().await;
            coord.trigger(reason);
        }
    });

    let listeners = join_all(tasks);
    tokio::pin!(listeners);
    tokio::select! {
        Some(fatal) = fatal_rx.recv() => {
            // Deliberate escalation: let an external supervisor restart us.
            error!(error = %fatal, "stopping: backend does not respond");
            std::process::exit(1);
        }
        _ = &mut listeners => {}
    }

    coordinator.mark_stopped();
    info!(instance = %instance, "portbridge-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), reporting which one arrived.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => "interrupt",
            _ = sigterm.recv() => "terminate",
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        "interrupt"
    }
}
