//! CLI module for netx.
//!
//! Provides the `run` and `check` subcommands, used by the root `netx`
//! binary.

use std::io;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use netx_config::{
    CliOverrides, Config, LogConfig, apply_overrides, load_config, validate_config,
};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{CancellationToken, Registry, Server, run_with_shutdown};

/// netx command line.
#[derive(Parser, Debug)]
#[command(
    name = "netx",
    version,
    about = "Chain routing and relay tunnelling",
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every service in the config until interrupted.
    #[command(alias = "serve")]
    Run(RunArgs),
    /// Parse, validate and build the config without listening.
    Check(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path (json/jsonc/yaml/toml)
    #[arg(short, long, default_value = "netx.yaml")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: CliOverrides,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check(args) => check(args).await,
    }
}

fn load(args: &RunArgs) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args.overrides);
    validate_config(&config)?;
    Ok(config)
}

/// Run the server with the given arguments.
pub async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(&args)?;
    init_tracing(&config.log);

    if let Some(metrics) = &config.metrics {
        match netx_metrics::init_prometheus(&metrics.addr) {
            Ok(()) => info!(addr = %metrics.addr, "metrics exporter listening"),
            Err(e) => warn!("failed to start metrics exporter: {}", e),
        }
    }

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    run_with_shutdown(&config, Registry::with_defaults(), shutdown).await?;
    Ok(())
}

/// Validate and build the config, then print what would run.
pub async fn check(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(&args)?;
    let server = Server::build(&config, Registry::with_defaults())?;
    for svc in &config.services {
        println!(
            "service {}: {} handler on {} ({})",
            svc.name, svc.handler.kind, svc.addr, svc.listener.kind
        );
    }
    let registry = server.registry();
    println!(
        "{} service(s), {} chain(s), {} hop(s)",
        server.services().len(),
        registry.chains.len(),
        server.hops().len()
    );
    println!("{}: ok", args.config.display());
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Build the `EnvFilter` directive string: base level, then per-module
/// overrides.
fn filter_directives(config: &LogConfig) -> String {
    let mut filter = config.level.as_deref().unwrap_or("info").to_string();
    for (module, level) in &config.filters {
        filter.push(',');
        filter.push_str(module);
        filter.push('=');
        filter.push_str(level);
    }
    filter
}

/// Initialize the tracing subscriber.
///
/// - `format`: json, compact or pretty (default)
/// - `output`: stdout or stderr (default)
fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(filter_directives(config))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let writer = match config.output.as_deref() {
        Some("stdout") => BoxMakeWriter::new(io::stdout),
        _ => BoxMakeWriter::new(io::stderr),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format.as_deref().unwrap_or("pretty") {
        "json" => registry.with(fmt::layer().json().with_writer(writer)).init(),
        "compact" => registry
            .with(fmt::layer().compact().with_writer(writer))
            .init(),
        _ => registry.with(fmt::layer().with_writer(writer)).init(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_subcommands_and_overrides() {
        let cli = Cli::try_parse_from([
            "netx",
            "run",
            "-c",
            "/etc/netx.yaml",
            "--log-level",
            "debug",
            "--max-connections",
            "64",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from("/etc/netx.yaml"));
        assert_eq!(args.overrides.log_level.as_deref(), Some("debug"));
        assert_eq!(args.overrides.max_connections, Some(64));

        let cli = Cli::try_parse_from(["netx", "check"]).unwrap();
        let Command::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(args.config, PathBuf::from("netx.yaml"));
    }

    #[test]
    fn filter_directives_append_module_levels() {
        let mut log = LogConfig::default();
        assert_eq!(filter_directives(&log), "info");
        log.level = Some("warn".into());
        log.filters.insert("netx_relay".into(), "trace".into());
        log.filters.insert("hickory_proto".into(), "error".into());
        assert_eq!(
            filter_directives(&log),
            "warn,hickory_proto=error,netx_relay=trace"
        );
    }

    #[tokio::test]
    async fn check_builds_config_file() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        f.write_all(b"services:\n  - {name: relay-in, addr: \"127.0.0.1:0\"}\n")
            .unwrap();
        let args = RunArgs {
            config: f.path().to_path_buf(),
            overrides: CliOverrides::default(),
        };
        check(args).await.unwrap();
    }

    #[tokio::test]
    async fn check_rejects_dangling_reference() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        f.write_all(b"services:\n  - {name: s, addr: \":0\", handler: {chain: missing}}\n")
            .unwrap();
        let args = RunArgs {
            config: f.path().to_path_buf(),
            overrides: CliOverrides::default(),
        };
        assert!(check(args).await.is_err());
    }
}
