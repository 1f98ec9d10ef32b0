//! LDAP proxy daemon.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ldap_proxy::ProxyHandler;
use ldap_proxy_core::config::ProxyConfig;

mod cli;

use cli::{Cli, Command, LogFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format) {
        eprintln!("Failed to setup tracing: {e:#}");
        return ExitCode::FAILURE;
    }

    let outcome = match cli.command {
        Some(Command::Check) => check(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over `--log-level` when set.
fn setup_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?,
    };
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).try_init()?,
        LogFormat::Text => subscriber.with(fmt::layer()).try_init()?,
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = ProxyConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.serv_addr = listen.to_string();
    }
    Ok(config)
}

fn check(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let listen = config.listen_addr()?;
    let handler = ProxyHandler::from_config(&config).context("failed to build backends")?;

    println!("{} is valid, listening on {listen}", cli.config.display());
    println!("Routing table ({} backends):", handler.router().len());
    for backend in handler.router().backends() {
        let url = config
            .ldap_config
            .iter()
            .find(|candidate| candidate.suffix_dn == backend.suffix())
            .map_or("", |candidate| candidate.ldap_url.as_str());
        let suffix = if backend.suffix().is_empty() {
            "(any)"
        } else {
            backend.suffix()
        };
        println!(
            "  {suffix} -> {url} (pool {})",
            backend.pool().max_idle()
        );
    }
    Ok(())
}

async fn run_server(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let listen = config.listen_addr()?;
    let handler = Arc::new(ProxyHandler::from_config(&config).context("failed to build backends")?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %listen,
        backends = handler.router().len(),
        debug = config.debug,
        "Starting LDAP proxy"
    );

    tokio::select! {
        result = ldap_proxy::serve(listen, handler) => {
            result.with_context(|| format!("failed to listen on {listen}"))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to wait for Ctrl-C")?;
            info!("Shutdown requested");
        }
    }

    info!("LDAP proxy stopped");
    Ok(())
}
