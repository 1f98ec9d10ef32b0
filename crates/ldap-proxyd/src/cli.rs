//! Command-line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// LDAP proxy: routes, rewrites and pools directory requests across upstream servers
#[derive(Parser, Debug)]
#[command(name = "ldap-proxyd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(
        short,
        long,
        default_value = "config.yaml",
        env = "LDAP_PROXY_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Listen address, overrides `servAddr`
    #[arg(long, env = "LDAP_PROXY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "LDAP_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format
    #[arg(
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "LDAP_PROXY_LOG_FORMAT",
        global = true
    )]
    pub log_format: LogFormat,

    /// Subcommand (optional - defaults to serving)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the proxy (default)
    Serve,

    /// Validate the configuration and print the routing table
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["ldap-proxyd"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(cli.listen.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn check_with_overrides() {
        let cli = Cli::try_parse_from([
            "ldap-proxyd",
            "-c",
            "/etc/ldap-proxy.yaml",
            "--listen",
            "127.0.0.1:3389",
            "--log-format",
            "json",
            "check",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/ldap-proxy.yaml"));
        assert_eq!(cli.listen, Some("127.0.0.1:3389".parse().unwrap()));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.command, Some(Command::Check));
    }

    #[test]
    fn rejects_bad_listen_address() {
        assert!(Cli::try_parse_from(["ldap-proxyd", "--listen", "localhost"]).is_err());
    }
}
