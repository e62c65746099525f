//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ldapd_core::TracingOutputFormat;

/// ldapd - LDAP directory server
#[derive(Debug, Parser)]
#[command(name = "ldapd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "LDAPD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT")]
    pub log_format: Option<TracingOutputFormat>,

    // --- Listener overrides ---
    /// Plain LDAP port
    #[arg(long, short)]
    pub port: Option<u16>,

    /// LDAPS port
    #[arg(long)]
    pub secure_port: Option<u16>,

    /// LDAPI socket path
    #[arg(long, value_name = "PATH")]
    pub ldapi: Option<PathBuf>,

    /// PID file written once the server is listening
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server in the foreground (default)
    Run,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump the effective configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}
