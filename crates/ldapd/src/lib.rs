//! CLI, configuration file and startup wiring
//!
//! This crate provides the `ldapd` executable.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::Cli;
pub use config::LdapdConfig;
pub use error::{CliError, CliResult};
