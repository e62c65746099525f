//! ldapd entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use ldapd::cli::{Cli, Command, ConfigAction};
use ldapd::commands;
use ldapd::config::LdapdConfig;
use ldapd::error::CliResult;
use ldapd_core::{TracingConfig, init_tracing};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match LdapdConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli(&cli);

    let mut tracing = if cli.debug {
        TracingConfig::debug()
    } else {
        TracingConfig::default()
    };
    if let Some(format) = cli.log_format.or(config.logs.format) {
        tracing = tracing.with_format(format);
    }
    if let Err(e) = init_tracing(tracing) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli, &config) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "ldapd failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &LdapdConfig) -> CliResult<u8> {
    match cli.command {
        Some(Command::Config { ref action }) => {
            match action {
                ConfigAction::Dump => commands::config::dump(config, cli.config.as_deref())?,
                ConfigAction::Validate => commands::config::validate(config)?,
                ConfigAction::Path => commands::config::path(cli.config.as_deref())?,
            }
            Ok(0)
        }
        Some(Command::Run) | None => {
            let reason = commands::run::run(config)?;
            Ok(commands::run::exit_code(reason))
        }
    }
}
