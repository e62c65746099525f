//! Run command: starts the server in the foreground.
//!
//! Wires the configured collaborators around the connection core:
//! - file-backed log toggles from `[logs]`
//! - static per-identity limits from `[limits.identities]`
//! - a handler that drains client data until a protocol layer is attached

use std::sync::Arc;

use ldapd_server::{Collaborators, Daemon, DiscardHandler, ShutdownReason};
use tracing::info;

use crate::config::LdapdConfig;
use crate::error::CliResult;

/// Runs the daemon until shutdown and returns why it stopped.
pub fn run(config: &LdapdConfig) -> CliResult<ShutdownReason> {
    config.validate()?;

    let collaborators = Collaborators::new(DiscardHandler)
        .with_logs(Arc::new(config.log_settings()))
        .with_limits(config.limit_source());

    let daemon = Daemon::new(config.server.clone(), &config.ports, collaborators)?;
    info!(
        addrs = ?daemon.local_addrs(),
        identities = config.limits.identities.len(),
        "ldapd ready"
    );
    Ok(daemon.run()?)
}

/// Process exit code for a shutdown reason.
pub fn exit_code(reason: ShutdownReason) -> u8 {
    match reason {
        ShutdownReason::DiskFull => 1,
        ShutdownReason::Running | ShutdownReason::Signal | ShutdownReason::Exit => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;

    #[test]
    fn disk_full_exits_nonzero() {
        assert_eq!(exit_code(ShutdownReason::DiskFull), 1);
        assert_eq!(exit_code(ShutdownReason::Signal), 0);
        assert_eq!(exit_code(ShutdownReason::Exit), 0);
    }

    #[test]
    fn invalid_config_fails_before_binding() {
        let config = LdapdConfig::parse("[server]\nconntable_size = 2\nreserved_descriptors = 4\n").unwrap();
        assert!(matches!(run(&config), Err(CliError::Server(_))));
    }
}
