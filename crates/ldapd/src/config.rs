//! Server configuration file.
//!
//! All settings live in a single `ldapd.toml`, `/etc/ldapd/ldapd.toml` by
//! default:
//!
//! ```toml
//! [server]
//! conntable_size = 4096
//! idle_timeout = 300
//!
//! [server.disk]
//! enabled = true
//! threshold = 2097152
//!
//! [ports]
//! plain_port = 389
//! local_path = "/run/ldapd/ldapi"
//!
//! [limits.identities."uid=batch,ou=people,dc=example,dc=com"]
//! nsIdleTimeout = 3600
//!
//! [logs]
//! directory = "/var/log/ldapd"
//! audit = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ldapd_core::TracingOutputFormat;
use ldapd_server::{
    DEFAULT_ERROR_LOG_LEVEL, DaemonConfig, DaemonPorts, LogKind, LogSettings, StaticLimits,
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{CliError, CliResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ldapd/ldapd.toml";

/// Contents of `ldapd.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapdConfig {
    /// Connection core settings.
    pub server: DaemonConfig,

    /// Listeners.
    pub ports: DaemonPorts,

    /// Per-identity resource limits.
    pub limits: LimitSettings,

    /// Log toggles and output.
    pub logs: LogFileSettings,
}

/// Resource limits keyed by identity DN, then by limit attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub identities: BTreeMap<String, BTreeMap<String, i64>>,
}

/// Log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFileSettings {
    /// Directory holding access, audit and error logs.
    pub directory: Option<PathBuf>,

    /// Access logging.
    pub access: bool,

    /// Audit logging.
    pub audit: bool,

    /// Audit logging of failed operations.
    pub audit_fail: bool,

    /// Error log level bitmask.
    pub error_level: u32,

    /// Output format when `--log-format` is not given.
    pub format: Option<TracingOutputFormat>,
}

impl Default for LogFileSettings {
    fn default() -> Self {
        Self {
            directory: None,
            access: true,
            audit: false,
            audit_fail: false,
            error_level: DEFAULT_ERROR_LOG_LEVEL,
            format: None,
        }
    }
}

impl LdapdConfig {
    /// Loads `path`, or the default file when it exists.
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CliResult<Self> {
        toml::from_str(content).map_err(|e| CliError::config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Applies command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.ports.plain_port = Some(port);
        }
        if let Some(port) = cli.secure_port {
            self.ports.secure_port = Some(port);
        }
        if let Some(ref path) = cli.ldapi {
            self.ports.local_path = Some(path.clone());
        }
        if let Some(ref path) = cli.pid_file {
            self.server.pid_file = Some(path.clone());
        }
    }

    /// Checks everything the daemon would reject at startup.
    pub fn validate(&self) -> CliResult<()> {
        self.server.validate()?;
        if self.ports.is_empty() {
            return Err(CliError::config("no port or LDAPI socket configured"));
        }
        if self.ports.secure_port.is_some() {
            return Err(CliError::config(
                "secure_port requires a TLS acceptor, which this build does not provide",
            ));
        }
        Ok(())
    }

    /// Builds the limit source from `[limits.identities]`.
    pub fn limit_source(&self) -> StaticLimits {
        let mut limits = StaticLimits::new();
        for (dn, attrs) in &self.limits.identities {
            for (attr, value) in attrs {
                limits = limits.with_limit(dn, attr, *value);
            }
        }
        limits
    }

    /// Builds the runtime log toggles from `[logs]`.
    pub fn log_settings(&self) -> LogSettings {
        let mut settings = LogSettings::new()
            .with_enabled(LogKind::Access, self.logs.access)
            .with_enabled(LogKind::Audit, self.logs.audit)
            .with_enabled(LogKind::AuditFail, self.logs.audit_fail)
            .with_error_level(self.logs.error_level);
        if let Some(ref dir) = self.logs.directory {
            settings = settings.with_directory(dir);
        }
        settings
    }
}
