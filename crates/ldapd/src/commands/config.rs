//! Configuration commands.

use std::path::Path;

use crate::config::LdapdConfig;
use crate::error::{CliError, CliResult};

/// Renders the effective configuration as TOML.
pub fn render(config: &LdapdConfig) -> CliResult<String> {
    toml::to_string_pretty(config)
        .map_err(|e| CliError::config(format!("failed to serialize config: {}", e)))
}

/// Dump the effective configuration to stdout.
pub fn dump(config: &LdapdConfig, path: Option<&Path>) -> CliResult<()> {
    let rendered = render(config)?;
    let source = path.map_or_else(LdapdConfig::default_path, Path::to_path_buf);
    println!("# ldapd.toml ({})", source.display());
    println!("{}", rendered);
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &LdapdConfig) -> CliResult<()> {
    config.validate()?;
    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path(path: Option<&Path>) -> CliResult<()> {
    let source = path.map_or_else(LdapdConfig::default_path, Path::to_path_buf);
    println!("config: {}", source.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_sections() {
        let rendered = render(&LdapdConfig::default()).unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("[server.disk]"));
        assert!(rendered.contains("[ports]"));
        assert!(rendered.contains("[logs]"));
    }
}
