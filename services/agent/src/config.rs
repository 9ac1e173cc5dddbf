//! Agent configuration loading.
//!
//! The agent is configured from a TOML file; `QUARRY_*` environment
//! variables name the file and override the top-level knobs. Validation
//! failures are fatal at startup.

use std::path::Path;

use anyhow::{Context, Result};

use quarry_core::config::AgentConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/quarry/config.toml";

/// Load the configuration named by `QUARRY_CONFIG_FILE` and apply the
/// environment overrides.
pub fn load() -> Result<AgentConfig> {
    let path = std::env::var("QUARRY_CONFIG_FILE")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_file(Path::new(&path))?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn load_file(path: &Path) -> Result<AgentConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    AgentConfig::from_toml(&raw)
        .map_err(|err| anyhow::anyhow!("parsing {}: {err}", path.display()))
}

fn apply_env_overrides(config: &mut AgentConfig) -> Result<()> {
    if let Ok(value) = std::env::var("QUARRY_CONCURRENT") {
        config.concurrent = value
            .parse()
            .context("QUARRY_CONCURRENT must be an integer")?;
    }
    if let Ok(value) = std::env::var("QUARRY_CHECK_INTERVAL_SECS") {
        config.check_interval_secs = value
            .parse()
            .context("QUARRY_CHECK_INTERVAL_SECS must be an integer")?;
    }
    if let Ok(value) = std::env::var("QUARRY_SHUTDOWN_TIMEOUT_SECS") {
        config.shutdown_timeout_secs = value
            .parse()
            .context("QUARRY_SHUTDOWN_TIMEOUT_SECS must be an integer")?;
    }
    Ok(())
}
