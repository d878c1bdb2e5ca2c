use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global fmt subscriber. The level comes from the CLI override, then
/// `[logging].level`, then `info`.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let level = resolve_log_level(config, cli_level_override)?;

    let installed = match resolve_log_format(config) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(true)
            .pretty()
            .try_init(),
    };
    installed.map_err(|err| anyhow!("install tracing subscriber: {err}"))
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let configured = config
        .logging
        .as_ref()
        .and_then(|logging| logging.level.as_deref());
    let raw_level = cli_level_override
        .or(configured)
        .unwrap_or(DEFAULT_LOG_LEVEL);

    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!("invalid log level `{raw_level}`; use trace, debug, info, warn, error or off")
        })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
