use anyhow::Context as _;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

/// Installs the global tracing subscriber for a CLI run. The level comes
/// from the `--log-level` flag when given, else `[logging].level`, else
/// `info`; the format from `[logging].format`, defaulting to JSON.
pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<()> {
    let raw_level = cli_level
        .or_else(|| config.logging.as_ref()?.level.as_deref())
        .unwrap_or("info");
    let level = parse_level(raw_level)?;

    let format = config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json);

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .ok()
        .with_context(|| {
            format!("unrecognized log level `{raw}` (use trace, debug, info, warn, error, or off)")
        })
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::parse_level;

    #[test]
    fn known_levels_parse_case_insensitively() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level(" warn ").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
    }

    #[test]
    fn unknown_level_is_rejected_with_hint() {
        let err = parse_level("verbose").unwrap_err();
        assert!(
            err.to_string().contains("unrecognized log level `verbose`"),
            "unexpected error: {err}"
        );
    }
}
