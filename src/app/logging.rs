//! logging stuff
use {
    crate::settings::{LoggingConfig, LoggingFormat},
    color_eyre::Result,
    tracing::{Level, info, subscriber},
    tracing_subscriber::FmtSubscriber,
};

/// setup logging from the `logging.*` settings
pub fn setup(cfg: &LoggingConfig) -> Result<()> {
    if !cfg.enable {
        return Ok(());
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(string_to_log_level(&cfg.level))
        .with_ansi(cfg.ansi)
        .with_line_number(cfg.line_numbers)
        .with_target(cfg.event_targets);

    match cfg.format {
        LoggingFormat::Pretty => {
            subscriber::set_global_default(subscriber.pretty().finish())?;
        }
        LoggingFormat::Compact => {
            subscriber::set_global_default(subscriber.compact().finish())?;
        }
    }

    info!("logging setup successfully");
    Ok(())
}

/// convert a string to a log level
pub fn string_to_log_level(lvl: &str) -> Level {
    match lvl.to_lowercase().as_str() {
        "t" | "trace" | "trc" => Level::TRACE,
        "d" | "debug" | "dbg" => Level::DEBUG,
        "i" | "info" | "inf" => Level::INFO,
        "w" | "warn" | "wrn" => Level::WARN,
        _ => Level::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(string_to_log_level("debug"), Level::DEBUG);
        assert_eq!(string_to_log_level("I"), Level::INFO);
        assert_eq!(string_to_log_level("nonsense"), Level::ERROR);
    }
}
