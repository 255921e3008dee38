//! Logging setup.
//!
//! One fmt subscriber for the whole process: pretty output for a
//! device console, JSON when the logs are shipped somewhere. An
//! explicit `RUST_LOG` wins over the configured level, and output can
//! be teed to a file for postmortem reads off the headset.

use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Install the process-wide subscriber. Call once, before anything
/// worth logging happens.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = validate_level(&config.level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = config.format.as_str() == "json";
    let builder = fmt().with_env_filter(filter).with_target(true);

    match (&config.file_path, json) {
        (Some(path), true) => builder.json().with_writer(log_file(path)?).init(),
        (Some(path), false) => builder.with_writer(log_file(path)?).init(),
        (None, true) => builder.json().init(),
        (None, false) => builder.init(),
    }
    Ok(())
}

/// A bare word would silently parse as an `EnvFilter` target
/// directive, so the configured level is checked against the known
/// set instead of being handed over as-is.
fn validate_level(level: &str) -> anyhow::Result<String> {
    let level = level.to_ascii_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        anyhow::bail!("Unrecognized log level {level:?}; expected one of {LEVELS:?}");
    }
    Ok(level)
}

fn log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = File::options().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_levels_are_accepted_case_insensitively() {
        for level in ["trace", "DEBUG", "Info", "warn", "error"] {
            let validated = validate_level(level).unwrap();
            assert_eq!(validated, level.to_ascii_lowercase());
        }
    }

    #[test]
    fn unknown_levels_are_rejected_not_treated_as_targets() {
        assert!(validate_level("verbose").is_err());
        assert!(validate_level("").is_err());
        // Full filter directives belong in RUST_LOG, not here.
        assert!(validate_level("info,sqlx=debug").is_err());
    }

    #[test]
    fn log_file_appends_rather_than_truncates() {
        let dir = std::env::temp_dir().join(format!("cinesync-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.log");
        std::fs::write(&path, b"earlier run\n").unwrap();

        let _handle = log_file(path.to_str().unwrap()).unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"earlier run\n", "opening must not truncate");

        std::fs::remove_dir_all(&dir).ok();
    }
}
