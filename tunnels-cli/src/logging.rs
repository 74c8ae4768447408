//! Subscriber setup: stdout plus an optional `logs/YYYY-MM-DD.log`

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Appender writing to `<dir>/YYYY-MM-DD.log`, one file per day
pub fn daily_file(dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("Failed to open log directory {:?}", dir))
}

/// Install the global subscriber; `RUST_LOG` overrides `level`
pub fn init(level: &str, log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = match log_dir {
        Some(dir) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(daily_file(dir)?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_writes_land_in_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let mut log = daily_file(&logs).unwrap();
        log.write_all(b"first\n").unwrap();
        log.write_all(b"second\n").unwrap();
        log.flush().unwrap();

        let files: Vec<_> = std::fs::read_dir(&logs)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        let name = &files[0];
        // YYYY-MM-DD.log
        assert_eq!(name.len(), 14);
        assert!(name.ends_with(".log"));
        assert_eq!(&name[4..5], "-");

        let content = std::fs::read_to_string(logs.join(name)).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
