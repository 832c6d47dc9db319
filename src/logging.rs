use crate::paths::Paths;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV: &str = "COMFY_LAUNCHER_LOG";

/// Level for the file log; `COMFY_LAUNCHER_LOG` overrides it.
pub fn default_directive(verbosity: u8) -> &'static str {
    if verbosity > 0 { "debug" } else { "info" }
}

/// Level for the terminal. Quiet unless asked, so command output stays clean.
pub fn stderr_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// Install the global subscriber: compact stderr output plus a non-blocking
/// `launcher.log` in the log directory. Keep the guard alive until exit.
pub fn init(paths: &Paths, verbosity: u8) -> color_eyre::Result<WorkerGuard> {
    let log_dir = paths.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::never(&log_dir, paths.log_file_name());
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); using defaults");
            EnvFilter::new(default_directive(verbosity))
        }),
        Err(_) => EnvFilter::new(default_directive(verbosity)),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(filter);
    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_level(verbosity));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .ok();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(default_directive(0), "info");
        assert_eq!(default_directive(2), "debug");
        assert_eq!(stderr_level(0), LevelFilter::WARN);
        assert_eq!(stderr_level(1), LevelFilter::INFO);
        assert_eq!(stderr_level(3), LevelFilter::DEBUG);
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let _guard = init(&paths, 0).unwrap();
        assert!(paths.log_dir().is_dir());
    }
}
