//! Logging setup with indicatif integration

use indicatif::MultiProgress;

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// Default filter for the given flags. `RUST_LOG` still wins.
///
/// TTY runs default to `warn` since the run bar already shows progress.
pub fn default_level(debug: bool, quiet: bool, tty: bool) -> &'static str {
    if debug {
        "debug"
    } else if quiet || tty {
        "warn"
    } else {
        "info"
    }
}

/// Logger that prints above the run's progress bars instead of through them.
pub struct IndicatifLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        let (pre, label, post) = level_style(record.level(), true);
        let line = format!("[{pre}{label}{post}] {}", record.args());
        self.multi.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the global logger.
///
/// With `multi` (TTY), log lines are routed through the progress bars;
/// otherwise a plain uncolored `env_logger` is used.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    multi: Option<&MultiProgress>,
) -> Result<(), log::SetLoggerError> {
    use std::io::Write;

    let level = default_level(debug, quiet, multi.is_some());
    let env = env_logger::Env::default().default_filter_or(level);

    match multi {
        Some(multi) => {
            let logger = env_logger::Builder::from_env(env)
                .format_timestamp_millis()
                .build();
            let max_level = logger.filter();
            log::set_boxed_logger(Box::new(IndicatifLogger::new(logger, multi.clone())))?;
            log::set_max_level(max_level);
            Ok(())
        }
        None => env_logger::Builder::from_env(env)
            .format(|buf, record| {
                let (_, label, _) = level_style(record.level(), false);
                writeln!(buf, "[{label}] {}", record.args())
            })
            .try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_overrides_everything() {
        assert_eq!(default_level(true, true, true), "debug");
        assert_eq!(default_level(true, false, false), "debug");
    }

    #[test]
    fn tty_defaults_to_warn() {
        assert_eq!(default_level(false, false, true), "warn");
    }

    #[test]
    fn plain_defaults_to_info() {
        assert_eq!(default_level(false, false, false), "info");
        assert_eq!(default_level(false, true, false), "warn");
    }

    #[test]
    fn labels_padded_to_five() {
        for level in [log::Level::Error, log::Level::Warn, log::Level::Info, log::Level::Debug] {
            let (pre, label, post) = level_style(level, false);
            assert_eq!(label.len(), 5);
            assert!(pre.is_empty() && post.is_empty());
        }
    }
}
