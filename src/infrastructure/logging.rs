use crate::domain::settings::LogSettings;
use crate::DIAGNOSTICS_TARGET;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // We need to keep this guard alive for logs to be flushed
    _guards: Vec<WorkerGuard>,
}

fn parse_rotation(rotation: &str) -> Rotation {
    match rotation.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Only events sent to the diagnostics target, at info and above.
fn diagnostics_filter() -> Targets {
    Targets::new().with_target(DIAGNOSTICS_TARGET, Level::INFO)
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    // Parse log level
    let level_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Console layer
    let console_layer = if settings.console_logging_enabled {
        Some(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target)
                .with_ansi(settings.ansi_colors)
                .with_filter(level_filter),
        )
    } else {
        None
    };

    // File layers: the full log plus a separate diagnostics stream that an
    // uploader can ship as is.
    let (file_layer, diagnostics_layer) = if settings.file_logging_enabled {
        let rotation = parse_rotation(&settings.rotation);

        let file_appender = RollingFileAppender::new(
            rotation.clone(),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);

        let diagnostics_appender = RollingFileAppender::new(
            rotation,
            &settings.log_dir,
            format!("{}.diagnostics", settings.file_name_prefix),
        );
        let (diagnostics_writer, guard) = tracing_appender::non_blocking(diagnostics_appender);
        guards.push(guard);

        let file_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::from_str(&settings.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        (
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false) // File logs shouldn't have ANSI colors
                    .with_file(settings.show_file_line)
                    .with_line_number(settings.show_file_line)
                    .with_thread_ids(settings.show_thread_ids)
                    .with_target(settings.show_target)
                    .with_filter(file_filter),
            ),
            Some(
                fmt::layer()
                    .json()
                    .with_writer(diagnostics_writer)
                    .with_ansi(false)
                    .with_filter(diagnostics_filter()),
            ),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(diagnostics_layer)
        .try_init()?;

    tracing::info!("Logging initialized successfully");

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(parse_rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(parse_rotation("never"), Rotation::NEVER);
        assert_eq!(parse_rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_diagnostics_filter_only_passes_its_target() {
        let filter = diagnostics_filter();
        assert!(filter.would_enable(DIAGNOSTICS_TARGET, &Level::INFO));
        assert!(filter.would_enable(DIAGNOSTICS_TARGET, &Level::ERROR));
        assert!(!filter.would_enable(DIAGNOSTICS_TARGET, &Level::DEBUG));
        assert!(!filter.would_enable("inear_link::domain", &Level::ERROR));
    }
}
