//! provides logging helpers

use std::env;
use std::fmt::{self};
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;

pub const METRICS_TARGET: &str = "metrics";

pub const DEFAULT_METRICS_FILE: &str = "/logs/metrics.log";

/// Writes the pre-encoded metrics line as is.
struct MetricsLineFormatter;

struct FieldVisitor {
    msg: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, _: &Field, value: &str) {
        self.msg.push_str(value);
    }

    fn record_debug(&mut self, _: &Field, value: &dyn fmt::Debug) {
        self.msg.push_str(&format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for MetricsLineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor { msg: String::new() };
        event.record(&mut visitor);
        writeln!(writer, "{}", visitor.msg)
    }
}

fn is_metrics_target(target: &str) -> bool {
    target == METRICS_TARGET || target.starts_with("metrics::")
}

/// initiate the global tracing subscriber
///
/// Events on the `metrics` target go to a daily rotated file, everything
/// else to the regular log output.
pub fn init<P: AsRef<Path>>(metrics_file: Option<P>) -> Result<WorkerGuard> {
    let log_path = env::var(LOG_PATH_ENV_VAR).ok();
    let fmt_layer = utils::logging::get_fmt_layer(log_path);

    let metrics_file = metrics_file
        .as_ref()
        .map(|p| p.as_ref())
        .unwrap_or(Path::new(DEFAULT_METRICS_FILE));
    let (dir, file) = split_metrics_file(metrics_file)?;

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt_layer.with_filter(env_filter.and(filter::filter_fn(|metadata| {
        !is_metrics_target(metadata.target())
    })));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(MetricsLineFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| {
            is_metrics_target(metadata.target())
        }));

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(file_guard)
}

fn split_metrics_file(metrics_file: &Path) -> Result<(&Path, &str)> {
    let file = metrics_file
        .file_name()
        .and_then(|f| f.to_str())
        .with_context(|| format!("invalid metrics file `{}`", metrics_file.display()))?;
    let dir = match metrics_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    Ok((dir, file))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn metrics_target_matches_only_metrics_events() {
        assert!(is_metrics_target("metrics"));
        assert!(is_metrics_target("metrics::reporter"));
        assert!(!is_metrics_target("cpu_manager::metrics"));
        assert!(!is_metrics_target("metricsd"));
    }

    #[test]
    fn splits_metrics_file_into_dir_and_prefix() {
        let (dir, file) = split_metrics_file(Path::new("/logs/metrics.log")).expect("split");
        assert_eq!(dir, Path::new("/logs"));
        assert_eq!(file, "metrics.log");

        let (dir, file) = split_metrics_file(Path::new("metrics.log")).expect("split");
        assert_eq!(dir, Path::new("."));
        assert_eq!(file, "metrics.log");

        assert!(split_metrics_file(Path::new("/")).is_err());
    }
}
