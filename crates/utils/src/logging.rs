//! provides logging helpers

use std::path::Path;

use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

/// When set, human readable logs go to daily rotated files in this directory
/// instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "CPU_MANAGER_LOG_PATH";

const LOG_FILE_PREFIX: &str = "cpu-manager.log";

pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// The formatting layer for regular logs, writing to stderr or to the
/// directory in `log_path`.
pub fn get_fmt_layer(log_path: Option<String>) -> BoxedLayer {
    if let Some(path) = log_path {
        match rolling_appender(Path::new(&path)) {
            Ok(appender) => {
                return layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed();
            }
            Err(e) => eprintln!("failed to log to `{path}`, falling back to stderr: {e}"),
        }
    }

    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}

fn rolling_appender(dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(7)
        .build(dir)
}

/// initiate the global tracing subscriber
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = get_fmt_layer(std::env::var(LOG_PATH_ENV_VAR).ok()).with_filter(env_filter);

    registry().with(fmt_layer).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_appender_creates_log_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");

        rolling_appender(&logs).expect("appender");
        assert!(logs.is_dir());
    }
}
