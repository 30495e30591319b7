use crate::app::ApplicationBuilder;
use crate::config::DaemonArgs;
use crate::logging;
use anyhow::Result;
use utils::version;

pub async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.metrics_file.clone())?;

    tracing::info!(
        node_name = %daemon_args.node_name,
        "Starting CPU manager daemon {}",
        &**version::VERSION
    );

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}
