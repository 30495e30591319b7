use anyhow::Result;
use clap::Parser;

use cpu_manager::cmd;
use cpu_manager::config::Cli;
use cpu_manager::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => cmd::run_daemon(*daemon_args).await,
        Commands::ShowState(show_state_args) => cmd::run_show_state(show_state_args).await,
        Commands::ShowTopology(show_topology_args) => {
            cmd::run_show_topology(show_topology_args).await
        }
    }
}
