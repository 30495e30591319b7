use clap::Parser;
use std::path::PathBuf;

use crate::policy::PolicyMode;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/cpu-manager";
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
pub const DEFAULT_RUNTIME_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent manages, used to filter pods and to look up its NodeResourceTopology"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "CONTAINER_RUNTIME_ENDPOINT",
        default_value = DEFAULT_RUNTIME_ENDPOINT,
        help = "CRI runtime endpoint, e.g. unix:///run/containerd/containerd.sock"
    )]
    pub runtime_endpoint: String,

    #[arg(
        long,
        env = "CPU_MANAGER_STATE_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_STATE_DIR,
        help = "Directory for the allocation checkpoint"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between two reconcile passes"
    )]
    pub reconcile_period_secs: u64,

    #[arg(
        long,
        env = "DEFAULT_CPU_POLICY",
        default_value = "none",
        help = "Policy for pods without a cpu-policy annotation: none, exclusive, numa or immovable"
    )]
    pub default_cpu_policy: PolicyMode,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_SYSFS_ROOT,
        help = "Root of the sysfs tree to read the CPU topology from"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        env = "CPU_MANAGER_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/logs/metrics.log",
        help = "Path for printing CPU manager metrics, e.g. /logs/metrics.log"
    )]
    pub metrics_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds between two metrics lines"
    )]
    pub metrics_interval_secs: u64,

    #[arg(
        long,
        help = "Enable metrics collection",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_metrics: bool,

    #[arg(
        long,
        env = "CPU_MANAGER_METRICS_FORMAT",
        default_value = "influx",
        help = "Metrics format, either 'influx' or 'json'"
    )]
    pub metrics_format: String,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use similar_asserts::assert_eq;

    use crate::config::Cli;
    use crate::config::Commands;
    use crate::manager::CpuManagerConfig;
    use crate::policy::PolicyMode;

    fn parse_daemon(args: &[&str]) -> super::DaemonArgs {
        let cli = Cli::try_parse_from(["cpu-manager", "daemon"].iter().chain(args))
            .expect("valid arguments");
        match cli.command {
            Commands::Daemon(args) => *args,
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn daemon_defaults() {
        let args = parse_daemon(&["--node-name", "worker-1"]);

        assert_eq!(args.node_name, "worker-1");
        assert_eq!(args.runtime_endpoint, super::DEFAULT_RUNTIME_ENDPOINT);
        assert_eq!(args.state_dir.to_str(), Some("/var/lib/cpu-manager"));
        assert_eq!(args.default_cpu_policy, PolicyMode::None);
        assert_eq!(args.reconcile_period_secs, 10);
        assert_eq!(args.metrics_interval_secs, 30);
        assert!(args.enable_metrics);
        assert_eq!(args.metrics_format, "influx");
    }

    #[test]
    fn daemon_args_build_manager_config() {
        let args = parse_daemon(&[
            "--node-name",
            "worker-2",
            "--default-cpu-policy",
            "numa",
            "--reconcile-period-secs",
            "0",
        ]);
        let config = CpuManagerConfig::from(&args);

        assert_eq!(config.node_name, "worker-2");
        assert_eq!(config.default_policy, PolicyMode::Numa);
        assert_eq!(config.reconcile_period, Duration::from_secs(1));
    }

    #[test]
    fn rejects_unknown_policy() {
        let result = Cli::try_parse_from([
            "cpu-manager",
            "daemon",
            "--node-name",
            "worker-1",
            "--default-cpu-policy",
            "shared",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn inspection_commands_parse() {
        let cli = Cli::try_parse_from(["cpu-manager", "show-state", "--state-dir", "/tmp/state"])
            .expect("valid arguments");
        assert!(matches!(cli.command, Commands::ShowState(args) if args.state_dir.to_str() == Some("/tmp/state")));

        let cli = Cli::try_parse_from(["cpu-manager", "show-topology"]).expect("valid arguments");
        assert!(matches!(cli.command, Commands::ShowTopology(args) if args.sysfs_root.to_str() == Some("/sys")));
    }
}
