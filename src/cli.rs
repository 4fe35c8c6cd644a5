//! Command-line arguments for the two entry points

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

/// Arguments for the configure-once entry point.
#[derive(Parser, Debug)]
#[command(name = "ldmsctl-config")]
#[command(about = "Expand a fleet description and write it to the datastore")]
pub struct ConfigArgs {
    /// Datastore members file
    #[arg(long, value_name = "FILE")]
    pub cluster: PathBuf,

    /// Declarative fleet description
    #[arg(long = "ldms_config", value_name = "FILE")]
    pub ldms_config: PathBuf,

    /// Datastore key prefix / cluster name
    #[arg(long, value_name = "STRING")]
    pub prefix: String,

    /// Output dialect (5 is reserved)
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(4..=5))]
    pub version: u8,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Arguments for the monitor-forever entry point.
#[derive(Parser, Debug)]
#[command(name = "ldmsctl-monitor")]
#[command(about = "Reconcile a telemetry fleet against its datastore configuration")]
pub struct MonitorArgs {
    /// Datastore members file
    #[arg(long, value_name = "FILE")]
    pub cluster: PathBuf,

    /// Datastore key prefix / cluster name
    #[arg(long, value_name = "STRING")]
    pub prefix: String,

    /// Also spawn one aggregator daemon per aggregator host
    #[arg(long = "start-aggregators")]
    pub start_aggregators: bool,

    /// Reserved
    #[arg(long)]
    pub dump: bool,

    /// Output dialect (5 is reserved)
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(4..=5))]
    pub version: u8,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Initialize logging from the verbosity count; `RUST_LOG` wins when set.
pub fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_args_parse() {
        let args = ConfigArgs::parse_from([
            "ldmsctl-config",
            "--cluster",
            "cluster.yaml",
            "--ldms_config",
            "fleet.yaml",
            "--prefix",
            "tel",
        ]);
        assert_eq!(args.prefix, "tel");
        assert_eq!(args.version, 4);
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn test_monitor_args_flags() {
        let args = MonitorArgs::parse_from([
            "ldmsctl-monitor",
            "--cluster",
            "cluster.yaml",
            "--prefix",
            "tel",
            "--start-aggregators",
            "--version",
            "5",
            "-vv",
        ]);
        assert!(args.start_aggregators);
        assert!(!args.dump);
        assert_eq!(args.version, 5);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_version_rejects_out_of_range() {
        let result = ConfigArgs::try_parse_from([
            "ldmsctl-config",
            "--cluster",
            "c",
            "--ldms_config",
            "f",
            "--prefix",
            "p",
            "--version",
            "6",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_required_args() {
        assert!(ConfigArgs::try_parse_from(["ldmsctl-config"]).is_err());
        assert!(MonitorArgs::try_parse_from(["ldmsctl-monitor", "--prefix", "tel"]).is_err());
    }
}
