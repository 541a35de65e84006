use std::{path::PathBuf, time::Duration};

/// A configuration-driven backup, restore and recovery-test orchestrator.
#[derive(clap::Parser)]
pub struct Cli {
    /// Sets a custom configuration file path
    #[arg(
        short,
        long,
        env = "RAMPART_CONFIG_FILE",
        default_value = "/etc/rampart/config.toml"
    )]
    pub config_file: PathBuf,

    /// Sets the configuration from a string
    #[arg(long, env = "RAMPART_CONFIG")]
    pub config_string: Option<String>,

    /// Overrides the configured environment label
    #[arg(long = "env", value_name = "NAME")]
    pub environment: Option<String>,

    #[command(subcommand)]
    pub subcommand: Cmd,
}

#[derive(clap::Subcommand)]
pub enum Cmd {
    /// Backs up a configured database or cluster
    Backup(backup::Cli),

    /// Restores a configured database or cluster from a stored artifact
    Restore(restore::Cli),

    /// Runs the disaster-recovery probes
    Test(test::Cli),

    /// Prints the active configuration
    Config,

    /// Prints version information for rampart and the wrapped tools
    Version,
}

pub mod backup {
    use super::*;

    #[derive(clap::Args)]
    pub struct Cli {
        /// The target to back up
        #[arg(value_name = "TARGET")]
        pub target: String,

        /// Encrypts the artifact even if the target is not configured for it
        #[arg(long)]
        pub encrypt: bool,

        /// Includes persistent volume contents in a cluster snapshot
        #[arg(long)]
        pub include_volumes: bool,

        /// Snapshots only these namespaces; disables the exclude list
        #[arg(long = "include-namespace", value_name = "NAMESPACE")]
        pub include_namespaces: Vec<String>,

        /// Excludes namespaces in addition to the configured system ones
        #[arg(long = "exclude-namespace", value_name = "NAMESPACE")]
        pub exclude_namespaces: Vec<String>,

        /// Overrides the configured retention window, e.g. "14days"
        #[arg(long, value_parser = humantime::parse_duration)]
        pub retention: Option<Duration>,

        /// Shows what would be done without touching anything
        #[arg(long)]
        pub dry_run: bool,
    }
}

pub mod restore {
    #[derive(clap::Args)]
    pub struct Cli {
        /// The target to restore
        #[arg(value_name = "TARGET")]
        pub target: String,

        /// The stored artifact or snapshot to restore from
        #[arg(value_name = "ARTIFACT")]
        pub from: String,

        /// Namespace to restore a cluster snapshot into
        #[arg(long, value_name = "NAMESPACE")]
        pub restore_namespace: Option<String>,

        /// Snapshot namespaces to map into the restore namespace
        #[arg(long = "include-namespace", value_name = "NAMESPACE")]
        pub include_namespaces: Vec<String>,

        /// Shows what would be done without touching anything
        #[arg(long)]
        pub dry_run: bool,
    }
}

pub mod test {
    #[derive(clap::Args)]
    pub struct Cli {
        /// Probes to run; all configured probes when empty
        #[arg(value_name = "PROBE")]
        pub probes: Vec<String>,
    }
}
