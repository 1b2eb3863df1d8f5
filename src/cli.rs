use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// archzfs - install Arch Linux onto a ZFS root pool
#[derive(Parser)]
#[command(name = "archzfs")]
#[command(about = "Provision Arch Linux on a ZFS root pool from a JSON plan")]
#[command(version)]
pub struct Cli {
    /// Verbose logging; step records also keep every command run with
    /// the tail of its output.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the installation described by a plan file
    Install {
        /// Path to the plan file
        #[arg(short, long)]
        plan: PathBuf,

        /// Rewrite the step journal (JSON) here after every transition
        #[arg(long)]
        journal: Option<PathBuf>,
    },
    /// Check a plan file without touching any disk
    Validate {
        /// Path to the plan file to validate
        plan: PathBuf,
    },
    /// List the block devices an installation could use
    Discover,
    /// Write a plan file with defaults for the given devices
    InitPlan {
        /// Devices to build the pool on, in vdev order
        #[arg(short, long = "device", required = true)]
        devices: Vec<PathBuf>,

        /// Where to write the plan
        #[arg(short, long, default_value = "archzfs-plan.json")]
        output: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["archzfs"]).is_err());
    }

    #[test]
    fn test_cli_install_with_journal() {
        let cli = Cli::try_parse_from([
            "archzfs",
            "install",
            "--plan",
            "/root/plan.json",
            "--journal",
            "/root/journal.json",
        ])
        .expect("parse");
        assert!(!cli.debug);
        match cli.command {
            Commands::Install { plan, journal } => {
                assert_eq!(plan, PathBuf::from("/root/plan.json"));
                assert_eq!(journal, Some(PathBuf::from("/root/journal.json")));
            }
            _ => panic!("Expected Install command"),
        }
    }

    #[test]
    fn test_cli_debug_is_global() {
        let cli = Cli::try_parse_from(["archzfs", "discover", "--debug"]).expect("parse");
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::Discover));

        let cli = Cli::try_parse_from(["archzfs", "--debug", "validate", "plan.json"]).expect("parse");
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_install_requires_plan() {
        assert!(Cli::try_parse_from(["archzfs", "install"]).is_err());
    }

    #[test]
    fn test_cli_init_plan_devices() {
        let cli = Cli::try_parse_from([
            "archzfs",
            "init-plan",
            "--device",
            "/dev/sdb",
            "--device",
            "/dev/sdc",
        ])
        .expect("parse");
        match cli.command {
            Commands::InitPlan { devices, output } => {
                assert_eq!(devices.len(), 2);
                assert_eq!(output, PathBuf::from("archzfs-plan.json"));
            }
            _ => panic!("Expected InitPlan command"),
        }
    }
}
