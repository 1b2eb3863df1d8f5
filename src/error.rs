//! Error handling module for the installer
//!
//! Every component returns its own typed error. The orchestrator wraps
//! them in [`InstallError`] and records them against the step that failed;
//! it never inspects or suppresses them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Bootloader, Topology};

/// Failure of a single external utility invocation.
#[derive(Error, Debug)]
pub enum CommandFailure {
    /// The program could not be started at all
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully
    #[error("`{command}` exited with status {}: {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()), .stderr.trim())]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The program did not finish within its budget
    #[error("`{command}` did not finish within {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    /// Feeding stdin or collecting output failed
    #[error("I/O error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandFailure {
    /// The command line (secrets never appear here).
    pub fn command(&self) -> &str {
        match self {
            Self::Spawn { command, .. }
            | Self::Exit { command, .. }
            | Self::TimedOut { command, .. }
            | Self::Io { command, .. } => command,
        }
    }

    /// Captured stderr, empty when the program never produced any.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Exit { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// The plan does not satisfy installation preconditions.
///
/// This is the only recoverable class: the prompt layer can fix the plan
/// and try again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no target devices selected")]
    NoDevices,

    #[error("{topology} needs at least {required} device(s), {found} selected")]
    TooFewDevices {
        topology: Topology,
        required: usize,
        found: usize,
    },

    #[error("device {} is selected more than once", .0.display())]
    DuplicateDevice(PathBuf),

    #[error("device {} was not found among the discovered block devices", .0.display())]
    UnknownDevice(PathBuf),

    #[error("device {} is read-only", .0.display())]
    ReadOnlyDevice(PathBuf),

    #[error("device {} is not bootable in UEFI mode (system booted without EFI firmware)", .0.display())]
    NotUefi(PathBuf),

    #[error("device {} is too small ({size} bytes, need at least {minimum})", .device.display())]
    DeviceTooSmall {
        device: PathBuf,
        size: u64,
        minimum: u64,
    },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("{0} cannot be combined with a separate /boot partition")]
    IncompatibleBootLayout(Bootloader),

    #[error("dataset layout: {0}")]
    DatasetLayout(String),
}

impl ValidationError {
    pub fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("block device listing failed: {0}")]
    Command(#[from] CommandFailure),

    #[error("could not parse lsblk output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Partitioning is never retried; any failure aborts the run.
#[derive(Error, Debug)]
#[error("partitioning {} failed: {source}", .device.display())]
pub struct PartitionError {
    pub device: PathBuf,
    #[source]
    pub source: PartitionCause,
}

#[derive(Error, Debug)]
pub enum PartitionCause {
    #[error(transparent)]
    Command(#[from] CommandFailure),

    #[error("layout lists existing partitions; refusing to erase the device")]
    ExistingLayout,

    #[error("could not prepare {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum PoolCreationError {
    #[error("pool spec has no member partitions")]
    NoMembers,

    #[error("{} carries an existing ZFS pool signature; set pool.force to overwrite it", .member.display())]
    ExistingPoolSignature { member: PathBuf },

    #[error("could not check {} for existing signatures: {source}", .member.display())]
    SignatureCheck {
        member: PathBuf,
        #[source]
        source: CommandFailure,
    },

    #[error("could not read encryption key file {}: {source}", .path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zpool create failed: {0}")]
    Command(#[from] CommandFailure),
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset {dataset} is listed before its parent {parent}")]
    MissingParent { dataset: String, parent: String },

    #[error("dataset {0} is listed more than once")]
    Duplicate(String),

    #[error("creating {dataset} failed: {source}")]
    Command {
        dataset: String,
        #[source]
        source: CommandFailure,
    },
}

#[derive(Error, Debug)]
pub enum MountError {
    #[error("target mount {} does not exist", .0.display())]
    MissingTarget(PathBuf),

    #[error("dataset {dataset} would be mounted before its parent {parent}")]
    ParentNotMounted { dataset: String, parent: String },

    #[error("mount point parent {} for {dataset} does not exist", .path.display())]
    MissingParentMountpoint { dataset: String, path: PathBuf },

    #[error("could not create mount point {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mounting {what} failed: {source}")]
    Command {
        what: String,
        #[source]
        source: CommandFailure,
    },
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("base system bootstrap failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: CommandFailure,
    },

    #[error("base system bootstrap failed: {0}")]
    Fatal(#[source] CommandFailure),

    #[error("could not resolve boot partition UUID: {0}")]
    Uuid(#[source] CommandFailure),

    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SystemConfigError {
    #[error("{task} failed: {source}")]
    Command {
        task: &'static str,
        #[source]
        source: CommandFailure,
    },

    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("boot configuration cannot move from {from} to {to}")]
    InvalidTransition {
        from: crate::boot::BootState,
        to: crate::boot::BootState,
    },

    #[error("{task} failed: {source}")]
    Command {
        task: &'static str,
        #[source]
        source: CommandFailure,
    },

    #[error("editing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The installed system would not boot.
#[derive(Error, Debug)]
pub enum BootVerificationError {
    #[error("boot configuration {} was not written", .0.display())]
    ConfigMissing(PathBuf),

    #[error("boot configuration {} does not reference {expected}", .path.display())]
    ConfigIncomplete { path: PathBuf, expected: String },

    #[error("firmware boot manager does not list a \"{label}\" entry")]
    EntryMissing { label: String },

    #[error("could not read firmware boot entries: {0}")]
    Command(#[source] CommandFailure),

    #[error("boot configuration is not installed yet ({0})")]
    NotInstalled(crate::boot::BootState),
}

/// Main error type for the installer
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    PoolCreation(#[from] PoolCreationError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    SystemConfig(#[from] SystemConfigError),

    #[error(transparent)]
    Bootloader(#[from] BootloaderError),

    #[error(transparent)]
    BootVerification(#[from] BootVerificationError),

    /// Internal guard: a step was attempted out of order
    #[error("Install transition error: {0}")]
    Transition(#[from] crate::workflow::TransitionError),
}

impl InstallError {
    /// Short machine-friendly name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Discovery(_) => "DiscoveryError",
            Self::Partition(_) => "PartitionError",
            Self::PoolCreation(_) => "PoolCreationError",
            Self::Dataset(_) => "DatasetError",
            Self::Mount(_) => "MountError",
            Self::Bootstrap(_) => "BootstrapError",
            Self::SystemConfig(_) => "SystemConfigError",
            Self::Bootloader(_) => "BootloaderError",
            Self::BootVerification(_) => "BootVerificationError",
            Self::Transition(_) => "TransitionError",
        }
    }

    /// True only for errors the prompt layer can fix by re-prompting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidationError::TooFewDevices {
            topology: Topology::Raidz2,
            required: 3,
            found: 2,
        };
        assert_eq!(
            err.to_string(),
            "raidz2 needs at least 3 device(s), 2 selected"
        );

        let err = InstallError::from(ValidationError::NoDevices);
        assert_eq!(err.to_string(), "validation error: no target devices selected");
    }

    #[test]
    fn test_exit_failure_shows_code_and_stderr() {
        let err = CommandFailure::Exit {
            command: "zpool create rpool /dev/sdb2".to_string(),
            code: Some(1),
            stderr: "cannot create 'rpool': pool already exists\n".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 1"));
        assert!(msg.ends_with("pool already exists"));
        assert_eq!(err.command(), "zpool create rpool /dev/sdb2");
    }

    #[test]
    fn test_signal_exit_display() {
        let err = CommandFailure::Exit {
            command: "sgdisk --zap-all /dev/sdb".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("status signal"));
    }

    #[test]
    fn test_only_validation_is_recoverable() {
        let err = InstallError::from(ValidationError::NoDevices);
        assert!(err.is_recoverable());

        let err = InstallError::from(PoolCreationError::NoMembers);
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), "PoolCreationError");
    }
}
