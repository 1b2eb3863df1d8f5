//! archzfs library
//!
//! Workflow engine that provisions Arch Linux on a ZFS root pool: disk
//! discovery and partitioning, pool and dataset creation, base system
//! bootstrap, system configuration and bootloader setup.

pub mod boot;
pub mod cli;
pub mod command;
pub mod disk;
pub mod error;
pub mod hardware;
pub mod plan;
pub mod pool;
pub mod process_guard;
pub mod sanity;
pub mod system;
pub mod types;
pub mod workflow;

pub use boot::{BootConfigurator, BootRequest, BootState};
pub use command::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use error::{CommandFailure, InstallError, ValidationError};
pub use hardware::{FirmwareMode, HardwareInfo, NetworkState};
pub use plan::{InstallPlan, PlanConfig};
pub use process_guard::AbortFlag;
pub use types::{Bootloader, Compression, Kernel, NetworkBackend, Topology};
pub use workflow::{Orchestrator, RunStatus, Step, StepLog, StepRecord, StepStatus, WorkflowOptions};
