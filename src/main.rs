//! archzfs - main entry point

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use archzfs::cli::{Cli, Commands};
use archzfs::command::{DEFAULT_TIMEOUT, SystemRunner};
use archzfs::hardware::{self, HardwareInfo};
use archzfs::plan::{InstallPlan, PlanConfig};
use archzfs::process_guard::{self, AbortFlag};
use archzfs::sanity;
use archzfs::workflow::{Orchestrator, RunStatus, WorkflowOptions};

/// Exit code for a plan that fails validation
const EXIT_VALIDATION: u8 = 2;

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);
    debug!("archzfs {} starting", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("✗ {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Validate { plan } => Ok(validate(&plan)),
        Commands::Discover => discover(),
        Commands::InitPlan { devices, output } => {
            PlanConfig::new(devices).save_to_file(&output)?;
            println!("✓ Wrote plan template to {}", output.display());
            println!("  Set system.root_password before installing.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Install { plan, journal } => install(&plan, journal, cli.debug),
    }
}

fn validate(path: &Path) -> ExitCode {
    info!("Validating plan file: {}", path.display());
    let config = match PlanConfig::load_from_file(path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("✗ {:#}", err);
            return ExitCode::from(EXIT_VALIDATION);
        }
    };

    match InstallPlan::from_config(config) {
        Ok(plan) => {
            println!(
                "✓ Plan is valid: {} pool {} on {} device(s), {} with {}",
                plan.topology(),
                plan.pool_name(),
                plan.devices().len(),
                plan.bootloader(),
                plan.kernel()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("✗ Plan validation failed: {}", err);
            ExitCode::from(EXIT_VALIDATION)
        }
    }
}

fn discover() -> anyhow::Result<ExitCode> {
    let env = sanity::verify_environment(sanity::DISCOVERY_BINARIES);
    if !env.missing_binaries.is_empty() {
        eprint!("✗ {}", env);
        return Ok(ExitCode::FAILURE);
    }

    let firmware = hardware::detect_firmware_mode(Path::new(hardware::EFI_SYSFS));
    let devices = archzfs::disk::discover(&SystemRunner, firmware, DEFAULT_TIMEOUT)
        .context("Failed to list block devices")?;

    println!("{}", HardwareInfo::detect());
    if devices.is_empty() {
        println!("No installable disks found.");
    }
    for device in &devices {
        println!("  {}", device);
    }
    Ok(ExitCode::SUCCESS)
}

fn install(
    plan_path: &Path,
    journal: Option<std::path::PathBuf>,
    debug: bool,
) -> anyhow::Result<ExitCode> {
    let abort = AbortFlag::new();
    if let Err(e) = process_guard::init_signal_handlers(&abort) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    if let Err(result) = sanity::run_preflight_checks(sanity::REQUIRED_BINARIES) {
        eprint!("✗ Pre-flight checks failed:\n{}", result);
        return Ok(ExitCode::FAILURE);
    }

    let config = match PlanConfig::load_from_file(plan_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("✗ {:#}", err);
            return Ok(ExitCode::from(EXIT_VALIDATION));
        }
    };

    if config.mirrors.enabled {
        let missing = sanity::verify_environment(sanity::MIRROR_BINARIES).missing_binaries;
        if !missing.is_empty() {
            warn!(
                "{} not found; mirror ranking will be skipped with a warning",
                missing.join(", ")
            );
        }
    }

    let hw = HardwareInfo::detect();
    info!("{}", hw);
    if !hw.network.is_online() {
        warn!("No network connectivity detected; the bootstrap step will likely fail");
    }

    let options = WorkflowOptions {
        firmware: hw.firmware,
        memory_bytes: hw.memory_bytes,
        debug,
        journal,
    };
    let mut orchestrator = Orchestrator::new(SystemRunner::new(), config, options, abort);
    let status = orchestrator.run();

    match &status {
        RunStatus::Success => {
            println!("✓ {}", status);
            let teardown = orchestrator.log().finalize.as_ref();
            for warning in teardown.map(|t| t.warnings.as_slice()).unwrap_or_default() {
                eprintln!("⚠ {}", warning);
            }
            match orchestrator.pool() {
                Some(pool) if teardown.is_some_and(|t| t.exported) => {
                    println!("  Pool {} exported; the system is ready to reboot.", pool.name);
                }
                Some(pool) => println!(
                    "  Unmount {} and run `zpool export {}` before rebooting.",
                    pool.altroot.display(),
                    pool.name
                ),
                None => {}
            }
        }
        RunStatus::Aborted { .. } => eprintln!("⚠ {}", status),
        _ => {
            eprintln!("✗ {}", status);
            eprintln!("  Nothing was rolled back; the system is as the last successful step left it.");
        }
    }

    // Exit codes are 0, 1, 2 and 130
    let code = u8::try_from(status.exit_code()).unwrap_or(1);
    Ok(ExitCode::from(code))
}
