//! System installer
//!
//! Bootstraps the base tree into the mounted pool, writes the filesystem
//! table and applies the system configuration inside the new root.
//!
//! `pacstrap` is the only operation in the whole workflow that is retried,
//! and only when its diagnostics point at the network. A partially
//! populated tree is left in place after a failure for inspection.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{CommandRunner, Invocation};
use crate::disk::{BootMount, join_under};
use crate::error::{BootstrapError, CommandFailure, SystemConfigError};
use crate::plan::{InstallPlan, MirrorConfig, RetryPolicy, SystemSettings};
use crate::pool::{MountedDataset, Pool};
use crate::types::{Bootloader, NetworkBackend};

// ============================================================================
// Package selection
// ============================================================================

const BASE_PACKAGES: &[&str] = &["base", "base-devel", "linux-firmware"];

const ESSENTIAL_PACKAGES: &[&str] = &[
    "sudo", "vim", "nano", "dhcpcd", "man-db", "man-pages", "which", "wget", "curl", "tar",
    "gzip", "unzip",
];

/// Everything `pacstrap` installs, deduplicated with first occurrence kept.
pub fn package_list(plan: &InstallPlan) -> Vec<String> {
    let kernel = plan.kernel().package();
    let system = plan.system();

    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|p| p.to_string()).collect();
    packages.push(kernel.clone());
    packages.push(format!("{}-headers", kernel));
    packages.push(format!("zfs-{}", kernel));
    packages.push("zfs-utils".to_string());
    packages.extend(ESSENTIAL_PACKAGES.iter().map(|p| p.to_string()));
    packages.extend(plan.bootloader().packages().iter().map(|p| p.to_string()));
    if plan.bootloader() == Bootloader::Grub && plan.boot().dual_boot {
        packages.push("os-prober".to_string());
    }
    packages.extend(system.network.packages().iter().map(|p| p.to_string()));
    for user in &system.users {
        if let Some(shell) = Path::new(&user.shell).file_name().and_then(|s| s.to_str()) {
            if !matches!(shell, "bash" | "sh") {
                packages.push(shell.to_string());
            }
        }
    }
    packages.extend(system.extra_packages.iter().cloned());

    let mut seen = std::collections::HashSet::new();
    packages.retain(|p| seen.insert(p.clone()));
    packages
}

// ============================================================================
// Mirrors
// ============================================================================

/// Mirrorlist of the live system that `pacstrap` downloads from.
pub const MIRRORLIST: &str = "/etc/pacman.d/mirrorlist";

/// reflector arguments for `mirrors`. A country filter keeps fewer mirrors.
pub fn reflector_args(mirrors: &MirrorConfig) -> Vec<String> {
    let mut args = Vec::new();
    let latest = match mirrors.country.as_deref() {
        Some(country) => {
            args.extend(["--country".to_string(), country.to_string()]);
            "20"
        }
        None => "50",
    };
    args.extend(
        ["--latest", latest, "--sort", "rate", "--save", MIRRORLIST]
            .iter()
            .map(|a| a.to_string()),
    );
    args
}

/// Back up the live mirrorlist and replace it with reflector's ranking.
///
/// The caller treats a failure as a warning: the previous list stays usable
/// and is still in place unless reflector itself rewrote it.
pub fn rank_mirrors(
    runner: &dyn CommandRunner,
    mirrors: &MirrorConfig,
    timeout: Duration,
) -> Result<(), CommandFailure> {
    runner.run(
        &Invocation::new("cp")
            .args(["-f", MIRRORLIST])
            .arg(format!("{}.backup", MIRRORLIST))
            .timeout(timeout),
    )?;

    tracing::info!(
        "Ranking mirrors{}",
        mirrors
            .country
            .as_deref()
            .map(|c| format!(" in {}", c))
            .unwrap_or_default()
    );
    runner.run(
        &Invocation::new("reflector")
            .args(reflector_args(mirrors))
            .timeout(timeout),
    )?;
    Ok(())
}

// ============================================================================
// Bootstrap
// ============================================================================

/// pacman/curl diagnostics that indicate a transient network problem.
const NETWORK_MARKERS: &[&str] = &[
    "failed retrieving file",
    "could not resolve host",
    "temporary failure in name resolution",
    "failed to synchronize all databases",
    "connection timed out",
    "operation timed out",
    "connection reset",
    "connection refused",
    "network is unreachable",
    "download library error",
];

/// True when `failure` looks like a transient network problem.
///
/// A utility that ran out of time is not included: it is still running and
/// holds the pacman lock, so starting another attempt would collide with it.
pub fn is_network_failure(failure: &CommandFailure) -> bool {
    match failure {
        CommandFailure::Exit { stderr, .. } => {
            let stderr = stderr.to_ascii_lowercase();
            NETWORK_MARKERS.iter().any(|marker| stderr.contains(marker))
        }
        _ => false,
    }
}

/// Install `packages` into `target` with `pacstrap -K`.
///
/// Network-class failures are retried up to `policy.attempts` times with
/// doubling backoff. Anything else (package conflicts, unknown targets) is
/// returned at once.
pub fn bootstrap(
    runner: &dyn CommandRunner,
    target: &Path,
    packages: &[String],
    policy: RetryPolicy,
    timeout: Duration,
) -> Result<(), BootstrapError> {
    let invocation = Invocation::new("pacstrap")
        .arg("-K")
        .arg(target.display().to_string())
        .args(packages.iter().cloned())
        .timeout(timeout);

    let mut attempt = 1;
    loop {
        tracing::info!(
            "Bootstrapping {} package(s) into {} (attempt {}/{})",
            packages.len(),
            target.display(),
            attempt,
            policy.attempts
        );

        let failure = match runner.run(&invocation) {
            Ok(_) => return Ok(()),
            Err(failure) => failure,
        };

        if !is_network_failure(&failure) {
            return Err(BootstrapError::Fatal(failure));
        }
        if attempt >= policy.attempts {
            return Err(BootstrapError::RetriesExhausted {
                attempts: attempt,
                last: failure,
            });
        }

        let delay = policy.backoff_after(attempt);
        tracing::warn!(
            "Bootstrap hit a network failure, retrying in {}s: {}",
            delay.as_secs(),
            crate::command::tail(failure.stderr(), 1)
        );
        std::thread::sleep(delay);
        attempt += 1;
    }
}

// ============================================================================
// fstab
// ============================================================================

fn partition_uuid(
    runner: &dyn CommandRunner,
    device: &Path,
    timeout: Duration,
) -> Result<String, BootstrapError> {
    let output = runner
        .run(
            &Invocation::new("blkid")
                .args(["-s", "UUID", "-o", "value"])
                .arg(device.display().to_string())
                .timeout(timeout),
        )
        .map_err(BootstrapError::Uuid)?;

    let uuid = output.stdout.trim().to_string();
    if uuid.is_empty() {
        return Err(BootstrapError::Uuid(CommandFailure::Exit {
            command: format!("blkid -s UUID -o value {}", device.display()),
            code: output.exit_code,
            stderr: "no UUID reported".to_string(),
        }));
    }
    Ok(uuid)
}

/// Render `/etc/fstab`.
///
/// ZFS datasets are referenced by `<pool>/<dataset>`, boot partitions by
/// `UUID=` and swap by its `/dev/zvol` path, so nothing depends on kernel
/// device names. The root dataset is mounted by the initramfs and omitted.
pub fn render_fstab(
    mounted: &[MountedDataset],
    boot: &[(BootMount, String)],
    swap: Option<&Path>,
) -> String {
    let mut fstab = String::from(
        "# /etc/fstab: static file system information\n\
         # <file system>\t<dir>\t<type>\t<options>\t<dump>\t<pass>\n\n",
    );
    fstab.push_str("tmpfs\t/tmp\ttmpfs\tdefaults,nosuid,nodev\t0 0\n");

    for dataset in mounted.iter().filter(|d| d.mountpoint != Path::new("/")) {
        fstab.push_str(&format!(
            "{}\t{}\tzfs\tdefaults,zfsutil\t0 0\n",
            dataset.dataset,
            dataset.mountpoint.display()
        ));
    }

    for (mount, uuid) in boot {
        let options = match mount.filesystem {
            crate::types::PartitionFs::Vfat => "defaults,noatime,umask=0077",
            _ => "defaults,noatime",
        };
        fstab.push_str(&format!(
            "UUID={}\t{}\t{}\t{}\t0 2\n",
            uuid,
            mount.mountpoint.display(),
            mount.filesystem,
            options
        ));
    }

    if let Some(swap) = swap {
        fstab.push_str(&format!("{}\tnone\tswap\tdefaults\t0 0\n", swap.display()));
    }

    fstab
}

/// Write `<target>/etc/fstab`.
pub fn generate_fstab(
    runner: &dyn CommandRunner,
    pool: &Pool,
    mounted: &[MountedDataset],
    boot_mounts: &[BootMount],
    swap: Option<&Path>,
    timeout: Duration,
) -> Result<PathBuf, BootstrapError> {
    let boot = boot_mounts
        .iter()
        .map(|mount| Ok((mount.clone(), partition_uuid(runner, &mount.source, timeout)?)))
        .collect::<Result<Vec<_>, BootstrapError>>()?;

    let path = pool.altroot.join("etc/fstab");
    let io_err = |source| BootstrapError::Io {
        path: path.clone(),
        source,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    fs::write(&path, render_fstab(mounted, &boot, swap)).map_err(io_err)?;

    tracing::info!("Wrote {}", path.display());
    Ok(path)
}

// ============================================================================
// System configuration
// ============================================================================

/// Outcome of [`configure_system`]: what succeeded with caveats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    pub warnings: Vec<String>,
}

const ZFS_SERVICES: &[&str] = &["zfs.target", "zfs-import-cache", "zfs-mount", "zfs-import.target"];

struct Configurator<'a> {
    runner: &'a dyn CommandRunner,
    target: &'a Path,
    timeout: Duration,
}

impl Configurator<'_> {
    fn path(&self, in_system: &str) -> PathBuf {
        join_under(self.target, Path::new(in_system))
    }

    fn write(&self, in_system: &str, contents: &str) -> Result<(), SystemConfigError> {
        let path = self.path(in_system);
        let io_err = |source| SystemConfigError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        fs::write(&path, contents).map_err(io_err)
    }

    fn chroot(
        &self,
        task: &'static str,
        program: &str,
        args: &[&str],
    ) -> Result<String, SystemConfigError> {
        self.chroot_with_stdin(task, program, args, None)
    }

    fn chroot_with_stdin(
        &self,
        task: &'static str,
        program: &str,
        args: &[&str],
        stdin: Option<String>,
    ) -> Result<String, SystemConfigError> {
        let mut invocation = Invocation::chroot(self.target, program)
            .args(args.iter().copied())
            .timeout(self.timeout);
        if let Some(stdin) = stdin {
            invocation = invocation.stdin_secret(stdin);
        }
        self.runner
            .run(&invocation)
            .map(|out| out.stdout)
            .map_err(|source| SystemConfigError::Command { task, source })
    }

    fn host(&self, task: &'static str, invocation: Invocation) -> Result<String, SystemConfigError> {
        self.runner
            .run(&invocation.timeout(self.timeout))
            .map(|out| out.stdout)
            .map_err(|source| SystemConfigError::Command { task, source })
    }
}

/// Enable `locale` in locale.gen content, uncommenting it when present.
pub fn enable_locale(locale_gen: &str, locale: &str) -> String {
    let charset = locale.split_once('.').map_or("UTF-8", |(_, cs)| cs);
    let wanted = format!("{} {}", locale, charset);

    let mut found = false;
    let mut lines: Vec<String> = locale_gen
        .lines()
        .map(|line| {
            let uncommented = line.trim_start_matches('#').trim();
            if uncommented == wanted {
                found = true;
                wanted.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(wanted);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn configure_locale(cfg: &Configurator<'_>, system: &SystemSettings) -> Result<(), SystemConfigError> {
    let locale_gen_path = cfg.path("/etc/locale.gen");
    let existing = fs::read_to_string(&locale_gen_path).unwrap_or_default();
    cfg.write("/etc/locale.gen", &enable_locale(&existing, &system.locale))?;
    cfg.chroot("locale-gen", "locale-gen", &[])?;

    cfg.write("/etc/locale.conf", &format!("LANG={}\n", system.locale))?;
    cfg.write("/etc/vconsole.conf", &format!("KEYMAP={}\n", system.keymap))?;
    Ok(())
}

fn configure_time(cfg: &Configurator<'_>, system: &SystemSettings) -> Result<(), SystemConfigError> {
    let zone = format!("/usr/share/zoneinfo/{}", system.timezone);
    cfg.chroot("timezone", "ln", &["-sf", zone.as_str(), "/etc/localtime"])?;
    cfg.chroot("hardware clock", "hwclock", &["--systohc"])?;
    Ok(())
}

fn configure_identity(cfg: &Configurator<'_>, system: &SystemSettings) -> Result<(), SystemConfigError> {
    let hostname = system.hostname.trim();
    cfg.write("/etc/hostname", &format!("{}\n", hostname))?;
    cfg.write(
        "/etc/hosts",
        &format!(
            "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n127.0.1.1\t{0}.localdomain\t{0}\n",
            hostname
        ),
    )?;
    Ok(())
}

fn configure_users(cfg: &Configurator<'_>, system: &SystemSettings) -> Result<(), SystemConfigError> {
    let mut credentials = format!("root:{}\n", system.root_password.expose());

    for user in &system.users {
        let groups = user.groups.join(",");
        let mut args = vec!["-m", "-s", user.shell.as_str()];
        if !groups.is_empty() {
            args.extend(["-G", groups.as_str()]);
        }
        args.push(user.name.as_str());
        cfg.chroot("user creation", "useradd", &args)?;
        credentials.push_str(&format!("{}:{}\n", user.name, user.password.expose()));
    }

    cfg.chroot_with_stdin("password setup", "chpasswd", &[], Some(credentials))?;

    if system
        .users
        .iter()
        .any(|u| u.groups.iter().any(|g| g == "wheel"))
    {
        let path = cfg.path("/etc/sudoers.d/wheel");
        cfg.write("/etc/sudoers.d/wheel", "%wheel ALL=(ALL:ALL) ALL\n")?;
        set_mode(&path, 0o440)?;
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<(), SystemConfigError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        SystemConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn configure_network(cfg: &Configurator<'_>, backend: NetworkBackend) -> Result<(), SystemConfigError> {
    if backend == NetworkBackend::SystemdNetworkd {
        cfg.write(
            "/etc/systemd/network/20-wired.network",
            "[Match]\nName=en*\n\n[Network]\nDHCP=yes\nIPv6PrivacyExtensions=yes\n",
        )?;
    }
    let services = backend.services();
    if !services.is_empty() {
        let mut args = vec!["enable"];
        args.extend(services.iter().copied());
        cfg.chroot("network services", "systemctl", &args)?;
    }
    Ok(())
}

fn configure_zfs(cfg: &Configurator<'_>, pool: &Pool) -> Result<(), SystemConfigError> {
    let mut args = vec!["enable"];
    args.extend(ZFS_SERVICES.iter().copied());
    cfg.chroot("zfs services", "systemctl", &args)?;

    // The pool cachefile is written relative to the chroot, i.e. into the target
    let zfs_dir = cfg.path("/etc/zfs");
    fs::create_dir_all(&zfs_dir).map_err(|source| SystemConfigError::Io {
        path: zfs_dir.clone(),
        source,
    })?;
    cfg.chroot(
        "pool cachefile",
        "zpool",
        &["set", "cachefile=/etc/zfs/zpool.cache", pool.name.as_str()],
    )?;

    let hostid = cfg.host("host id", Invocation::new("hostid"))?;
    let hostid = hostid.trim();
    let hostid_path = cfg.path("/etc/hostid");
    cfg.host(
        "host id",
        Invocation::new("zgenhostid")
            .args(["-f", "-o"])
            .arg(hostid_path.display().to_string())
            .arg(hostid),
    )?;
    Ok(())
}

/// Apply locale, time, identity, users, network and ZFS host settings.
///
/// Failures of the plan's extra services are collected as warnings; every
/// other failure is returned.
pub fn configure_system(
    runner: &dyn CommandRunner,
    plan: &InstallPlan,
    pool: &Pool,
    timeout: Duration,
) -> Result<ConfigureReport, SystemConfigError> {
    let cfg = Configurator {
        runner,
        target: plan.target(),
        timeout,
    };
    let system = plan.system();

    configure_locale(&cfg, system)?;
    configure_time(&cfg, system)?;
    configure_identity(&cfg, system)?;
    configure_users(&cfg, system)?;
    configure_network(&cfg, system.network)?;
    configure_zfs(&cfg, pool)?;

    let mut report = ConfigureReport::default();
    for service in &system.services {
        if let Err(err) = cfg.chroot("extra service", "systemctl", &["enable", service.as_str()]) {
            tracing::warn!("Could not enable {}: {}", service, err);
            report
                .warnings
                .push(format!("could not enable {}: {}", service, err));
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanConfig, Secret, UserConfig};
    use crate::types::PartitionFs;

    fn plan() -> InstallPlan {
        let mut config = PlanConfig::new(vec![PathBuf::from("/dev/sdb")]);
        config.system.root_password = Secret::new("rootpw");
        InstallPlan::from_config(config).expect("valid plan")
    }

    #[test]
    fn test_package_list_contents() {
        let packages = package_list(&plan());
        for expected in ["base", "linux-lts", "linux-lts-headers", "zfs-linux-lts", "zfs-utils", "grub", "networkmanager"] {
            assert!(packages.iter().any(|p| p == expected), "missing {}", expected);
        }
        let unique: std::collections::HashSet<_> = packages.iter().collect();
        assert_eq!(unique.len(), packages.len());
    }

    #[test]
    fn test_package_list_user_shell_and_extras() {
        let mut config = PlanConfig::new(vec![PathBuf::from("/dev/sdb")]);
        config.system.root_password = Secret::new("rootpw");
        config.system.users.push(UserConfig {
            name: "alice".to_string(),
            password: Secret::new("pw"),
            groups: vec!["wheel".to_string()],
            shell: "/usr/bin/zsh".to_string(),
        });
        config.system.extra_packages = vec!["htop".to_string(), "vim".to_string()];
        let packages = package_list(&InstallPlan::from_config(config).expect("valid"));
        assert!(packages.contains(&"zsh".to_string()));
        assert_eq!(packages.last().map(String::as_str), Some("htop"));
        assert_eq!(packages.iter().filter(|p| *p == "vim").count(), 1);
    }

    #[test]
    fn test_network_failure_classification() {
        let exit = |stderr: &str| CommandFailure::Exit {
            command: "pacstrap".to_string(),
            code: Some(1),
            stderr: stderr.to_string(),
        };
        assert!(is_network_failure(&exit(
            "error: failed retrieving file 'core.db' from mirror : Could not resolve host: mirror"
        )));
        assert!(!is_network_failure(&exit(
            "error: failed to commit transaction (conflicting files)"
        )));
        assert!(!is_network_failure(&exit("error: target not found: nosuchpkg")));
        assert!(!is_network_failure(&CommandFailure::TimedOut {
            command: "pacstrap".to_string(),
            timeout: Duration::from_secs(1),
        }));
    }

    #[test]
    fn test_reflector_args_by_country() {
        let all = MirrorConfig {
            enabled: true,
            country: None,
        };
        assert_eq!(
            reflector_args(&all),
            ["--latest", "50", "--sort", "rate", "--save", MIRRORLIST]
        );

        let germany = MirrorConfig {
            enabled: true,
            country: Some("DE".to_string()),
        };
        let args = reflector_args(&germany);
        assert_eq!(&args[..4], ["--country", "DE", "--latest", "20"]);
        assert_eq!(args.last().map(String::as_str), Some(MIRRORLIST));
    }

    #[test]
    fn test_render_fstab_uses_names_not_devices() {
        let mounted = vec![
            MountedDataset {
                dataset: "rpool/ROOT/arch".to_string(),
                mountpoint: PathBuf::from("/"),
            },
            MountedDataset {
                dataset: "rpool/home".to_string(),
                mountpoint: PathBuf::from("/home"),
            },
        ];
        let boot = vec![(
            BootMount {
                source: PathBuf::from("/dev/sdb1"),
                mountpoint: PathBuf::from("/boot/efi"),
                filesystem: PartitionFs::Vfat,
            },
            "ABCD-1234".to_string(),
        )];
        let fstab = render_fstab(&mounted, &boot, Some(Path::new("/dev/zvol/rpool/swap")));

        assert!(fstab.contains("rpool/home\t/home\tzfs\tdefaults,zfsutil\t0 0"));
        assert!(!fstab.contains("rpool/ROOT/arch"));
        assert!(fstab.contains("UUID=ABCD-1234\t/boot/efi\tvfat"));
        assert!(fstab.contains("/dev/zvol/rpool/swap\tnone\tswap"));
        assert!(!fstab.contains("/dev/sd"));
    }

    #[test]
    fn test_enable_locale_uncomments_existing() {
        let locale_gen = "#en_GB.UTF-8 UTF-8\n#en_US.UTF-8 UTF-8\n#en_US ISO-8859-1\n";
        let out = enable_locale(locale_gen, "en_US.UTF-8");
        assert!(out.contains("\nen_US.UTF-8 UTF-8\n"));
        assert!(out.contains("#en_GB.UTF-8 UTF-8"));
        assert!(out.contains("#en_US ISO-8859-1"));
    }

    #[test]
    fn test_enable_locale_appends_missing() {
        assert_eq!(enable_locale("", "de_DE.UTF-8"), "de_DE.UTF-8 UTF-8\n");
    }
}
