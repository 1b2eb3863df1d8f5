//! Boot configurator
//!
//! Installs the EFI bootloader, wires the ZFS hook into the initramfs and
//! verifies the result. Progress is tracked as a forward-only state machine:
//!
//! ```text
//! NotInstalled -> EfiEntryWritten -> HooksConfigured -> Verified
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::command::{CommandRunner, Invocation};
use crate::disk::join_under;
use crate::error::{BootVerificationError, BootloaderError};
use crate::plan::InstallPlan;
use crate::types::{Bootloader, Kernel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "kebab-case")]
pub enum BootState {
    #[default]
    NotInstalled,
    EfiEntryWritten,
    HooksConfigured,
    Verified,
}

impl BootState {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NotInstalled => Some(Self::EfiEntryWritten),
            Self::EfiEntryWritten => Some(Self::HooksConfigured),
            Self::HooksConfigured => Some(Self::Verified),
            Self::Verified => None,
        }
    }
}

/// Everything the configurator needs to know about the installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRequest {
    pub bootloader: Bootloader,
    pub kernel: Kernel,
    pub pool: String,
    /// Pool-relative name of the dataset mounted at `/`
    pub root_dataset: String,
    pub target: PathBuf,
    pub encrypted: bool,
    pub dual_boot: bool,
    pub timeout: Duration,
}

impl BootRequest {
    pub fn from_plan(plan: &InstallPlan) -> Self {
        Self {
            bootloader: plan.bootloader(),
            kernel: plan.kernel(),
            pool: plan.pool_name().to_string(),
            root_dataset: plan.root_dataset().to_string(),
            target: plan.target().to_path_buf(),
            encrypted: plan.is_encrypted(),
            dual_boot: plan.boot().dual_boot,
            timeout: plan.timeouts().command,
        }
    }

    /// Kernel command line argument naming the root dataset.
    pub fn root_parameter(&self) -> String {
        format!("zfs={}/{}", self.pool, self.root_dataset)
    }

    /// Configuration file `verify` inspects, as seen inside the target.
    pub fn config_path(&self) -> &'static str {
        match self.bootloader {
            Bootloader::Grub => GRUB_CFG,
            Bootloader::SystemdBoot => LOADER_ENTRY,
        }
    }
}

const GRUB_DEFAULTS: &str = "/etc/default/grub";
const GRUB_CFG: &str = "/boot/grub/grub.cfg";
const MKINITCPIO_CONF: &str = "/etc/mkinitcpio.conf";
const LOADER_CONF: &str = "/boot/loader/loader.conf";
const LOADER_ENTRY: &str = "/boot/loader/entries/arch-zfs.conf";

const DEFAULT_HOOKS: &str =
    "base udev autodetect microcode modconf kms keyboard keymap consolefont block filesystems";

// ============================================================================
// Configuration file editing
// ============================================================================

/// Split a shell array or quoted string value into words.
fn parse_words(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim_matches(|c| c == '"' || c == '\'')
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Replace the first uncommented `key=` line (or a commented-out one) with
/// `key=value`, appending when neither exists.
fn set_variable(lines: &mut Vec<String>, key: &str, value: String) {
    let prefix = format!("{}=", key);
    let active = lines.iter().position(|l| l.starts_with(&prefix));
    let commented = lines
        .iter()
        .position(|l| l.trim_start_matches('#').trim_start().starts_with(&prefix));

    match active.or(commented) {
        Some(idx) => lines[idx] = format!("{}{}", prefix, value),
        None => lines.push(format!("{}{}", prefix, value)),
    }
}

fn get_variable(lines: &[String], key: &str) -> Option<Vec<String>> {
    let prefix = format!("{}=", key);
    lines
        .iter()
        .find_map(|l| l.strip_prefix(&prefix))
        .map(parse_words)
}

fn join_lines(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// busybox equivalents of systemd-based hooks; the `zfs` hook only runs
/// under the busybox init.
fn busybox_hooks(hook: &str) -> Vec<&str> {
    match hook {
        "systemd" => vec!["udev"],
        "sd-vconsole" => vec!["keymap", "consolefont"],
        "sd-encrypt" | "zfs" | "fsck" => Vec::new(),
        _ => vec![hook],
    }
}

/// Insert `zfs` into the initramfs hooks ahead of `filesystems`.
///
/// A systemd-based hook line is converted to its busybox form first.
/// `fsck` is dropped since the root filesystem is ZFS. When the pool is
/// encrypted `keyboard` and `keymap` are moved ahead of `zfs` so the
/// passphrase prompt has a usable keyboard layout. `MODULES` gains `zfs`.
pub fn configure_hooks(conf: &str, encrypted: bool) -> String {
    let mut lines: Vec<String> = conf.lines().map(str::to_string).collect();

    let configured = get_variable(&lines, "HOOKS")
        .unwrap_or_else(|| DEFAULT_HOOKS.split_whitespace().map(str::to_string).collect());
    let mut hooks: Vec<String> = Vec::with_capacity(configured.len() + 2);
    for hook in configured.iter().flat_map(|h| busybox_hooks(h)) {
        if !hooks.iter().any(|h| h == hook) {
            hooks.push(hook.to_string());
        }
    }

    if encrypted {
        hooks.retain(|h| h != "keyboard" && h != "keymap");
        let at = hooks
            .iter()
            .position(|h| h == "filesystems")
            .unwrap_or(hooks.len());
        hooks.splice(at..at, ["keyboard", "keymap"].map(String::from));
    }

    let at = hooks
        .iter()
        .position(|h| h == "filesystems")
        .unwrap_or(hooks.len());
    hooks.insert(at, "zfs".to_string());
    set_variable(&mut lines, "HOOKS", format!("({})", hooks.join(" ")));

    let mut modules = get_variable(&lines, "MODULES").unwrap_or_default();
    if !modules.iter().any(|m| m == "zfs") {
        modules.push("zfs".to_string());
    }
    set_variable(&mut lines, "MODULES", format!("({})", modules.join(" ")));

    join_lines(lines)
}

/// Edit `/etc/default/grub` for a ZFS root.
pub fn configure_grub_defaults(defaults: &str, root_parameter: &str, dual_boot: bool) -> String {
    let mut lines: Vec<String> = defaults.lines().map(str::to_string).collect();

    let mut preload = get_variable(&lines, "GRUB_PRELOAD_MODULES").unwrap_or_default();
    for module in ["part_gpt", "zfs"] {
        if !preload.iter().any(|m| m == module) {
            preload.push(module.to_string());
        }
    }
    set_variable(
        &mut lines,
        "GRUB_PRELOAD_MODULES",
        format!("\"{}\"", preload.join(" ")),
    );

    let mut cmdline = get_variable(&lines, "GRUB_CMDLINE_LINUX").unwrap_or_default();
    cmdline.retain(|arg| !arg.starts_with("zfs="));
    cmdline.push(root_parameter.to_string());
    set_variable(
        &mut lines,
        "GRUB_CMDLINE_LINUX",
        format!("\"{}\"", cmdline.join(" ")),
    );

    if dual_boot {
        set_variable(&mut lines, "GRUB_DISABLE_OS_PROBER", "false".to_string());
    }

    join_lines(lines)
}

pub fn render_loader_conf() -> String {
    "default arch-zfs.conf\ntimeout 4\nconsole-mode max\neditor no\n".to_string()
}

pub fn render_loader_entry(kernel: Kernel, root_parameter: &str) -> String {
    let kernel = kernel.package();
    format!(
        "title Arch Linux (ZFS)\nlinux /vmlinuz-{0}\ninitrd /initramfs-{0}.img\noptions {1} rw\n",
        kernel, root_parameter
    )
}

// ============================================================================
// Configurator
// ============================================================================

pub struct BootConfigurator {
    request: BootRequest,
    state: BootState,
}

impl BootConfigurator {
    pub fn new(request: BootRequest) -> Self {
        Self {
            request,
            state: BootState::NotInstalled,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn request(&self) -> &BootRequest {
        &self.request
    }

    fn advance(&mut self, to: BootState) -> Result<(), BootloaderError> {
        if self.state.next() != Some(to) {
            return Err(BootloaderError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!("Boot configuration: {} -> {}", self.state, to);
        self.state = to;
        Ok(())
    }

    fn path(&self, in_system: &str) -> PathBuf {
        join_under(&self.request.target, Path::new(in_system))
    }

    fn chroot(
        &self,
        runner: &dyn CommandRunner,
        task: &'static str,
        program: &str,
        args: &[&str],
    ) -> Result<(), BootloaderError> {
        runner
            .run(
                &Invocation::chroot(&self.request.target, program)
                    .args(args.iter().copied())
                    .timeout(self.request.timeout),
            )
            .map(|_| ())
            .map_err(|source| BootloaderError::Command { task, source })
    }

    fn edit(&self, in_system: &str, edit: impl FnOnce(&str) -> String) -> Result<(), BootloaderError> {
        let path = self.path(in_system);
        let current = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(BootloaderError::Io { path, source }),
        };
        self.write(in_system, &edit(&current))
    }

    fn write(&self, in_system: &str, contents: &str) -> Result<(), BootloaderError> {
        let path = self.path(in_system);
        let io_err = |source| BootloaderError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        fs::write(&path, contents).map_err(io_err)
    }

    fn configure_initramfs(&self, runner: &dyn CommandRunner) -> Result<(), BootloaderError> {
        let encrypted = self.request.encrypted;
        self.edit(MKINITCPIO_CONF, |conf| configure_hooks(conf, encrypted))?;
        self.chroot(runner, "initramfs generation", "mkinitcpio", &["-P"])
    }

    /// Install the bootloader and regenerate the initramfs.
    ///
    /// Leaves the configurator in `HooksConfigured` on success. A failure
    /// leaves it at the last state reached.
    pub fn install(&mut self, runner: &dyn CommandRunner) -> Result<(), BootloaderError> {
        tracing::info!("Installing {} into {}", self.request.bootloader, self.request.target.display());
        match self.request.bootloader {
            Bootloader::Grub => self.install_grub(runner),
            Bootloader::SystemdBoot => self.install_systemd_boot(runner),
        }
    }

    fn install_grub(&mut self, runner: &dyn CommandRunner) -> Result<(), BootloaderError> {
        let efi_directory = format!("--efi-directory={}", Bootloader::Grub.esp_mountpoint());
        self.chroot(
            runner,
            "grub-install",
            "grub-install",
            &[
                "--target=x86_64-efi",
                efi_directory.as_str(),
                "--bootloader-id=GRUB",
            ],
        )?;
        self.advance(BootState::EfiEntryWritten)?;

        let root = self.request.root_parameter();
        let dual_boot = self.request.dual_boot;
        self.edit(GRUB_DEFAULTS, |defaults| {
            configure_grub_defaults(defaults, &root, dual_boot)
        })?;
        self.configure_initramfs(runner)?;

        // grub-probe needs full vdev paths to resolve the pool
        self.chroot(
            runner,
            "grub-mkconfig",
            "env",
            &["ZPOOL_VDEV_NAME_PATH=1", "grub-mkconfig", "-o", GRUB_CFG],
        )?;
        self.advance(BootState::HooksConfigured)
    }

    fn install_systemd_boot(&mut self, runner: &dyn CommandRunner) -> Result<(), BootloaderError> {
        self.chroot(runner, "bootctl install", "bootctl", &["install"])?;
        self.advance(BootState::EfiEntryWritten)?;

        self.write(LOADER_CONF, &render_loader_conf())?;
        self.write(
            LOADER_ENTRY,
            &render_loader_entry(self.request.kernel, &self.request.root_parameter()),
        )?;
        self.configure_initramfs(runner)?;
        self.advance(BootState::HooksConfigured)
    }

    /// Confirm the installed configuration would boot the ZFS root.
    pub fn verify(&mut self, runner: &dyn CommandRunner) -> Result<(), BootVerificationError> {
        if self.state != BootState::HooksConfigured {
            return Err(BootVerificationError::NotInstalled(self.state));
        }

        let path = self.path(self.request.config_path());
        let config = fs::read_to_string(&path)
            .map_err(|_| BootVerificationError::ConfigMissing(path.clone()))?;
        let expected = self.request.root_parameter();
        if !config.contains(&expected) {
            return Err(BootVerificationError::ConfigIncomplete { path, expected });
        }

        let entries = runner
            .run(&Invocation::new("efibootmgr").timeout(self.request.timeout))
            .map_err(BootVerificationError::Command)?;
        let label = self.request.bootloader.efi_label();
        if !has_boot_entry(&entries.stdout, label) {
            return Err(BootVerificationError::EntryMissing {
                label: label.to_string(),
            });
        }

        tracing::debug!("Boot configuration: {} -> {}", self.state, BootState::Verified);
        self.state = BootState::Verified;
        tracing::info!("Boot configuration verified ({} entry present)", label);
        Ok(())
    }
}

/// True when `efibootmgr` output lists an entry called `label`.
fn has_boot_entry(efibootmgr: &str, label: &str) -> bool {
    efibootmgr
        .lines()
        .filter(|line| line.starts_with("Boot") && !line.starts_with("BootOrder"))
        .filter_map(|line| line.split_once(' ').map(|(_, rest)| rest))
        .any(|rest| rest.trim_start().starts_with(label))
}
