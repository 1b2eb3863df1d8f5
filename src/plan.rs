//! Installation plan handling.
//!
//! A [`PlanConfig`] is the raw JSON document produced by the prompt layer
//! (or written by hand). [`InstallPlan::from_config`] validates it once and
//! yields an immutable plan; every workflow step reads from that plan and
//! nothing can change it afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::disk::partition_number;
use crate::error::ValidationError;
use crate::pool::{CanMount, DatasetSpec};
use crate::types::{Bootloader, Compression, Kernel, NetworkBackend, Topology};

/// A value that must never be logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Where the pool encryption passphrase comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    Passphrase(Secret),
    /// Read when the pool is created, not when the plan is loaded
    KeyFile(PathBuf),
}

// ============================================================================
// Raw configuration (serde)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub topology: Topology,
    pub compression: Compression,
    pub ashift: u8,
    pub autotrim: bool,
    pub dedup: bool,
    /// Swap zvol size in GiB, 0 for none. Derived from installed memory
    /// when unset, see [`default_swap_gib`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_gib: Option<u32>,
    /// Overwrite existing pool signatures on member partitions
    pub force: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "rpool".to_string(),
            topology: Topology::Single,
            compression: Compression::Lz4,
            ashift: 12,
            autotrim: true,
            dedup: false,
            swap_gib: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Secret>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub bootloader: Bootloader,
    pub kernel: Kernel,
    /// Enable os-prober so GRUB lists other operating systems
    pub dual_boot: bool,
    /// Put /boot on its own ext4 partition instead of inside the pool
    pub separate_boot: bool,
}

/// How the selected devices get their partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
pub enum Partitioning {
    /// Erase every device and apply the standard layout
    #[default]
    Wipe,
    /// Install onto partitions that already exist, one entry per device
    Existing { partitions: Vec<ExistingPartitions> },
}

/// Pre-existing partitions of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingPartitions {
    pub efi: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<PathBuf>,
    pub zfs: PathBuf,
}

/// Mirrorlist ranking on the live system before `pacstrap`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    /// Country filter passed to reflector; all mirrors when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// What happens after a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    /// Unmount the target and export the pool so it imports cleanly on first boot
    pub export_pool: bool,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self { export_pool: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: Secret,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_groups() -> Vec<String> {
    vec!["wheel".to_string()]
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub hostname: String,
    pub locale: String,
    pub keymap: String,
    pub timezone: String,
    pub root_password: Secret,
    pub users: Vec<UserConfig>,
    pub network: NetworkBackend,
    /// Additional units to enable; failures are reported, not fatal
    pub services: Vec<String>,
    pub extra_packages: Vec<String>,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            hostname: "archzfs".to_string(),
            locale: "en_US.UTF-8".to_string(),
            keymap: "us".to_string(),
            timezone: "UTC".to_string(),
            root_password: Secret::default(),
            users: Vec::new(),
            network: NetworkBackend::NetworkManager,
            services: Vec::new(),
            extra_packages: Vec::new(),
        }
    }
}

impl Default for Secret {
    fn default() -> Self {
        Self(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub command_timeout_secs: u64,
    pub bootstrap_timeout_secs: u64,
    pub bootstrap_attempts: u32,
    pub bootstrap_backoff_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 300,
            bootstrap_timeout_secs: 3600,
            bootstrap_attempts: 3,
            bootstrap_backoff_secs: 5,
        }
    }
}

/// Installation plan document as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Target disks, in the order that assigns pool member roles
    pub devices: Vec<PathBuf>,
    #[serde(default)]
    pub partitioning: Partitioning,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default = "default_datasets")]
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub system: SystemSettings,
    #[serde(default = "default_target")]
    pub target: PathBuf,
    #[serde(default)]
    pub mirrors: MirrorConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

fn default_target() -> PathBuf {
    PathBuf::from("/mnt")
}

/// The standard dataset hierarchy.
pub fn default_datasets() -> Vec<DatasetSpec> {
    vec![
        DatasetSpec::new("ROOT")
            .canmount(CanMount::Off)
            .mountpoint("none"),
        DatasetSpec::new("ROOT/arch")
            .canmount(CanMount::NoAuto)
            .mountpoint("/"),
        DatasetSpec::new("home").mountpoint("/home"),
        DatasetSpec::new("var")
            .mountpoint("/var")
            .property("com.sun:auto-snapshot", "false"),
        DatasetSpec::new("var/log"),
        DatasetSpec::new("var/cache"),
    ]
}

const GIB: u64 = 1024 * 1024 * 1024;
/// Assumed when installed memory could not be read.
const UNKNOWN_MEMORY_GIB: u64 = 8;

/// Swap size for a host with `memory_bytes` of RAM: half of it, kept
/// within 2..=32 GiB.
pub fn default_swap_gib(memory_bytes: u64) -> u32 {
    let memory_gib = match memory_bytes {
        0 => UNKNOWN_MEMORY_GIB,
        bytes => bytes / GIB,
    };
    (memory_gib / 2).clamp(2, 32) as u32
}

impl PlanConfig {
    /// A plan with every optional section at its default.
    pub fn new(devices: Vec<PathBuf>) -> Self {
        Self {
            devices,
            partitioning: Partitioning::default(),
            pool: PoolConfig::default(),
            encryption: EncryptionConfig::default(),
            datasets: default_datasets(),
            boot: BootConfig::default(),
            system: SystemSettings::default(),
            target: default_target(),
            mirrors: MirrorConfig::default(),
            finalize: FinalizeConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }

    /// Fill an unset swap size from the installed memory.
    pub fn with_host_memory(mut self, memory_bytes: u64) -> Self {
        if self.pool.swap_gib.is_none() {
            self.pool.swap_gib = Some(default_swap_gib(memory_bytes));
        }
        self
    }

    /// Save the plan to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write plan to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load a plan from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan from {:?}", path.as_ref()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON in {:?}", path.as_ref()))?;

        Ok(config)
    }
}

// ============================================================================
// Validated plan
// ============================================================================

/// Bounded retry for transient bootstrap failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    const MAX_BACKOFF: Duration = Duration::from_secs(120);

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(Self::MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(5),
        }
    }
}

/// Per-class command budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub command: Duration,
    pub bootstrap: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(300),
            bootstrap: Duration::from_secs(3600),
        }
    }
}

/// Validated, immutable description of the installation.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    devices: Vec<PathBuf>,
    partitioning: Partitioning,
    pool: PoolConfig,
    swap_gib: u32,
    encryption: Option<KeyRef>,
    datasets: Vec<DatasetSpec>,
    root_dataset: String,
    boot: BootConfig,
    system: SystemSettings,
    target: PathBuf,
    mirrors: MirrorConfig,
    finalize: FinalizeConfig,
    retry: RetryPolicy,
    timeouts: Timeouts,
}

const MAX_SWAP_GIB: u32 = 128;
const MIN_PASSPHRASE_LEN: usize = 8;
/// `zpool create` rejects names starting with these vdev keywords.
const RESERVED_POOL_PREFIXES: &[&str] = &["mirror", "raidz", "draid", "spare"];
/// Reserved only as an exact name.
const RESERVED_POOL_NAMES: &[&str] = &["log"];

impl InstallPlan {
    /// Validate `config` and freeze it.
    pub fn from_config(config: PlanConfig) -> Result<Self, ValidationError> {
        let PlanConfig {
            devices,
            partitioning,
            pool,
            encryption,
            datasets,
            boot,
            system,
            target,
            mirrors,
            finalize,
            execution,
        } = config;

        validate_devices(&devices, pool.topology)?;
        validate_pool(&pool)?;
        let swap_gib = pool.swap_gib.unwrap_or_else(|| default_swap_gib(0));
        let encryption = validate_encryption(encryption)?;
        let root_dataset = validate_datasets(&datasets)?;

        if boot.bootloader == Bootloader::SystemdBoot && boot.separate_boot {
            return Err(ValidationError::IncompatibleBootLayout(boot.bootloader));
        }
        // GRUB reads the kernel straight off the pool and has no native ZFS encryption support
        if boot_on_pool(&boot) {
            if encryption.is_some() {
                return Err(ValidationError::field(
                    "boot.separate_boot",
                    "GRUB cannot load a kernel from an encrypted pool; enable a separate /boot",
                ));
            }
            if pool.compression == Compression::Zstd {
                return Err(ValidationError::field(
                    "pool.compression",
                    "GRUB cannot read zstd-compressed datasets; use lz4 or a separate /boot",
                ));
            }
        }

        validate_partitioning(&partitioning, &devices, boot.separate_boot)?;
        validate_system(&system)?;
        validate_mirrors(&mirrors)?;

        if !target.is_absolute() {
            return Err(ValidationError::field(
                "target",
                format!("{} is not an absolute path", target.display()),
            ));
        }
        if target == Path::new("/") {
            return Err(ValidationError::field("target", "cannot install over /"));
        }

        if execution.bootstrap_attempts == 0 {
            return Err(ValidationError::field(
                "execution.bootstrap_attempts",
                "must be at least 1",
            ));
        }
        if execution.command_timeout_secs == 0 || execution.bootstrap_timeout_secs == 0 {
            return Err(ValidationError::field(
                "execution",
                "timeouts must be greater than zero",
            ));
        }

        Ok(Self {
            devices,
            partitioning,
            pool,
            swap_gib,
            encryption,
            datasets,
            root_dataset,
            boot,
            system,
            target,
            mirrors,
            finalize,
            retry: RetryPolicy {
                attempts: execution.bootstrap_attempts,
                initial_backoff: Duration::from_secs(execution.bootstrap_backoff_secs),
            },
            timeouts: Timeouts {
                command: Duration::from_secs(execution.command_timeout_secs),
                bootstrap: Duration::from_secs(execution.bootstrap_timeout_secs),
            },
        })
    }

    pub fn devices(&self) -> &[PathBuf] {
        &self.devices
    }

    pub fn partitioning(&self) -> &Partitioning {
        &self.partitioning
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Resolved swap zvol size in GiB, 0 for none.
    pub fn swap_gib(&self) -> u32 {
        self.swap_gib
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn topology(&self) -> Topology {
        self.pool.topology
    }

    pub fn encryption(&self) -> Option<&KeyRef> {
        self.encryption.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn datasets(&self) -> &[DatasetSpec] {
        &self.datasets
    }

    /// Dataset mounted at `/`, relative to the pool.
    pub fn root_dataset(&self) -> &str {
        &self.root_dataset
    }

    pub fn boot(&self) -> &BootConfig {
        &self.boot
    }

    pub fn bootloader(&self) -> Bootloader {
        self.boot.bootloader
    }

    /// `/boot` is a directory of the root dataset and GRUB reads it off the pool.
    pub fn boot_on_pool(&self) -> bool {
        boot_on_pool(&self.boot)
    }

    pub fn kernel(&self) -> Kernel {
        self.boot.kernel
    }

    pub fn system(&self) -> &SystemSettings {
        &self.system
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn mirrors(&self) -> &MirrorConfig {
        &self.mirrors
    }

    pub fn finalize(&self) -> &FinalizeConfig {
        &self.finalize
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }
}

fn boot_on_pool(boot: &BootConfig) -> bool {
    boot.bootloader == Bootloader::Grub && !boot.separate_boot
}

fn validate_devices(devices: &[PathBuf], topology: Topology) -> Result<(), ValidationError> {
    if devices.is_empty() {
        return Err(ValidationError::NoDevices);
    }

    let mut seen = HashSet::new();
    for device in devices {
        if !device.is_absolute() {
            return Err(ValidationError::field(
                "devices",
                format!("{} is not an absolute device path", device.display()),
            ));
        }
        if !seen.insert(device) {
            return Err(ValidationError::DuplicateDevice(device.clone()));
        }
    }

    if devices.len() < topology.min_devices() {
        return Err(ValidationError::TooFewDevices {
            topology,
            required: topology.min_devices(),
            found: devices.len(),
        });
    }

    Ok(())
}

fn validate_pool(pool: &PoolConfig) -> Result<(), ValidationError> {
    let name = pool.name.as_str();
    if name.is_empty() {
        return Err(ValidationError::field("pool.name", "must be specified"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(ValidationError::field("pool.name", "must start with a letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(ValidationError::field(
            "pool.name",
            "may only contain letters, digits, '_', '-', '.' and ':'",
        ));
    }
    if RESERVED_POOL_PREFIXES
        .iter()
        .any(|reserved| name.starts_with(reserved))
        || RESERVED_POOL_NAMES.contains(&name)
    {
        return Err(ValidationError::field(
            "pool.name",
            format!("{} collides with a reserved vdev keyword", name),
        ));
    }

    if !(9..=16).contains(&pool.ashift) {
        return Err(ValidationError::field(
            "pool.ashift",
            format!("{} is outside 9..=16", pool.ashift),
        ));
    }

    if let Some(swap) = pool.swap_gib.filter(|&gib| gib > MAX_SWAP_GIB) {
        return Err(ValidationError::field(
            "pool.swap_gib",
            format!("{} exceeds the {} GiB limit", swap, MAX_SWAP_GIB),
        ));
    }

    Ok(())
}

fn validate_encryption(config: EncryptionConfig) -> Result<Option<KeyRef>, ValidationError> {
    if !config.enabled {
        return Ok(None);
    }

    match (config.passphrase, config.key_file) {
        (Some(_), Some(_)) => Err(ValidationError::field(
            "encryption",
            "set either passphrase or key_file, not both",
        )),
        (None, None) => Err(ValidationError::field(
            "encryption",
            "enabled without a passphrase or key_file",
        )),
        (Some(passphrase), None) => {
            if passphrase.expose().len() < MIN_PASSPHRASE_LEN {
                return Err(ValidationError::field(
                    "encryption.passphrase",
                    format!("must be at least {} characters", MIN_PASSPHRASE_LEN),
                ));
            }
            // zpool reads the passphrase up to the first newline
            if has_control_chars(&passphrase) {
                return Err(ValidationError::field(
                    "encryption.passphrase",
                    "must not contain control characters",
                ));
            }
            Ok(Some(KeyRef::Passphrase(passphrase)))
        }
        (None, Some(path)) => {
            if !path.is_absolute() {
                return Err(ValidationError::field(
                    "encryption.key_file",
                    format!("{} is not an absolute path", path.display()),
                ));
            }
            Ok(Some(KeyRef::KeyFile(path)))
        }
    }
}

fn validate_partitioning(
    partitioning: &Partitioning,
    devices: &[PathBuf],
    separate_boot: bool,
) -> Result<(), ValidationError> {
    let Partitioning::Existing { partitions } = partitioning else {
        return Ok(());
    };

    if partitions.len() != devices.len() {
        return Err(ValidationError::field(
            "partitioning.partitions",
            format!(
                "{} entries for {} device(s); list one per device in device order",
                partitions.len(),
                devices.len()
            ),
        ));
    }

    let mut seen = HashSet::new();
    for (device, entry) in devices.iter().zip(partitions) {
        if entry.boot.is_some() != separate_boot {
            return Err(ValidationError::field(
                "partitioning.partitions.boot",
                format!(
                    "{}: a boot partition is required exactly when boot.separate_boot is set",
                    device.display()
                ),
            ));
        }

        for part in [Some(&entry.efi), entry.boot.as_ref(), Some(&entry.zfs)]
            .into_iter()
            .flatten()
        {
            if !part.is_absolute() {
                return Err(ValidationError::field(
                    "partitioning.partitions",
                    format!("{} is not an absolute path", part.display()),
                ));
            }
            if partition_number(device, part).is_none() {
                return Err(ValidationError::field(
                    "partitioning.partitions",
                    format!("{} is not a partition of {}", part.display(), device.display()),
                ));
            }
            if !seen.insert(part) {
                return Err(ValidationError::field(
                    "partitioning.partitions",
                    format!("{} is used more than once", part.display()),
                ));
            }
        }
    }

    Ok(())
}

fn validate_mirrors(mirrors: &MirrorConfig) -> Result<(), ValidationError> {
    if let Some(country) = mirrors.country.as_deref() {
        if country.trim().is_empty() || country.chars().any(char::is_control) {
            return Err(ValidationError::field(
                "mirrors.country",
                format!("{:?} is not a country name or code", country),
            ));
        }
    }
    Ok(())
}

/// Returns the name of the dataset mounted at `/`.
fn validate_datasets(datasets: &[DatasetSpec]) -> Result<String, ValidationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut root = None;

    for dataset in datasets {
        let name = dataset.name.as_str();
        if name.is_empty()
            || name.starts_with('/')
            || name.ends_with('/')
            || name.contains("//")
            || name.contains('@')
        {
            return Err(ValidationError::DatasetLayout(format!(
                "invalid dataset name {:?}",
                name
            )));
        }
        if name == "swap" {
            return Err(ValidationError::DatasetLayout(
                "\"swap\" is reserved for the swap volume".to_string(),
            ));
        }
        if let Some(parent) = dataset.parent() {
            if !seen.contains(parent) {
                return Err(ValidationError::DatasetLayout(format!(
                    "{} is listed before its parent {}",
                    name, parent
                )));
            }
        }
        if !seen.insert(name) {
            return Err(ValidationError::DatasetLayout(format!(
                "{} is listed more than once",
                name
            )));
        }

        if let Some(mountpoint) = dataset.mountpoint.as_deref() {
            if mountpoint != "none" && !mountpoint.starts_with('/') {
                return Err(ValidationError::DatasetLayout(format!(
                    "{}: mountpoint {:?} must be absolute or \"none\"",
                    name, mountpoint
                )));
            }
            if mountpoint == "/" {
                if root.is_some() {
                    return Err(ValidationError::DatasetLayout(
                        "more than one dataset is mounted at /".to_string(),
                    ));
                }
                if dataset.canmount == CanMount::Off {
                    return Err(ValidationError::DatasetLayout(format!(
                        "{} is mounted at / but has canmount=off",
                        name
                    )));
                }
                root = Some(name.to_string());
            }
        }
    }

    root.ok_or_else(|| ValidationError::DatasetLayout("no dataset is mounted at /".to_string()))
}

fn validate_system(system: &SystemSettings) -> Result<(), ValidationError> {
    let hostname = system.hostname.trim();
    if hostname.is_empty() || hostname.len() > 63 {
        return Err(ValidationError::field(
            "system.hostname",
            "must be 1-63 characters long",
        ));
    }
    if hostname.starts_with('-')
        || hostname.ends_with('-')
        || !hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ValidationError::field(
            "system.hostname",
            "may only contain letters, digits and inner hyphens",
        ));
    }

    if system.locale.trim().is_empty() || system.locale.contains(char::is_whitespace) {
        return Err(ValidationError::field("system.locale", "must be a locale name"));
    }
    if system.keymap.trim().is_empty() {
        return Err(ValidationError::field("system.keymap", "must be specified"));
    }
    let tz = system.timezone.as_str();
    if tz.is_empty() || tz.starts_with('/') || tz.split('/').any(|part| part == "..") {
        return Err(ValidationError::field(
            "system.timezone",
            format!("{:?} is not a zoneinfo name", tz),
        ));
    }

    if system.root_password.is_empty() {
        return Err(ValidationError::field(
            "system.root_password",
            "must be specified",
        ));
    }
    // chpasswd reads one `name:password` pair per line
    if has_control_chars(&system.root_password) {
        return Err(ValidationError::field(
            "system.root_password",
            "must not contain control characters",
        ));
    }

    let mut names = HashSet::new();
    for user in &system.users {
        validate_username(&user.name)?;
        if !names.insert(user.name.as_str()) {
            return Err(ValidationError::field(
                "system.users",
                format!("{} is listed more than once", user.name),
            ));
        }
        if user.password.is_empty() {
            return Err(ValidationError::field(
                "system.users.password",
                format!("{} has no password", user.name),
            ));
        }
        if has_control_chars(&user.password) {
            return Err(ValidationError::field(
                "system.users.password",
                format!("password of {} contains control characters", user.name),
            ));
        }
        if !user.shell.starts_with('/') {
            return Err(ValidationError::field(
                "system.users.shell",
                format!("{:?} is not an absolute path", user.shell),
            ));
        }
    }

    Ok(())
}

fn has_control_chars(secret: &Secret) -> bool {
    secret.expose().chars().any(char::is_control)
}

fn validate_username(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > 32 {
        return Err(ValidationError::field(
            "system.users.name",
            "must be 1-32 characters long",
        ));
    }
    if name == "root" {
        return Err(ValidationError::field(
            "system.users.name",
            "root is configured through root_password",
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
        return Err(ValidationError::field(
            "system.users.name",
            format!("{} must start with a lowercase letter or underscore", name),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(ValidationError::field(
            "system.users.name",
            format!("{} may only contain a-z, 0-9, '_' and '-'", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> PlanConfig {
        let mut config = PlanConfig::new(vec![PathBuf::from("/dev/sdb")]);
        config.system.root_password = Secret::new("rootpw");
        config
    }

    #[test]
    fn test_default_plan_validates() {
        let plan = InstallPlan::from_config(sample_config()).expect("valid");
        assert_eq!(plan.pool_name(), "rpool");
        assert_eq!(plan.root_dataset(), "ROOT/arch");
        assert_eq!(plan.target(), Path::new("/mnt"));
        assert!(!plan.is_encrypted());
        assert_eq!(plan.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_too_few_devices_for_topology() {
        let mut config = sample_config();
        config.pool.topology = Topology::Mirror;
        let err = InstallPlan::from_config(config).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooFewDevices {
                topology: Topology::Mirror,
                required: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let mut config = sample_config();
        config.devices.push(PathBuf::from("/dev/sdb"));
        assert_eq!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::DuplicateDevice(PathBuf::from("/dev/sdb"))
        );
    }

    #[test]
    fn test_short_passphrase_rejected() {
        let mut config = sample_config();
        config.encryption = EncryptionConfig {
            enabled: true,
            passphrase: Some(Secret::new("short")),
            key_file: None,
        };
        let err = InstallPlan::from_config(config).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField {
                field: "encryption.passphrase",
                ..
            }
        ));
    }

    #[test]
    fn test_encryption_with_key_file() {
        let mut config = sample_config();
        config.encryption = EncryptionConfig {
            enabled: true,
            passphrase: None,
            key_file: Some(PathBuf::from("/root/pool.key")),
        };
        config.boot.separate_boot = true;
        let plan = InstallPlan::from_config(config).expect("valid");
        assert_eq!(
            plan.encryption(),
            Some(&KeyRef::KeyFile(PathBuf::from("/root/pool.key")))
        );
    }

    #[test]
    fn test_systemd_boot_with_separate_boot_rejected() {
        let mut config = sample_config();
        config.boot.bootloader = Bootloader::SystemdBoot;
        config.boot.separate_boot = true;
        assert_eq!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::IncompatibleBootLayout(Bootloader::SystemdBoot)
        );
    }

    #[test]
    fn test_grub_on_encrypted_pool_needs_separate_boot() {
        let mut config = sample_config();
        config.encryption = EncryptionConfig {
            enabled: true,
            passphrase: Some(Secret::new("correct horse")),
            key_file: None,
        };
        assert!(matches!(
            InstallPlan::from_config(config.clone()).unwrap_err(),
            ValidationError::InvalidField { field: "boot.separate_boot", .. }
        ));

        config.boot.separate_boot = true;
        assert!(InstallPlan::from_config(config).is_ok());
    }

    #[test]
    fn test_grub_on_pool_rejects_zstd() {
        let mut config = sample_config();
        config.pool.compression = Compression::Zstd;
        assert!(matches!(
            InstallPlan::from_config(config.clone()).unwrap_err(),
            ValidationError::InvalidField { field: "pool.compression", .. }
        ));

        config.boot.separate_boot = true;
        let plan = InstallPlan::from_config(config).expect("valid");
        assert!(!plan.boot_on_pool());
    }

    #[test]
    fn test_default_plan_keeps_boot_on_pool() {
        let plan = InstallPlan::from_config(sample_config()).expect("valid");
        assert!(plan.boot_on_pool());

        let mut config = sample_config();
        config.boot.bootloader = Bootloader::SystemdBoot;
        let plan = InstallPlan::from_config(config).expect("valid");
        assert!(!plan.boot_on_pool());
    }

    #[test]
    fn test_dataset_listed_before_parent_rejected() {
        let mut config = sample_config();
        config.datasets.swap(4, 3); // var/log ahead of var
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::DatasetLayout(_)
        ));
    }

    #[test]
    fn test_layout_without_root_rejected() {
        let mut config = sample_config();
        config.datasets.retain(|d| d.name != "ROOT/arch");
        assert_eq!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::DatasetLayout("no dataset is mounted at /".to_string())
        );
    }

    #[test]
    fn test_invalid_hostname_and_username() {
        let mut config = sample_config();
        config.system.hostname = "-bad".to_string();
        assert!(InstallPlan::from_config(config).is_err());

        let mut config = sample_config();
        config.system.users.push(UserConfig {
            name: "Alice".to_string(),
            password: Secret::new("pw"),
            groups: default_groups(),
            shell: default_shell(),
        });
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::InvalidField {
                field: "system.users.name",
                ..
            }
        ));
    }

    #[test]
    fn test_newline_in_password_rejected() {
        let mut config = sample_config();
        config.system.root_password = Secret::new("rootpw\nmallory:owned");
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::InvalidField { field: "system.root_password", .. }
        ));

        let mut config = sample_config();
        config.system.users.push(UserConfig {
            name: "alice".to_string(),
            password: Secret::new("pw\nroot:owned"),
            groups: default_groups(),
            shell: default_shell(),
        });
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::InvalidField { field: "system.users.password", .. }
        ));

        let mut config = sample_config();
        config.boot.separate_boot = true;
        config.encryption = EncryptionConfig {
            enabled: true,
            passphrase: Some(Secret::new("correct\rhorse")),
            key_file: None,
        };
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::InvalidField { field: "encryption.passphrase", .. }
        ));
    }

    #[test]
    fn test_reserved_pool_name_rejected() {
        for name in ["mirror0", "raidz", "spare1", "log"] {
            let mut config = sample_config();
            config.pool.name = name.to_string();
            assert!(
                matches!(
                    InstallPlan::from_config(config).unwrap_err(),
                    ValidationError::InvalidField { field: "pool.name", .. }
                ),
                "{} accepted",
                name
            );
        }
    }

    #[test]
    fn test_pool_names_sharing_a_keyword_prefix_accepted() {
        for name in ["logpool", "cachepool", "cache", "tank"] {
            let mut config = sample_config();
            config.pool.name = name.to_string();
            let plan = InstallPlan::from_config(config).expect(name);
            assert_eq!(plan.pool_name(), name);
        }
    }

    #[test]
    fn test_default_swap_follows_memory() {
        assert_eq!(default_swap_gib(16 * GIB), 8);
        assert_eq!(default_swap_gib(2 * GIB), 2);
        assert_eq!(default_swap_gib(512 * GIB), 32);
        // unknown memory counts as 8 GiB
        assert_eq!(default_swap_gib(0), 4);
        assert_eq!(default_swap_gib(GIB / 2), 2);
    }

    #[test]
    fn test_swap_resolution() {
        let plan = InstallPlan::from_config(sample_config()).expect("valid");
        assert_eq!(plan.swap_gib(), 4);

        let config = sample_config().with_host_memory(24 * GIB);
        assert_eq!(config.pool.swap_gib, Some(12));
        assert_eq!(InstallPlan::from_config(config).expect("valid").swap_gib(), 12);

        let mut config = sample_config();
        config.pool.swap_gib = Some(0);
        let config = config.with_host_memory(64 * GIB);
        assert_eq!(InstallPlan::from_config(config).expect("valid").swap_gib(), 0);

        let mut config = sample_config();
        config.pool.swap_gib = Some(MAX_SWAP_GIB + 1);
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::InvalidField { field: "pool.swap_gib", .. }
        ));
    }

    fn existing(efi: &str, boot: Option<&str>, zfs: &str) -> ExistingPartitions {
        ExistingPartitions {
            efi: PathBuf::from(efi),
            boot: boot.map(PathBuf::from),
            zfs: PathBuf::from(zfs),
        }
    }

    #[test]
    fn test_existing_partitions_accepted() {
        let mut config = sample_config();
        config.devices = vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/nvme0n1")];
        config.pool.topology = Topology::Mirror;
        config.partitioning = Partitioning::Existing {
            partitions: vec![
                existing("/dev/sdb1", None, "/dev/sdb3"),
                existing("/dev/nvme0n1p1", None, "/dev/nvme0n1p2"),
            ],
        };
        let plan = InstallPlan::from_config(config).expect("valid");
        assert!(matches!(plan.partitioning(), Partitioning::Existing { partitions } if partitions.len() == 2));
    }

    #[test]
    fn test_existing_partitions_rejected() {
        let cases = [
            // entry count differs from device count
            vec![],
            // partition of another disk
            vec![existing("/dev/sdb1", None, "/dev/sdc2")],
            // same partition twice
            vec![existing("/dev/sdb1", None, "/dev/sdb1")],
            // boot partition without separate_boot
            vec![existing("/dev/sdb1", Some("/dev/sdb2"), "/dev/sdb3")],
            // whole disk instead of a partition
            vec![existing("/dev/sdb1", None, "/dev/sdb")],
        ];
        for partitions in cases {
            let mut config = sample_config();
            config.partitioning = Partitioning::Existing {
                partitions: partitions.clone(),
            };
            assert!(
                matches!(
                    InstallPlan::from_config(config).unwrap_err(),
                    ValidationError::InvalidField { .. }
                ),
                "{:?} accepted",
                partitions
            );
        }

        let mut config = sample_config();
        config.boot.separate_boot = true;
        config.partitioning = Partitioning::Existing {
            partitions: vec![existing("/dev/sdb1", Some("/dev/sdb2"), "/dev/sdb3")],
        };
        assert!(InstallPlan::from_config(config).is_ok());
    }

    #[test]
    fn test_partitioning_json_shape() {
        let json = r#"{
            "devices": ["/dev/sdb"],
            "partitioning": {
                "scheme": "existing",
                "partitions": [{ "efi": "/dev/sdb1", "zfs": "/dev/sdb4" }]
            },
            "mirrors": { "enabled": true, "country": "DE" },
            "finalize": { "export_pool": false },
            "system": { "root_password": "rootpw" }
        }"#;
        let config: PlanConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(
            config.partitioning,
            Partitioning::Existing {
                partitions: vec![existing("/dev/sdb1", None, "/dev/sdb4")]
            }
        );
        let plan = InstallPlan::from_config(config).expect("valid");
        assert_eq!(plan.mirrors().country.as_deref(), Some("DE"));
        assert!(!plan.finalize().export_pool);
    }

    #[test]
    fn test_blank_mirror_country_rejected() {
        let mut config = sample_config();
        config.mirrors = MirrorConfig {
            enabled: true,
            country: Some(" ".to_string()),
        };
        assert!(matches!(
            InstallPlan::from_config(config).unwrap_err(),
            ValidationError::InvalidField { field: "mirrors.country", .. }
        ));
    }

    #[test]
    fn test_relative_target_rejected() {
        let mut config = sample_config();
        config.target = PathBuf::from("mnt");
        assert!(InstallPlan::from_config(config).is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(20));
        assert_eq!(policy.backoff_after(30), Duration::from_secs(120));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(<redacted>)");
        let config = sample_config();
        assert!(!format!("{:?}", config).contains("rootpw"));
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "devices": ["/dev/sdb"],
            "system": { "root_password": "rootpw" }
        }"#;
        let config: PlanConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.datasets, default_datasets());
        assert_eq!(config.system.hostname, "archzfs");
        assert_eq!(config.partitioning, Partitioning::Wipe);
        assert!(!config.mirrors.enabled);
        assert!(config.finalize.export_pool);
        assert!(InstallPlan::from_config(config).is_ok());
    }

    #[test]
    fn test_unknown_enum_value_fails_to_parse() {
        let json = r#"{ "devices": ["/dev/sdb"], "pool": { "topology": "raid5" } }"#;
        assert!(serde_json::from_str::<PlanConfig>(json).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("plan.json");
        let config = sample_config();
        config.save_to_file(&path).expect("save");
        let loaded = PlanConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = PlanConfig::load_from_file("/nonexistent/plan.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read plan"));
    }
}
