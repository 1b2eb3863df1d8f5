//! Disk inventory and partitioner
//!
//! Discovery is read-only. Partitioning is the first destructive step of the
//! workflow and is never retried: a half-written partition table cannot be
//! resumed safely, so any failure aborts the run.
//!
//! # Standard layout
//!
//! | # | Purpose     | Size      | Type | Filesystem |
//! |---|-------------|-----------|------|------------|
//! | 1 | EFI         | 512 MiB   | ef00 | vfat       |
//! | 2 | Boot (opt.) | 1 GiB     | 8300 | ext4       |
//! | n | ZFS member  | remainder | bf00 | (pool)     |
//!
//! Every selected device receives the same layout so pool members have
//! matching sizes. Only the first device's EFI and boot partitions are
//! mounted into the target.
//!
//! With existing partitions nothing is erased: the ESP is formatted only
//! when it does not already carry vfat, the boot partition is reformatted
//! and the ZFS member is left for the pool builder's signature check.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{CommandRunner, Invocation};
use crate::error::{
    CommandFailure, DiscoveryError, MountError, PartitionCause, PartitionError, ValidationError,
};
use crate::hardware::FirmwareMode;
use crate::types::{Bootloader, PartitionFs, PartitionPurpose, Topology};

/// Smallest device accepted for installation (8 GiB).
pub const MIN_DEVICE_BYTES: u64 = 8 * 1024 * 1024 * 1024;

const EFI_SIZE_MIB: u64 = 512;
const BOOT_SIZE_MIB: u64 = 1024;

// ============================================================================
// Discovery
// ============================================================================

/// A block device found by [`discover`].
///
/// Only valid until something partitions a disk; rediscover afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub model: Option<String>,
    pub read_only: bool,
    /// Whether firmware can boot an EFI system partition on this device
    pub uefi_bootable: bool,
    /// Current partition table type (`gpt`, `dos`), if any
    pub partition_table: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.1} GiB {} [{}]{}",
            self.path.display(),
            self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            self.model.as_deref().unwrap_or("unknown model"),
            self.partition_table.as_deref().unwrap_or("no table"),
            if self.read_only { " (read-only)" } else { "" }
        )
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

/// lsblk versions differ on whether numbers and flags are JSON numbers,
/// booleans or strings, so those fields are kept loose.
#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    size: serde_json::Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    ro: serde_json::Value,
    #[serde(default)]
    pttype: Option<String>,
}

fn loose_u64(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn loose_bool(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
        serde_json::Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

/// Parse `lsblk -J` output into descriptors, keeping whole disks only.
pub fn parse_lsblk(json: &str, firmware: FirmwareMode) -> Result<Vec<DeviceDescriptor>, serde_json::Error> {
    let output: LsblkOutput = serde_json::from_str(json)?;

    let mut devices: Vec<DeviceDescriptor> = output
        .blockdevices
        .into_iter()
        .filter(|dev| dev.kind == "disk")
        .map(|dev| DeviceDescriptor {
            path: PathBuf::from(
                dev.path
                    .unwrap_or_else(|| format!("/dev/{}", dev.name)),
            ),
            size_bytes: loose_u64(&dev.size),
            model: dev
                .model
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            read_only: loose_bool(&dev.ro),
            uefi_bootable: firmware.is_uefi(),
            partition_table: dev.pttype.filter(|p| !p.is_empty()),
        })
        .collect();

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// List whole-disk block devices.
///
/// Non-destructive; two calls with no partitioning in between return the
/// same set in the same order. Loop (7) and optical (11) devices are
/// excluded.
pub fn discover(
    runner: &dyn CommandRunner,
    firmware: FirmwareMode,
    timeout: Duration,
) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
    let output = runner.run(
        &Invocation::new("lsblk")
            .args(["-J", "-b", "-d", "-o", "NAME,PATH,SIZE,MODEL,TYPE,RO,PTTYPE"])
            .args(["-e", "7,11"])
            .timeout(timeout),
    )?;

    let devices = parse_lsblk(&output.stdout, firmware)?;
    tracing::info!("Discovered {} disk(s)", devices.len());
    for device in &devices {
        tracing::debug!("  {}", device);
    }
    Ok(devices)
}

/// Resolve the plan's device paths against the discovered set, keeping
/// plan order.
pub fn select_devices(
    discovered: &[DeviceDescriptor],
    wanted: &[PathBuf],
) -> Result<Vec<DeviceDescriptor>, ValidationError> {
    wanted
        .iter()
        .map(|path| {
            discovered
                .iter()
                .find(|dev| &dev.path == path)
                .cloned()
                .ok_or_else(|| ValidationError::UnknownDevice(path.clone()))
        })
        .collect()
}

/// Check that `devices` can host a pool of `topology`.
pub fn validate_selection(
    devices: &[DeviceDescriptor],
    topology: Topology,
) -> Result<(), ValidationError> {
    if devices.is_empty() {
        return Err(ValidationError::NoDevices);
    }

    let mut seen = HashSet::new();
    for device in devices {
        if !seen.insert(&device.path) {
            return Err(ValidationError::DuplicateDevice(device.path.clone()));
        }
        if !device.uefi_bootable {
            return Err(ValidationError::NotUefi(device.path.clone()));
        }
        if device.read_only {
            return Err(ValidationError::ReadOnlyDevice(device.path.clone()));
        }
        if device.size_bytes < MIN_DEVICE_BYTES {
            return Err(ValidationError::DeviceTooSmall {
                device: device.path.clone(),
                size: device.size_bytes,
                minimum: MIN_DEVICE_BYTES,
            });
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

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    MiB(u64),
    /// Everything left on the device
    Remainder,
    /// Already on disk, size unchanged
    Existing,
}

/// One partition of a [`PartitionLayout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub number: u32,
    pub purpose: PartitionPurpose,
    pub size: PartitionSize,
    pub filesystem: PartitionFs,
    /// Device node of the partition, e.g. `/dev/nvme0n1p3`
    pub path: PathBuf,
}

impl PartitionSpec {
    fn sgdisk_args(&self) -> Vec<String> {
        let end = match self.size {
            PartitionSize::MiB(mib) => format!("+{}M", mib),
            PartitionSize::Remainder => "0".to_string(),
            PartitionSize::Existing => return Vec::new(),
        };
        vec![
            format!("--new={}:0:{}", self.number, end),
            format!("--typecode={}:{}", self.number, self.purpose.typecode()),
            format!("--change-name={}:{}", self.number, self.purpose.gpt_name()),
        ]
    }
}

/// Ordered partitions applied to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub device: PathBuf,
    pub partitions: Vec<PartitionSpec>,
}

impl PartitionLayout {
    /// EFI, optional boot, then the ZFS member filling the rest.
    pub fn standard(device: &Path, separate_boot: bool) -> Self {
        let mut purposes = vec![(PartitionPurpose::Efi, PartitionSize::MiB(EFI_SIZE_MIB), PartitionFs::Vfat)];
        if separate_boot {
            purposes.push((PartitionPurpose::Boot, PartitionSize::MiB(BOOT_SIZE_MIB), PartitionFs::Ext4));
        }
        purposes.push((PartitionPurpose::ZfsMember, PartitionSize::Remainder, PartitionFs::Zfs));

        let partitions = purposes
            .into_iter()
            .zip(1u32..)
            .map(|((purpose, size, filesystem), number)| PartitionSpec {
                number,
                purpose,
                size,
                filesystem,
                path: partition_path(device, number),
            })
            .collect();

        Self {
            device: device.to_path_buf(),
            partitions,
        }
    }

    /// Partitions the user prepared on `device`, in EFI, boot, ZFS order.
    pub fn existing(device: &Path, efi: &Path, boot: Option<&Path>, zfs: &Path) -> Self {
        let mut parts = vec![(PartitionPurpose::Efi, efi, PartitionFs::Vfat)];
        if let Some(boot) = boot {
            parts.push((PartitionPurpose::Boot, boot, PartitionFs::Ext4));
        }
        parts.push((PartitionPurpose::ZfsMember, zfs, PartitionFs::Zfs));

        let partitions = parts
            .into_iter()
            .map(|(purpose, path, filesystem)| PartitionSpec {
                number: partition_number(device, path).unwrap_or(0),
                purpose,
                size: PartitionSize::Existing,
                filesystem,
                path: path.to_path_buf(),
            })
            .collect();

        Self {
            device: device.to_path_buf(),
            partitions,
        }
    }

    /// True when every partition already exists on disk.
    pub fn is_existing(&self) -> bool {
        self.partitions
            .iter()
            .all(|p| p.size == PartitionSize::Existing)
    }

    pub fn find(&self, purpose: PartitionPurpose) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.purpose == purpose)
    }

    pub fn efi(&self) -> Option<&PartitionSpec> {
        self.find(PartitionPurpose::Efi)
    }

    pub fn boot(&self) -> Option<&PartitionSpec> {
        self.find(PartitionPurpose::Boot)
    }

    pub fn zfs_member(&self) -> Option<&PartitionSpec> {
        self.find(PartitionPurpose::ZfsMember)
    }
}

/// Construct a partition device path from a disk path and partition number.
///
/// NVMe, mmcblk and loop devices use a `p` separator
/// (e.g., /dev/nvme0n1p1, /dev/loop0p1).
pub fn partition_path(disk: &Path, partition_num: u32) -> PathBuf {
    let disk_str = disk.display().to_string();

    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, partition_num))
    } else {
        PathBuf::from(format!("{}{}", disk_str, partition_num))
    }
}

/// Inverse of [`partition_path`]: the number of `partition` on `disk`.
pub fn partition_number(disk: &Path, partition: &Path) -> Option<u32> {
    let disk_str = disk.to_str()?;
    let rest = partition.to_str()?.strip_prefix(disk_str)?;
    let digits = if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        rest.strip_prefix('p')?
    } else {
        rest
    };
    if digits.is_empty() || digits.starts_with('0') || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ============================================================================
// Partitioning
// ============================================================================

/// Erase `layout.device` and apply `layout`.
///
/// DESTRUCTIVE: all data on the device is lost on success.
pub fn partition(
    runner: &dyn CommandRunner,
    layout: &PartitionLayout,
    timeout: Duration,
) -> Result<PartitionLayout, PartitionError> {
    let device = layout.device.display().to_string();
    let fail = |source: PartitionCause| PartitionError {
        device: layout.device.clone(),
        source,
    };
    let run = |inv: Invocation| {
        runner
            .run(&inv.timeout(timeout))
            .map(drop)
            .map_err(|e| fail(PartitionCause::Command(e)))
    };

    if layout.partitions.iter().any(|p| p.size == PartitionSize::Existing) {
        return Err(fail(PartitionCause::ExistingLayout));
    }

    tracing::warn!("Erasing partition table on {}", device);
    run(Invocation::new("sgdisk").args(["--zap-all", device.as_str()]))?;

    for spec in &layout.partitions {
        tracing::info!(
            "Creating partition {} ({}) on {}",
            spec.number,
            spec.purpose,
            device
        );
        run(Invocation::new("sgdisk")
            .args(spec.sgdisk_args())
            .arg(device.as_str()))?;
    }

    run(Invocation::new("partprobe").arg(device.as_str()))?;
    run(Invocation::new("udevadm").arg("settle"))?;

    for spec in &layout.partitions {
        let part = spec.path.display().to_string();
        match spec.filesystem {
            PartitionFs::Vfat => {
                run(Invocation::new("mkfs.fat").args(["-F32", "-n", "EFI", part.as_str()]))?
            }
            PartitionFs::Ext4 => {
                run(Invocation::new("mkfs.ext4").args(["-F", "-L", "BOOT", part.as_str()]))?
            }
            PartitionFs::Zfs => {}
        }
    }

    Ok(layout.clone())
}

/// Filesystem signature of `partition`, `None` when blkid finds none.
fn filesystem_type(
    runner: &dyn CommandRunner,
    partition: &Path,
    timeout: Duration,
) -> Result<Option<String>, CommandFailure> {
    let part = partition.display().to_string();
    let output = runner.execute(
        &Invocation::new("blkid")
            .args(["-o", "value", "-s", "TYPE", part.as_str()])
            .timeout(timeout),
    )?;
    match output.exit_code {
        Some(0) => Ok(Some(output.stdout.trim().to_ascii_lowercase()).filter(|t| !t.is_empty())),
        // blkid exits 2 when it finds no signature at all
        Some(2) => Ok(None),
        code => Err(CommandFailure::Exit {
            command: format!("blkid -o value -s TYPE {}", part),
            code,
            stderr: output.stderr,
        }),
    }
}

/// Format the existing partitions of `layout` for installation.
///
/// DESTRUCTIVE for the boot partition and for an ESP without vfat; the
/// partition table and the ZFS member are not touched.
pub fn prepare_existing(
    runner: &dyn CommandRunner,
    layout: &PartitionLayout,
    timeout: Duration,
) -> Result<PartitionLayout, PartitionError> {
    let fail = |source: CommandFailure| PartitionError {
        device: layout.device.clone(),
        source: PartitionCause::Command(source),
    };

    for spec in &layout.partitions {
        let part = spec.path.display().to_string();
        match spec.filesystem {
            PartitionFs::Vfat => {
                let current = filesystem_type(runner, &spec.path, timeout).map_err(fail)?;
                if current.as_deref() == Some("vfat") {
                    tracing::info!("Keeping existing vfat filesystem on {}", part);
                    continue;
                }
                tracing::warn!(
                    "{} is {}, formatting as FAT32",
                    part,
                    current.as_deref().unwrap_or("unformatted")
                );
                runner
                    .run(
                        &Invocation::new("mkfs.fat")
                            .args(["-F32", "-n", "EFI", part.as_str()])
                            .timeout(timeout),
                    )
                    .map_err(fail)?;
            }
            PartitionFs::Ext4 => {
                runner
                    .run(
                        &Invocation::new("mkfs.ext4")
                            .args(["-F", "-L", "BOOT", part.as_str()])
                            .timeout(timeout),
                    )
                    .map_err(fail)?;
            }
            PartitionFs::Zfs => {}
        }
    }

    runner
        .run(&Invocation::new("udevadm").arg("settle").timeout(timeout))
        .map_err(fail)?;
    Ok(layout.clone())
}

// ============================================================================
// Boot partition mounts
// ============================================================================

/// A non-ZFS filesystem mounted into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMount {
    pub source: PathBuf,
    /// Mount point as seen from inside the installed system
    pub mountpoint: PathBuf,
    pub filesystem: PartitionFs,
}

/// Mount the boot and EFI partitions of `layout` under `target`.
///
/// Runs after the root dataset is mounted. The separate boot partition (if
/// any) goes first so the ESP can nest beneath it.
pub fn mount_boot_partitions(
    runner: &dyn CommandRunner,
    layout: &PartitionLayout,
    target: &Path,
    bootloader: Bootloader,
    timeout: Duration,
) -> Result<Vec<BootMount>, MountError> {
    let mut mounts = Vec::new();

    if let Some(boot) = layout.boot() {
        mounts.push(BootMount {
            source: boot.path.clone(),
            mountpoint: PathBuf::from("/boot"),
            filesystem: PartitionFs::Ext4,
        });
    }
    if let Some(efi) = layout.efi() {
        mounts.push(BootMount {
            source: efi.path.clone(),
            mountpoint: PathBuf::from(bootloader.esp_mountpoint()),
            filesystem: PartitionFs::Vfat,
        });
    }

    for mount in &mounts {
        let dir = join_under(target, &mount.mountpoint);
        std::fs::create_dir_all(&dir).map_err(|source| MountError::Io {
            path: dir.clone(),
            source,
        })?;

        runner
            .run(
                &Invocation::new("mount")
                    .arg(mount.source.display().to_string())
                    .arg(dir.display().to_string())
                    .timeout(timeout),
            )
            .map_err(|source| MountError::Command {
                what: mount.source.display().to_string(),
                source,
            })?;
        tracing::info!("Mounted {} at {}", mount.source.display(), dir.display());
    }

    Ok(mounts)
}

/// `target` joined with an absolute in-system path.
pub fn join_under(target: &Path, absolute: &Path) -> PathBuf {
    match absolute.strip_prefix("/") {
        Ok(relative) if relative.as_os_str().is_empty() => target.to_path_buf(),
        Ok(relative) => target.join(relative),
        Err(_) => target.join(absolute),
    }
}
