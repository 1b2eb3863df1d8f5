//! ZFS pool builder
//!
//! Creates the pool over the partitioner's member partitions, lays out the
//! dataset hierarchy and mounts it under the target.
//!
//! Member order is never changed. With raidz the trailing members carry
//! parity, so the order the plan lists devices in is the order their
//! partitions reach `zpool create`.
//!
//! Encryption is bound to the pool root dataset. Children inherit it unless
//! their [`DatasetSpec`] opts out.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};

use crate::command::{CommandRunner, Invocation};
use crate::disk::{BootMount, PartitionLayout, join_under};
use crate::error::{CommandFailure, DatasetError, MountError, PoolCreationError};
use crate::plan::{InstallPlan, KeyRef, Secret};
use crate::types::{Compression, Topology};

/// Block size of the swap zvol; matches the x86_64 page size.
const SWAP_BLOCK_SIZE: &str = "4K";

/// Name of the swap zvol below the pool root.
pub const SWAP_VOLUME: &str = "swap";

/// ZFS `canmount` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CanMount {
    #[default]
    On,
    Off,
    NoAuto,
}

/// One dataset of the hierarchy, named relative to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    /// Absolute path, `none`, or unset to inherit from the parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub canmount: CanMount,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Create unencrypted even when the pool is encrypted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encryption_opt_out: bool,
}

impl DatasetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mountpoint: None,
            canmount: CanMount::On,
            properties: BTreeMap::new(),
            encryption_opt_out: false,
        }
    }

    pub fn mountpoint(mut self, mountpoint: impl Into<String>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn canmount(mut self, canmount: CanMount) -> Self {
        self.canmount = canmount;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn opt_out_of_encryption(mut self) -> Self {
        self.encryption_opt_out = true;
        self
    }

    /// Parent dataset name, or `None` for children of the pool root.
    pub fn parent(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(parent, _)| parent)
    }

    fn leaf(&self) -> &str {
        self.name.rsplit_once('/').map_or(self.name.as_str(), |(_, leaf)| leaf)
    }
}

/// Parameters for `zpool create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub topology: Topology,
    /// ZFS member partitions in plan device order
    pub members: Vec<PathBuf>,
    pub ashift: u8,
    pub autotrim: bool,
    pub compression: Compression,
    pub dedup: bool,
    pub encrypted: bool,
    pub force: bool,
    /// Restrict features to what GRUB's ZFS reader understands
    pub grub_compatible: bool,
    /// Alternate root; the installed `/` ends up here
    pub altroot: PathBuf,
}

impl PoolSpec {
    /// Collect member partitions from `layouts`, which are in plan order.
    pub fn from_plan(plan: &InstallPlan, layouts: &[PartitionLayout]) -> Self {
        let pool = plan.pool();
        Self {
            name: pool.name.clone(),
            topology: pool.topology,
            members: layouts
                .iter()
                .filter_map(|layout| layout.zfs_member())
                .map(|member| member.path.clone())
                .collect(),
            ashift: pool.ashift,
            autotrim: pool.autotrim,
            compression: pool.compression,
            dedup: pool.dedup,
            encrypted: plan.is_encrypted(),
            force: pool.force,
            grub_compatible: plan.boot_on_pool(),
            altroot: plan.target().to_path_buf(),
        }
    }

    /// Arguments to `zpool`, starting with `create`.
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string()];
        if self.force {
            args.push("-f".to_string());
        }

        let mut opt = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };
        opt("-o", format!("ashift={}", self.ashift));
        if self.grub_compatible {
            opt("-o", "compatibility=grub2".to_string());
        }
        opt(
            "-o",
            format!("autotrim={}", if self.autotrim { "on" } else { "off" }),
        );
        opt("-O", format!("compression={}", self.compression));
        for fixed in [
            "normalization=formD",
            "acltype=posixacl",
            "xattr=sa",
            "relatime=on",
            "canmount=off",
            "mountpoint=none",
        ] {
            opt("-O", fixed.to_string());
        }
        // large_dnode is unreadable by GRUB
        if !self.grub_compatible {
            opt("-O", "dnodesize=auto".to_string());
        }
        if self.dedup {
            opt("-O", "dedup=on".to_string());
        }
        if self.encrypted {
            opt("-O", "encryption=aes-256-gcm".to_string());
            opt("-O", "keyformat=passphrase".to_string());
            opt("-O", "keylocation=prompt".to_string());
        }
        opt("-R", self.altroot.display().to_string());

        args.push(self.name.clone());
        if let Some(keyword) = self.topology.vdev_keyword() {
            args.push(keyword.to_string());
        }
        args.extend(self.members.iter().map(|m| m.display().to_string()));
        args
    }
}

/// Handle to a created pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    pub altroot: PathBuf,
    pub topology: Topology,
    pub members: Vec<PathBuf>,
    pub encrypted: bool,
}

impl Pool {
    /// Full dataset name for a pool-relative `name`.
    pub fn dataset(&self, name: &str) -> String {
        format!("{}/{}", self.name, name)
    }

    /// Device node of the swap zvol.
    pub fn swap_device(&self) -> PathBuf {
        PathBuf::from(format!("/dev/zvol/{}/{}", self.name, SWAP_VOLUME))
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} member(s){})",
            self.name,
            self.topology,
            self.members.len(),
            if self.encrypted { ", encrypted" } else { "" }
        )
    }
}

// ============================================================================
// Pool creation
// ============================================================================

/// Check `member` for an existing ZFS label.
fn has_pool_signature(
    runner: &dyn CommandRunner,
    member: &Path,
    timeout: Duration,
) -> Result<bool, PoolCreationError> {
    let member_str = member.display().to_string();
    let output = runner
        .execute(
            &Invocation::new("blkid")
                .args(["-p", "-o", "value", "-s", "TYPE", member_str.as_str()])
                .timeout(timeout),
        )
        .map_err(|source| PoolCreationError::SignatureCheck {
            member: member.to_path_buf(),
            source,
        })?;

    match output.exit_code {
        Some(0) => Ok(output.stdout.lines().any(|l| l.trim() == "zfs_member")),
        // blkid exits 2 when it finds no signature at all
        Some(2) => Ok(false),
        _ => Err(PoolCreationError::SignatureCheck {
            member: member.to_path_buf(),
            source: CommandFailure::Exit {
                command: format!("blkid -p -o value -s TYPE {}", member_str),
                code: output.exit_code,
                stderr: output.stderr,
            },
        }),
    }
}

fn resolve_key(key: &KeyRef) -> Result<Secret, PoolCreationError> {
    match key {
        KeyRef::Passphrase(secret) => Ok(secret.clone()),
        KeyRef::KeyFile(path) => std::fs::read_to_string(path)
            .map(|content| Secret::new(content.trim_end_matches(['\r', '\n'])))
            .map_err(|source| PoolCreationError::KeyFile {
                path: path.clone(),
                source,
            }),
    }
}

/// Create the pool described by `spec`.
///
/// DESTRUCTIVE. Members carrying a `zfs_member` signature are refused unless
/// `spec.force` is set. The passphrase travels over stdin.
pub fn create_pool(
    runner: &dyn CommandRunner,
    spec: &PoolSpec,
    key: Option<&KeyRef>,
    timeout: Duration,
) -> Result<Pool, PoolCreationError> {
    if spec.members.is_empty() {
        return Err(PoolCreationError::NoMembers);
    }

    for member in &spec.members {
        if has_pool_signature(runner, member, timeout)? {
            if spec.force {
                tracing::warn!(
                    "{} carries an existing pool label; overwriting (force)",
                    member.display()
                );
            } else {
                return Err(PoolCreationError::ExistingPoolSignature {
                    member: member.clone(),
                });
            }
        }
    }

    let mut invocation = Invocation::new("zpool")
        .args(spec.create_args())
        .timeout(timeout);
    if spec.encrypted {
        let secret = match key {
            Some(key) => resolve_key(key)?,
            None => Secret::default(),
        };
        invocation = invocation.stdin_secret(format!("{}\n", secret.expose()));
    }

    tracing::info!(
        "Creating pool {} ({}) over {} member(s)",
        spec.name,
        spec.topology,
        spec.members.len()
    );
    runner.run(&invocation)?;

    Ok(Pool {
        name: spec.name.clone(),
        altroot: spec.altroot.clone(),
        topology: spec.topology,
        members: spec.members.clone(),
        encrypted: spec.encrypted,
    })
}

// ============================================================================
// Datasets
// ============================================================================

/// Every parent must be the pool root or appear earlier; no duplicates.
pub fn check_dataset_order(datasets: &[DatasetSpec]) -> Result<(), DatasetError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for dataset in datasets {
        if let Some(parent) = dataset.parent() {
            if !seen.contains(parent) {
                return Err(DatasetError::MissingParent {
                    dataset: dataset.name.clone(),
                    parent: parent.to_string(),
                });
            }
        }
        if !seen.insert(dataset.name.as_str()) {
            return Err(DatasetError::Duplicate(dataset.name.clone()));
        }
    }
    Ok(())
}

fn dataset_create_args(pool: &Pool, dataset: &DatasetSpec) -> Vec<String> {
    // -u: mounting happens later, in order, through mount_all
    let mut args = vec!["create".to_string(), "-u".to_string()];
    if dataset.canmount != CanMount::On {
        args.push("-o".to_string());
        args.push(format!("canmount={}", dataset.canmount));
    }
    if let Some(mountpoint) = &dataset.mountpoint {
        args.push("-o".to_string());
        args.push(format!("mountpoint={}", mountpoint));
    }
    for (key, value) in &dataset.properties {
        args.push("-o".to_string());
        args.push(format!("{}={}", key, value));
    }
    if pool.encrypted && dataset.encryption_opt_out {
        args.push("-o".to_string());
        args.push("encryption=off".to_string());
    }
    args.push(pool.dataset(&dataset.name));
    args
}

/// Create `datasets` in list order.
///
/// The list is checked up front so nothing is created from a list that
/// would fail halfway on ordering.
pub fn create_dataset_tree(
    runner: &dyn CommandRunner,
    pool: &Pool,
    datasets: &[DatasetSpec],
    timeout: Duration,
) -> Result<(), DatasetError> {
    check_dataset_order(datasets)?;

    for dataset in datasets {
        let full = pool.dataset(&dataset.name);
        tracing::info!("Creating dataset {}", full);
        runner
            .run(
                &Invocation::new("zfs")
                    .args(dataset_create_args(pool, dataset))
                    .timeout(timeout),
            )
            .map_err(|source| DatasetError::Command {
                dataset: full,
                source,
            })?;
    }
    Ok(())
}

/// Create the swap zvol and format it.
pub fn create_swap_volume(
    runner: &dyn CommandRunner,
    pool: &Pool,
    size_gib: u32,
    timeout: Duration,
) -> Result<PathBuf, DatasetError> {
    let full = pool.dataset(SWAP_VOLUME);
    let fail = |source: CommandFailure| DatasetError::Command {
        dataset: full.clone(),
        source,
    };

    runner
        .run(
            &Invocation::new("zfs")
                .args(["create", "-V"])
                .arg(format!("{}G", size_gib))
                .args(["-b", SWAP_BLOCK_SIZE])
                .args([
                    "-o",
                    "compression=zle",
                    "-o",
                    "logbias=throughput",
                    "-o",
                    "sync=always",
                    "-o",
                    "primarycache=metadata",
                    "-o",
                    "secondarycache=none",
                    "-o",
                    "com.sun:auto-snapshot=false",
                ])
                .arg(full.as_str())
                .timeout(timeout),
        )
        .map_err(fail)?;

    let device = pool.swap_device();
    runner
        .run(
            &Invocation::new("mkswap")
                .arg("-f")
                .arg(device.display().to_string())
                .timeout(timeout),
        )
        .map_err(fail)?;

    tracing::info!("Created {} GiB swap volume {}", size_gib, full);
    Ok(device)
}

/// Point the pool's `bootfs` at the root dataset.
pub fn set_bootfs(
    runner: &dyn CommandRunner,
    pool: &Pool,
    root_dataset: &str,
    timeout: Duration,
) -> Result<(), DatasetError> {
    let full = pool.dataset(root_dataset);
    runner
        .run(
            &Invocation::new("zpool")
                .arg("set")
                .arg(format!("bootfs={}", full))
                .arg(pool.name.as_str())
                .timeout(timeout),
        )
        .map(drop)
        .map_err(|source| DatasetError::Command {
            dataset: full,
            source,
        })
}

// ============================================================================
// Mounting
// ============================================================================

/// A dataset mounted under the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedDataset {
    /// Full name, `<pool>/<dataset>`
    pub dataset: String,
    /// Mount point inside the installed system
    pub mountpoint: PathBuf,
}

/// Mount point each dataset resolves to, `None` when it has none.
///
/// Unset mountpoints inherit `<parent mountpoint>/<leaf>`; the pool root
/// itself has `mountpoint=none`.
pub fn effective_mountpoints(datasets: &[DatasetSpec]) -> HashMap<&str, Option<PathBuf>> {
    let mut resolved: HashMap<&str, Option<PathBuf>> = HashMap::new();
    for dataset in datasets {
        let mountpoint = match dataset.mountpoint.as_deref() {
            Some("none") => None,
            Some(path) => Some(PathBuf::from(path)),
            None => dataset
                .parent()
                .and_then(|parent| resolved.get(parent).cloned().flatten())
                .map(|parent| parent.join(dataset.leaf())),
        };
        resolved.insert(dataset.name.as_str(), mountpoint);
    }
    resolved
}

/// Mount every mountable dataset in list order, parent before child.
///
/// The list is never reordered. A dataset whose mountable parent (in the
/// dataset tree or in the directory tree) is not mounted yet fails with
/// [`MountError::ParentNotMounted`]. The directory holding a mount point
/// must already exist; only the final component is created.
pub fn mount_all(
    runner: &dyn CommandRunner,
    pool: &Pool,
    datasets: &[DatasetSpec],
    timeout: Duration,
) -> Result<Vec<MountedDataset>, MountError> {
    let target = pool.altroot.as_path();
    if !target.is_dir() {
        return Err(MountError::MissingTarget(target.to_path_buf()));
    }

    let mountpoints = effective_mountpoints(datasets);
    let mountable: HashMap<&str, &PathBuf> = datasets
        .iter()
        .filter(|d| d.canmount != CanMount::Off)
        .filter_map(|d| {
            mountpoints
                .get(d.name.as_str())
                .and_then(Option::as_ref)
                .map(|mp| (d.name.as_str(), mp))
        })
        .collect();

    let mut mounted_names: HashSet<&str> = HashSet::new();
    let mut mounted = Vec::new();

    for dataset in datasets {
        let name = dataset.name.as_str();
        let Some(mountpoint) = mountable.get(name).copied() else {
            tracing::debug!("Skipping {} (not mountable)", pool.dataset(name));
            continue;
        };

        // Nearest mountable ancestor in the dataset tree
        let mut ancestor = dataset.parent();
        while let Some(parent) = ancestor {
            if mountable.contains_key(parent) {
                if !mounted_names.contains(parent) {
                    return Err(MountError::ParentNotMounted {
                        dataset: pool.dataset(name),
                        parent: pool.dataset(parent),
                    });
                }
                break;
            }
            ancestor = parent.rsplit_once('/').map(|(p, _)| p);
        }

        // Any dataset whose mount point contains this one
        if let Some((other, _)) = mountable.iter().find(|(other, other_mp)| {
            **other != name
                && mountpoint != **other_mp
                && mountpoint.starts_with(other_mp)
                && !mounted_names.contains(**other)
        }) {
            return Err(MountError::ParentNotMounted {
                dataset: pool.dataset(name),
                parent: pool.dataset(other),
            });
        }

        let dir = join_under(target, mountpoint);
        if dir != target {
            let parent_dir = dir.parent().unwrap_or(target);
            if !parent_dir.is_dir() {
                return Err(MountError::MissingParentMountpoint {
                    dataset: pool.dataset(name),
                    path: parent_dir.to_path_buf(),
                });
            }
            if !dir.is_dir() {
                std::fs::create_dir(&dir).map_err(|source| MountError::Io {
                    path: dir.clone(),
                    source,
                })?;
            }
        }

        let full = pool.dataset(name);
        runner
            .run(
                &Invocation::new("mount")
                    .args(["-t", "zfs", "-o", "zfsutil"])
                    .arg(full.as_str())
                    .arg(dir.display().to_string())
                    .timeout(timeout),
            )
            .map_err(|source| MountError::Command {
                what: full.clone(),
                source,
            })?;
        tracing::info!("Mounted {} at {}", full, dir.display());

        mounted_names.insert(name);
        mounted.push(MountedDataset {
            dataset: full,
            mountpoint: mountpoint.clone(),
        });
    }

    Ok(mounted)
}

// ============================================================================
// Teardown
// ============================================================================

/// What [`teardown`] undid after a successful installation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Boot partition mount points released, as host paths
    pub unmounted: Vec<PathBuf>,
    pub exported: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Unmount the boot partitions (innermost first) and export the pool.
///
/// Never fails: every problem becomes a warning and the operator finishes
/// by hand. Exporting unmounts the datasets and leaves the pool importable
/// by the installed system.
pub fn teardown(
    runner: &dyn CommandRunner,
    pool: &Pool,
    boot_mounts: &[BootMount],
    timeout: Duration,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    for mount in boot_mounts.iter().rev() {
        let dir = join_under(&pool.altroot, &mount.mountpoint);
        match runner.run(
            &Invocation::new("umount")
                .arg(dir.display().to_string())
                .timeout(timeout),
        ) {
            Ok(_) => {
                tracing::info!("Unmounted {}", dir.display());
                report.unmounted.push(dir);
            }
            Err(err) => {
                tracing::warn!("Could not unmount {}: {}", dir.display(), err);
                report
                    .warnings
                    .push(format!("could not unmount {}: {}", dir.display(), err));
            }
        }
    }

    match runner.run(
        &Invocation::new("zpool")
            .args(["export", pool.name.as_str()])
            .timeout(timeout),
    ) {
        Ok(_) => {
            tracing::info!("Exported pool {}", pool.name);
            report.exported = true;
        }
        Err(err) => {
            tracing::warn!("Could not export {}: {}", pool.name, err);
            report
                .warnings
                .push(format!("could not export {}: {}", pool.name, err));
        }
    }

    report
}
