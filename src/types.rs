//! Type-safe configuration types for the installer
//!
//! Plan values that are chosen from a fixed menu are Rust enums rather than
//! strings, so a typo in a plan file fails at parse time instead of halfway
//! through an installation.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// ZFS pool redundancy layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Topology {
    /// One member, no redundancy
    #[default]
    Single,
    /// Every member holds a full copy
    Mirror,
    /// Single parity
    Raidz1,
    /// Double parity
    Raidz2,
}

impl Topology {
    /// Minimum number of member devices this layout accepts.
    pub const fn min_devices(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Mirror | Self::Raidz1 => 2,
            Self::Raidz2 => 3,
        }
    }

    /// The vdev keyword passed to `zpool create`, if any.
    pub const fn vdev_keyword(self) -> Option<&'static str> {
        match self {
            Self::Single => None,
            Self::Mirror => Some("mirror"),
            Self::Raidz1 => Some("raidz1"),
            Self::Raidz2 => Some("raidz2"),
        }
    }
}

/// Bootloader selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Bootloader {
    #[default]
    Grub,
    SystemdBoot,
}

impl Bootloader {
    /// Label the firmware boot manager shows for this bootloader.
    pub const fn efi_label(self) -> &'static str {
        match self {
            Self::Grub => "GRUB",
            Self::SystemdBoot => "Linux Boot Manager",
        }
    }

    /// Mount point of the EFI system partition inside the target.
    pub const fn esp_mountpoint(self) -> &'static str {
        match self {
            Self::Grub => "/boot/efi",
            // systemd-boot can only load kernels that live on the ESP
            Self::SystemdBoot => "/boot",
        }
    }

    /// Packages the bootloader needs inside the target.
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            Self::Grub => &["grub", "efibootmgr", "dosfstools"],
            Self::SystemdBoot => &["efibootmgr", "dosfstools"],
        }
    }
}

/// Kernel package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Kernel {
    Linux,
    #[default]
    LinuxLts,
    LinuxZen,
}

impl Kernel {
    /// Package name, which is also the suffix of `/boot/vmlinuz-*`.
    pub fn package(self) -> String {
        self.to_string()
    }
}

/// Dataset compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    #[default]
    Lz4,
    Zstd,
    Off,
}

/// Network management inside the installed system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NetworkBackend {
    #[default]
    #[strum(serialize = "networkmanager")]
    #[serde(rename = "networkmanager")]
    NetworkManager,
    SystemdNetworkd,
    None,
}

impl NetworkBackend {
    /// Packages to bootstrap for this backend.
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            Self::NetworkManager => &["networkmanager"],
            Self::SystemdNetworkd | Self::None => &[],
        }
    }

    /// Units to enable for this backend.
    pub fn services(self) -> &'static [&'static str] {
        match self {
            Self::NetworkManager => &["NetworkManager"],
            Self::SystemdNetworkd => &["systemd-networkd", "systemd-resolved"],
            Self::None => &[],
        }
    }
}

/// Role of a partition in the standard layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PartitionPurpose {
    Efi,
    Boot,
    ZfsMember,
}

impl PartitionPurpose {
    /// sgdisk type code.
    pub const fn typecode(self) -> &'static str {
        match self {
            Self::Efi => "ef00",
            Self::Boot => "8300",
            Self::ZfsMember => "bf00",
        }
    }

    /// GPT partition name.
    pub const fn gpt_name(self) -> &'static str {
        match self {
            Self::Efi => "EFI",
            Self::Boot => "BOOT",
            Self::ZfsMember => "ZFS",
        }
    }
}

/// Filesystem placed on a partition by the partitioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionFs {
    Vfat,
    Ext4,
    /// Left raw for `zpool create`
    Zfs,
}
