//! Hardware environment detection
//!
//! Detects firmware mode (UEFI vs BIOS), installed memory and network
//! connectivity using std primitives only. None of these checks touch disks.
//!
//! # Design
//!
//! - Ambiguous detection logs a warning and falls back to the safe value
//!   (BIOS, 0 bytes of memory, offline)
//! - Network check uses `TcpStream::connect_timeout`, not ping
//! - The sysfs/procfs roots are parameters so tests can point them at a
//!   temporary directory

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

/// Where the kernel exposes EFI runtime services.
pub const EFI_SYSFS: &str = "/sys/firmware/efi";

/// Detected firmware mode of the system.
///
/// If `/sys/firmware/efi` exists the system booted in UEFI mode, otherwise
/// in legacy BIOS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareMode {
    /// UEFI firmware, can boot an EFI system partition
    Uefi,
    /// Legacy BIOS firmware
    Bios,
}

impl FirmwareMode {
    /// Returns true if the system booted in UEFI mode.
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// TCP connection to archlinux.org:443 succeeded
    Online,
    /// TCP connection failed or timed out
    Offline,
}

impl NetworkState {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Aggregated hardware detection results.
#[derive(Debug, Clone)]
pub struct HardwareInfo {
    pub firmware: FirmwareMode,
    /// Installed memory in bytes (0 if unknown)
    pub memory_bytes: u64,
    pub network: NetworkState,
}

impl HardwareInfo {
    /// Detect the live environment. Never fails; see module docs for
    /// fallbacks.
    pub fn detect() -> Self {
        let firmware = detect_firmware_mode(Path::new(EFI_SYSFS));
        let memory_bytes = detect_memory(Path::new("/proc/meminfo"));
        let network = detect_internet();

        tracing::info!(
            "Hardware detection: firmware={}, memory={} MiB, network={}",
            firmware,
            memory_bytes / (1024 * 1024),
            network
        );

        Self {
            firmware,
            memory_bytes,
            network,
        }
    }
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Firmware: {}, Memory: {} MiB, Network: {}",
            self.firmware,
            self.memory_bytes / (1024 * 1024),
            self.network
        )
    }
}

// ============================================================================
// Detection Functions
// ============================================================================

/// Detect firmware mode by checking for the EFI sysfs directory.
pub fn detect_firmware_mode(efi_path: &Path) -> FirmwareMode {
    if efi_path.exists() {
        if !efi_path.join("efivars").exists() {
            tracing::warn!(
                "{} exists but efivars not found; EFI variables may not be writable",
                efi_path.display()
            );
        }
        tracing::debug!("UEFI firmware detected ({} exists)", efi_path.display());
        FirmwareMode::Uefi
    } else {
        tracing::debug!("BIOS firmware detected ({} not found)", efi_path.display());
        FirmwareMode::Bios
    }
}

/// Installed memory from a `/proc/meminfo`-formatted file.
pub fn detect_memory(meminfo: &Path) -> u64 {
    match std::fs::read_to_string(meminfo) {
        Ok(content) => parse_meminfo_total(&content).unwrap_or_else(|| {
            tracing::warn!("MemTotal missing from {}", meminfo.display());
            0
        }),
        Err(e) => {
            tracing::warn!("Cannot read {}: {}", meminfo.display(), e);
            0
        }
    }
}

fn parse_meminfo_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

/// Detect network connectivity via TCP connection to archlinux.org.
pub fn detect_internet() -> NetworkState {
    // archlinux.org HTTPS
    let addr: SocketAddr = match "95.217.163.246:443".parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!("Failed to parse socket address: {}", e);
            return NetworkState::Offline;
        }
    };

    match TcpStream::connect_timeout(&addr, Duration::from_secs(5)) {
        Ok(_stream) => NetworkState::Online,
        Err(e) => {
            tracing::warn!("Network connectivity check failed: {}", e);
            NetworkState::Offline
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_firmware_mode_display() {
        assert_eq!(FirmwareMode::Uefi.to_string(), "UEFI");
        assert_eq!(FirmwareMode::Bios.to_string(), "BIOS");
    }

    #[test]
    fn test_detect_firmware_mode_from_directory() {
        let dir = TempDir::new().expect("tempdir");
        let efi = dir.path().join("efi");
        assert_eq!(detect_firmware_mode(&efi), FirmwareMode::Bios);

        std::fs::create_dir_all(efi.join("efivars")).expect("mkdir");
        assert_eq!(detect_firmware_mode(&efi), FirmwareMode::Uefi);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:        8056528 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total(content), Some(8_056_528 * 1024));
        assert_eq!(parse_meminfo_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_detect_memory_missing_file() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(detect_memory(&dir.path().join("meminfo")), 0);
    }

    #[test]
    fn test_hardware_info_display() {
        let info = HardwareInfo {
            firmware: FirmwareMode::Uefi,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            network: NetworkState::Online,
        };
        assert_eq!(
            info.to_string(),
            "Firmware: UEFI, Memory: 4096 MiB, Network: Online"
        );
    }
}
