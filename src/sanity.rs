//! Pre-flight sanity checks for runtime environment
//!
//! Verifies, before any plan is executed:
//! - Required runtime binaries are present
//! - Running with root privileges (EUID 0)

use std::fmt;

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

impl fmt::Display for SanityCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_root {
            writeln!(f, "root privileges required (run with sudo or as root)")?;
        }
        if !self.missing_binaries.is_empty() {
            let packages: Vec<&str> = self
                .missing_binaries
                .iter()
                .map(|b| package_for_binary(b))
                .collect();
            writeln!(
                f,
                "missing required binaries: {} (install: pacman -S {})",
                self.missing_binaries.join(", "),
                packages.join(" ")
            )?;
        }
        Ok(())
    }
}

/// Required runtime binaries for installation
pub const REQUIRED_BINARIES: &[&str] = &[
    "lsblk",
    "blkid",
    "sgdisk",
    "partprobe",
    "udevadm",
    "mkfs.fat",
    "mkfs.ext4",
    "mount",
    "umount",
    "zpool",
    "zfs",
    "mkswap",
    "hostid",
    "zgenhostid",
    "pacstrap",
    "arch-chroot",
    "efibootmgr",
];

/// Needed only when the plan enables mirror ranking
pub const MIRROR_BINARIES: &[&str] = &["reflector"];

/// Binaries needed by `discover` alone
pub const DISCOVERY_BINARIES: &[&str] = &["lsblk"];

fn binary_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Check `binaries` and root privileges.
pub fn verify_environment(binaries: &[&str]) -> SanityCheckResult {
    let missing = binaries
        .iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| (*binary).to_string())
        .collect();

    SanityCheckResult {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to their Arch Linux package names
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "sgdisk" => "gptfdisk",
        "partprobe" => "parted",
        "mkfs.fat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "udevadm" => "systemd",
        "zpool" | "zfs" | "zgenhostid" => "zfs-utils",
        "pacstrap" | "arch-chroot" => "arch-install-scripts",
        "efibootmgr" => "efibootmgr",
        "hostid" | "cp" => "coreutils",
        "reflector" => "reflector",
        _ => "util-linux",
    }
}

/// Skip root check (for development/testing)
/// Set ARCHZFS_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var("ARCHZFS_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run pre-flight checks, returning the failed result when they do not pass.
pub fn run_preflight_checks(binaries: &[&str]) -> Result<(), SanityCheckResult> {
    tracing::debug!("Running pre-flight sanity checks...");

    let mut result = verify_environment(binaries);
    if should_skip_root_check() {
        tracing::warn!("Root check skipped (ARCHZFS_SKIP_ROOT_CHECK=1)");
        result.is_root = true;
    }

    if result.is_ok() {
        tracing::info!("Pre-flight checks passed");
        Ok(())
    } else {
        Err(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists_sh() {
        assert!(binary_exists("sh"), "sh should be available");
    }

    #[test]
    fn test_binary_exists_nonexistent() {
        assert!(!binary_exists("this_binary_definitely_does_not_exist_12345"));
    }

    #[test]
    fn test_verify_environment_reports_missing() {
        let result = verify_environment(&["sh", "this_binary_definitely_does_not_exist_12345"]);
        assert_eq!(
            result.missing_binaries,
            vec!["this_binary_definitely_does_not_exist_12345".to_string()]
        );
    }

    #[test]
    fn test_package_mapping() {
        assert_eq!(package_for_binary("sgdisk"), "gptfdisk");
        assert_eq!(package_for_binary("zpool"), "zfs-utils");
        assert_eq!(package_for_binary("pacstrap"), "arch-install-scripts");
        assert_eq!(package_for_binary("reflector"), "reflector");
        assert_eq!(package_for_binary("umount"), "util-linux");
    }

    #[test]
    fn test_sanity_result_is_ok() {
        let ok_result = SanityCheckResult {
            missing_binaries: vec![],
            is_root: true,
        };
        assert!(ok_result.is_ok());

        let missing_binary = SanityCheckResult {
            missing_binaries: vec!["zpool".to_string()],
            is_root: true,
        };
        assert!(!missing_binary.is_ok());
        assert!(missing_binary.to_string().contains("pacman -S zfs-utils"));

        let not_root = SanityCheckResult {
            missing_binaries: vec![],
            is_root: false,
        };
        assert!(!not_root.is_ok());
    }
}
