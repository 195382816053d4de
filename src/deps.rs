//! Host dependency checks and package installation.

use std::path::Path;

use log::info;

use crate::devices::IOMMU_GROUPS_DIR;
use crate::error::{Error, Result};
use crate::host;
use crate::machine::BIOS_PATH;

/// (tool, do-nothing probe argument) pairs the launcher shells out to.
const TOOL_CHECKLIST: [(&str, &str); 3] = [
    ("qemu-system-x86_64", "-version"),
    ("ip", "-V"),
    ("iptables", "--version"),
];

const PATH_CHECKLIST: [&str; 2] = [IOMMU_GROUPS_DIR, BIOS_PATH];

/// Verify every required tool and path at once; the error lists everything
/// that is missing so one run surfaces all the gaps.
pub fn check_all() -> Result<()> {
    let mut missing = Vec::new();
    for (tool, probe) in TOOL_CHECKLIST {
        if !host::tool_exists(tool, probe) {
            missing.push(format!("The tool {} is not present in your system", tool));
        }
    }
    for path in PATH_CHECKLIST {
        if !Path::new(path).exists() {
            missing.push(format!("'{}' was not found in your filesystem", path));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::precondition(missing.join("; ")))
    }
}

/// The two package managers the launcher knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pacman,
    AptGet,
}

impl PackageManager {
    pub fn detect() -> Option<PackageManager> {
        if host::tool_exists("pacman", "--version") {
            Some(PackageManager::Pacman)
        } else if host::tool_exists("apt-get", "--version") {
            Some(PackageManager::AptGet)
        } else {
            None
        }
    }

    pub fn install_swtpm(&self) -> Result<()> {
        info!("installing swtpm via {:?}", self);
        match self {
            PackageManager::Pacman => {
                host::run_as_super("pacman", &["-Syy"])?;
                host::run_as_super("pacman", &["-S", "--noconfirm", "swtpm"])
            }
            PackageManager::AptGet => {
                host::run_as_super("apt-get", &["update"])?;
                host::run_as_super("apt-get", &["install", "-y", "swtpm-tools"])
            }
        }
    }
}
