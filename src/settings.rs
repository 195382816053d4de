//! YAML-backed per-user settings.
//!
//! One `settings.yaml` under the vmtrainer configuration directory, re-read
//! by every invocation. Directories for machine configs, disks and the TPM
//! state are created on demand below the same root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SETTINGS_FILE: &str = "settings.yaml";

fn default_network_ip() -> String {
    "192.168.66.1/24".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "network-ip", default = "default_network_ip")]
    network_ip: String,

    #[serde(rename = "network-interface", default, skip_serializing_if = "Option::is_none")]
    network_interface: Option<String>,

    #[serde(rename = "disk-directory", default, skip_serializing_if = "Option::is_none")]
    disk_directory: Option<PathBuf>,

    #[serde(rename = "qemu-bin-path", default, skip_serializing_if = "Option::is_none")]
    qemu_binary: Option<PathBuf>,

    #[serde(skip)]
    root: PathBuf,
}

impl Settings {
    /// Load the settings from the per-user configuration directory,
    /// falling back to defaults when no file exists yet.
    pub fn open() -> Result<Settings> {
        let dirs = xdg::BaseDirectories::with_prefix("vmtrainer")
            .map_err(|e| Error::precondition(format!("Cannot locate the configuration directory: {}", e)))?;
        Settings::open_at(dirs.get_config_home())
    }

    /// Load from an explicit root directory. Tests use this to stay inside
    /// a temporary directory.
    pub fn open_at(root: impl Into<PathBuf>) -> Result<Settings> {
        let root = root.into();
        let path = root.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            serde_yaml::from_str(&fs::read_to_string(&path)?)?
        } else {
            Settings {
                network_ip: default_network_ip(),
                network_interface: None,
                disk_directory: None,
                qemu_binary: None,
                root: PathBuf::new(),
            }
        };
        settings.root = root;
        Ok(settings)
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(SETTINGS_FILE), serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn network_ip(&self) -> &str {
        &self.network_ip
    }

    /// Store the bridge address; a bare address gets a /24 prefix appended.
    pub fn set_network_ip(&mut self, ip: &str) {
        if ip.contains('/') {
            self.network_ip = ip.to_string();
        } else {
            self.network_ip = format!("{}/24", ip);
        }
    }

    pub fn network_interface(&self) -> Option<&str> {
        self.network_interface.as_deref()
    }

    pub fn set_network_interface(&mut self, name: &str) {
        self.network_interface = Some(name.to_string());
    }

    pub fn qemu_binary(&self) -> PathBuf {
        self.qemu_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("qemu-system-x86_64"))
    }

    pub fn set_disk_directory(&mut self, path: &Path) {
        self.disk_directory = Some(path.to_path_buf());
    }

    pub fn machines_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("machines");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Where new machine disks are placed; defaults to the machines dir.
    pub fn disk_directory(&self) -> Result<PathBuf> {
        match &self.disk_directory {
            Some(dir) => Ok(dir.clone()),
            None => self.machines_dir(),
        }
    }

    pub fn tpm_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("tpm");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn tpm_socket_path(&self) -> Result<PathBuf> {
        Ok(self.tpm_dir()?.join("swtpm-sock.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_no_file_exists() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::open_at(tmp.path()).unwrap();
        assert_eq!(settings.network_ip(), "192.168.66.1/24");
        assert!(settings.network_interface().is_none());
        assert_eq!(settings.qemu_binary(), PathBuf::from("qemu-system-x86_64"));
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::open_at(tmp.path()).unwrap();
        settings.set_network_interface("enp6s0");
        settings.set_network_ip("10.0.5.1");
        settings.set_disk_directory(Path::new("/var/lib/vm-disks"));
        settings.save().unwrap();

        let reloaded = Settings::open_at(tmp.path()).unwrap();
        assert_eq!(reloaded.network_interface(), Some("enp6s0"));
        assert_eq!(reloaded.network_ip(), "10.0.5.1/24");
        assert_eq!(reloaded.disk_directory().unwrap(), PathBuf::from("/var/lib/vm-disks"));
    }

    #[test]
    fn network_ip_keeps_explicit_prefix() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::open_at(tmp.path()).unwrap();
        settings.set_network_ip("192.168.7.1/16");
        assert_eq!(settings.network_ip(), "192.168.7.1/16");
    }

    #[test]
    fn machine_and_tpm_dirs_are_created_below_root() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::open_at(tmp.path()).unwrap();
        let machines = settings.machines_dir().unwrap();
        assert!(machines.is_dir());
        assert!(machines.starts_with(tmp.path()));
        assert!(settings.tpm_socket_path().unwrap().starts_with(tmp.path()));
    }
}
