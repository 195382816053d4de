//! PCI device discovery inside IOMMU groups.
//!
//! The host is re-scanned on every call; device presence can change between
//! runs and nothing here is worth caching.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::host;

pub const IOMMU_GROUPS_DIR: &str = "/sys/kernel/iommu_groups";

/// Matches one `lspci -nns` line, e.g.
/// `01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP104 [GeForce GTX 1080] [10de:1b80] (rev a1)`
fn record_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-f]{2}:[0-9a-f]{2}\.[0-9a-f])[^:]*:\s*(.*)\[([0-9a-f]{4}):([0-9a-f]{4})\].*$")
            .expect("device record pattern is valid")
    })
}

/// One line of the host bus listing. Ephemeral; produced per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceRecord {
    /// `BB:DD.F` bus address as printed by lspci (no domain).
    pub address: String,
    /// The full listing line, used both for display and vendor matching.
    pub description: String,
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciDeviceRecord {
    pub fn parse(line: &str) -> Option<PciDeviceRecord> {
        let caps = record_regex().captures(line.trim())?;
        Some(PciDeviceRecord {
            address: caps[1].to_string(),
            description: line.trim().to_string(),
            vendor_id: u16::from_str_radix(&caps[3], 16).ok()?,
            device_id: u16::from_str_radix(&caps[4], 16).ok()?,
        })
    }

    /// The `BB:DD` prefix identifying the physical slot regardless of
    /// function number.
    pub fn bus_slot(&self) -> &str {
        match self.address.rfind('.') {
            Some(i) => &self.address[..i],
            None => &self.address,
        }
    }

    /// Full address including the (always-zero) PCI domain, the form the
    /// hypervisor expects for passthrough.
    pub fn full_address(&self) -> String {
        format!("0000:{}", self.address)
    }

    pub fn is_vga_controller(&self) -> bool {
        self.description.to_lowercase().contains("vga compatible controller")
    }

    pub fn is_audio_device(&self) -> bool {
        self.description.to_lowercase().contains("audio device")
    }
}

/// Enumerate every device in every IOMMU group and resolve each address to
/// its bus listing line.
///
/// A missing group directory means the kernel booted without IOMMU support
/// enabled; that is a fatal precondition, not something to retry.
pub fn list_iommu_devices() -> Result<Vec<PciDeviceRecord>> {
    list_iommu_devices_at(Path::new(IOMMU_GROUPS_DIR))
}

fn list_iommu_devices_at(groups_dir: &Path) -> Result<Vec<PciDeviceRecord>> {
    if !groups_dir.is_dir() {
        return Err(Error::precondition(format!(
            "The directory '{}' was not found. Is IOMMU enabled in your firmware and kernel?",
            groups_dir.display()
        )));
    }

    let mut records = Vec::new();
    for group in fs::read_dir(groups_dir)? {
        let devices_dir = group?.path().join("devices");
        if !devices_dir.is_dir() {
            continue;
        }
        for device in fs::read_dir(&devices_dir)? {
            let address = device?.file_name();
            for line in host::stream("lspci", &[OsStr::new("-nns"), address.as_os_str()])? {
                if let Some(record) = PciDeviceRecord::parse(&line?) {
                    records.push(record);
                }
            }
        }
    }
    Ok(records)
}

/// Kernel ring buffer lines about DMAR/IOMMU, for diagnostics.
pub fn iommu_kernel_messages() -> Result<Vec<String>> {
    host::stream_shell("sudo dmesg | grep -i -e DMAR -e IOMMU")?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GTX1080_VIDEO: &str =
        "01:00.0 VGA compatible controller [0300]: NVIDIA Corporation GP104 [GeForce GTX 1080] [10de:1b80] (rev a1)";
    const GTX1080_AUDIO: &str =
        "01:00.1 Audio device [0403]: NVIDIA Corporation GP104 High Definition Audio Controller [10de:10f0] (rev a1)";

    #[test]
    fn parses_a_video_controller_line() {
        let rec = PciDeviceRecord::parse(GTX1080_VIDEO).unwrap();
        assert_eq!(rec.address, "01:00.0");
        assert_eq!(rec.bus_slot(), "01:00");
        assert_eq!(rec.full_address(), "0000:01:00.0");
        assert_eq!(rec.vendor_id, 0x10de);
        assert_eq!(rec.device_id, 0x1b80);
        assert!(rec.is_vga_controller());
        assert!(!rec.is_audio_device());
    }

    #[test]
    fn parses_an_audio_function_line() {
        let rec = PciDeviceRecord::parse(GTX1080_AUDIO).unwrap();
        assert_eq!(rec.address, "01:00.1");
        assert_eq!(rec.bus_slot(), "01:00");
        assert_eq!(rec.device_id, 0x10f0);
        assert!(rec.is_audio_device());
    }

    #[test]
    fn id_pair_comes_from_the_last_bracket_group() {
        // the class code bracket ("[0300]") must not be mistaken for the id pair
        let rec = PciDeviceRecord::parse(GTX1080_VIDEO).unwrap();
        assert_eq!((rec.vendor_id, rec.device_id), (0x10de, 0x1b80));
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(PciDeviceRecord::parse("").is_none());
        assert!(PciDeviceRecord::parse("not a pci line").is_none());
        assert!(PciDeviceRecord::parse("01:00.0 no id pair here").is_none());
    }

    #[test]
    fn missing_group_directory_is_a_precondition_failure() {
        let err = list_iommu_devices_at(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
