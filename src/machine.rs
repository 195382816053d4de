//! Declarative per-machine configuration: persistence, validation, the
//! interactive hardware selection flows, and the launch entry point.
//!
//! One YAML file per machine under the settings `machines/` directory, keyed
//! by a fixed top-level `machine:` field. The file name stem is the primary
//! key. A machine is created exactly once; afterwards dedicated setters
//! mutate individual fields and `save` overwrites the file.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ask;
use crate::error::{Error, Result};
use crate::gpu::{self, GpuDescriptor};
use crate::host;
use crate::input;
use crate::network;
use crate::qemu::{self, HostContext};
use crate::settings::Settings;

pub const BIOS_PATH: &str = "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd";
pub const SCREAM_SHMEM_PATH: &str = "/dev/shm/scream-ivshmem";

/// Bumped whenever the on-disk layout changes; files from before the field
/// existed deserialize as 0 and are migrated on load.
pub const SCHEMA_VERSION: u32 = 1;

const MIN_MEMORY_MIB: u64 = 256;
const MIN_DISK_MIB: u64 = 5000;

#[derive(Debug, Serialize, Deserialize)]
struct MachineFile {
    machine: MachineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub address: String,
}

/// A GPU assignment as persisted: the passthrough address of the video
/// function and, when the card has one, its audio function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAssignment {
    pub video: DeviceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<DeviceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub schema: u32,

    pub name: String,

    /// Stable guest identity, generated at creation and never regenerated.
    #[serde(default)]
    pub uuid: String,

    #[serde(rename = "mac-address", default)]
    pub mac_address: String,

    /// Core count for the guest; `-1` means "all host cores".
    pub cpus: i64,

    /// Guest memory in MiB. Floored to a multiple of 4 at plan-build time.
    pub memory: u64,

    /// Size for a managed qcow2 disk. Mutually exclusive with `disk_path`.
    #[serde(rename = "disk-size", default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u64>,

    /// Path to an existing disk image, for machines not managed here.
    #[serde(rename = "disk-path", default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<PathBuf>,

    #[serde(rename = "raw-disk1", default, skip_serializing_if = "Option::is_none")]
    pub raw_disk1: Option<PathBuf>,

    #[serde(rename = "raw-disk2", default, skip_serializing_if = "Option::is_none")]
    pub raw_disk2: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuAssignment>,

    #[serde(rename = "evdev-mouse", default, skip_serializing_if = "Option::is_none")]
    pub evdev_mouse: Option<PathBuf>,

    #[serde(rename = "evdev-keyboard", default, skip_serializing_if = "Option::is_none")]
    pub evdev_keyboard: Option<PathBuf>,

    #[serde(default)]
    pub tpm: bool,
}

/// Exactly one disk source is chosen at creation time.
pub enum DiskSource {
    Size(u64),
    Existing(PathBuf),
}

fn random_mac() -> String {
    // 52:54 is the conventional KVM OUI prefix
    let [a, b, c, d]: [u8; 4] = rand::random();
    format!("52:54:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

impl MachineConfig {
    /// Create and persist a new machine. All validation happens before
    /// anything is written.
    pub fn create(
        settings: &Settings,
        name: &str,
        cpus: i64,
        memory: u64,
        disk: DiskSource,
        tpm: bool,
    ) -> Result<MachineConfig> {
        if MachineConfig::exists(settings, name)? {
            return Err(Error::validation(format!("The VM {} already exists.", name)));
        }

        let mut machine = MachineConfig {
            schema: SCHEMA_VERSION,
            name: name.to_string(),
            uuid: Uuid::new_v4().to_string(),
            mac_address: random_mac(),
            cpus: 1,
            memory: MIN_MEMORY_MIB,
            disk_size: None,
            disk_path: None,
            raw_disk1: None,
            raw_disk2: None,
            gpus: Vec::new(),
            evdev_mouse: None,
            evdev_keyboard: None,
            tpm,
        };
        machine.set_cpus(cpus)?;
        machine.set_memory(memory)?;
        match disk {
            DiskSource::Size(size) => machine.set_disk_size(size)?,
            DiskSource::Existing(path) => machine.set_disk_path(&path)?,
        }
        machine.save(settings)?;
        Ok(machine)
    }

    pub fn exists(settings: &Settings, name: &str) -> Result<bool> {
        Ok(config_path(settings, name)?.exists())
    }

    pub fn load(settings: &Settings, name: &str) -> Result<MachineConfig> {
        let path = config_path(settings, name)?;
        if !path.exists() {
            return Err(Error::MachineNotFound(name.to_string()));
        }
        let file: MachineFile = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
        let mut machine = file.machine;
        // the file name stem is authoritative
        machine.name = name.to_string();
        if machine.schema < SCHEMA_VERSION {
            machine = migrate(machine);
            machine.save(settings)?;
        }
        Ok(machine)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let path = config_path(settings, &self.name)?;
        let file = MachineFile { machine: self.clone() };
        fs::write(path, serde_yaml::to_string(&file)?)?;
        Ok(())
    }

    pub fn list(settings: &Settings) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(settings.machines_dir()?)? {
            let name = entry?.file_name();
            if let Some(name) = name.to_str().and_then(|n| n.strip_suffix(".yaml")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn set_cpus(&mut self, cpus: i64) -> Result<()> {
        if cpus < -1 || cpus == 0 {
            return Err(Error::validation("Invalid cpu count"));
        }
        self.cpus = cpus;
        Ok(())
    }

    pub fn set_memory(&mut self, memory: u64) -> Result<()> {
        if memory < MIN_MEMORY_MIB {
            return Err(Error::validation(format!(
                "Memory too small. Expected {} or more",
                MIN_MEMORY_MIB
            )));
        }
        self.memory = memory;
        Ok(())
    }

    pub fn set_disk_size(&mut self, size: u64) -> Result<()> {
        if size < MIN_DISK_MIB {
            return Err(Error::validation(format!(
                "Disk too small. The value must be at least {}MB.",
                MIN_DISK_MIB
            )));
        }
        self.disk_size = Some(size);
        self.disk_path = None;
        Ok(())
    }

    pub fn set_disk_path(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::validation(format!("Disk not found: {}", path.display())));
        }
        self.disk_path = Some(path.to_path_buf());
        self.disk_size = None;
        Ok(())
    }

    /// Attach a raw block device; the fixed topology has two slots for these.
    pub fn add_raw_disk(&mut self, device: &Path) -> Result<()> {
        if !device.exists() {
            return Err(Error::validation(format!("Disk not found: {}", device.display())));
        }
        if self.raw_disk1.is_none() {
            self.raw_disk1 = Some(device.to_path_buf());
        } else if self.raw_disk2.is_none() {
            self.raw_disk2 = Some(device.to_path_buf());
        } else {
            return Err(Error::validation("Both raw disk slots are already assigned"));
        }
        Ok(())
    }

    pub fn assign_gpus(&mut self, gpus: Vec<GpuDescriptor>) {
        self.gpus = gpus
            .into_iter()
            .map(|gpu| GpuAssignment {
                video: DeviceRef { address: gpu.video_address },
                audio: gpu.audio_address.map(|address| DeviceRef { address }),
            })
            .collect();
    }

    /// Interactive GPU assignment from the live IOMMU scan.
    pub fn select_gpus(&mut self) -> Result<()> {
        let mut gpus = gpu::discover_gpus()?;
        if gpus.is_empty() {
            return Err(Error::precondition("There is no GPU available on this host"));
        }
        gpus.sort_by(|a, b| a.video_vendor.cmp(&b.video_vendor));

        println!("Choose one or more gpus; type the numbers separated by a comma:");
        for (index, gpu) in gpus.iter().enumerate() {
            println!("{} - {}", index, gpu);
        }
        let answer = ask::line("Type the gpu numbers to use (comma separated):")?;
        let selection = parse_gpu_selection(&answer, gpus.len())?;
        self.assign_gpus(selection.into_iter().map(|i| gpus[i].clone()).collect());
        Ok(())
    }

    pub fn select_mouse(&mut self) -> Result<()> {
        let mice = input::list_mice()?;
        if mice.is_empty() {
            return Err(Error::precondition("No mouse event devices were found"));
        }
        for (index, name) in mice.iter().enumerate() {
            println!("{} - {}", index, name);
        }
        let index = ask::index("Type the mouse number from the options above:", mice.len())?;
        self.evdev_mouse = Some(Path::new(input::INPUT_DEVICES_DIR).join(&mice[index]));
        Ok(())
    }

    pub fn select_keyboard(&mut self) -> Result<()> {
        let keyboards = input::list_keyboards()?;
        if keyboards.is_empty() {
            return Err(Error::precondition("No keyboard event devices were found"));
        }
        for (index, name) in keyboards.iter().enumerate() {
            println!("{} - {}", index, name);
        }
        let index = ask::index("Type the keyboard number from the options above:", keyboards.len())?;
        self.evdev_keyboard = Some(Path::new(input::INPUT_DEVICES_DIR).join(&keyboards[index]));
        Ok(())
    }

    /// The disk image path this machine boots from, creating parent
    /// directories for managed disks as needed.
    pub fn storage_path(&self, settings: &Settings) -> Result<PathBuf> {
        if let Some(path) = &self.disk_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            return Ok(path.clone());
        }
        let dir = settings.disk_directory()?.join(format!("{}-disks", self.name));
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{}.qcow2", self.name)))
    }

    /// Create the managed qcow2 image, echoing qemu-img output as it runs.
    pub fn create_disk(&self, settings: &Settings) -> Result<()> {
        let path = self.storage_path(settings)?;
        if path.exists() {
            return Err(Error::validation(format!(
                "The machine disk already exists at {}",
                path.display()
            )));
        }
        let size = self.disk_size.ok_or_else(|| {
            Error::validation("The machine uses an existing disk image; there is nothing to create")
        })?;
        if size < MIN_DISK_MIB {
            return Err(Error::validation(
                "The machine configuration has a very small disk. Operation aborted",
            ));
        }

        let size_arg = format!("{}M", size);
        let path_arg = path.display().to_string();
        for line in host::stream("qemu-img", &["create", "-f", "qcow2", &path_arg, &size_arg])? {
            println!("{}", line?);
        }
        Ok(())
    }

    /// Fail-fast preconditions; nothing host-mutating happens before these
    /// all pass.
    pub fn check_requirements(&self, settings: &Settings) -> Result<()> {
        if !Path::new(BIOS_PATH).exists() {
            return Err(Error::precondition(format!("Bios file not found: {}", BIOS_PATH)));
        }
        if self.evdev_keyboard.is_none() {
            return Err(Error::precondition("The keyboard is not configured"));
        }
        if self.evdev_mouse.is_none() {
            return Err(Error::precondition("The mouse is not configured"));
        }
        let disk = self.storage_path(settings)?;
        if !disk.exists() {
            return Err(Error::precondition(format!("File not found: {}", disk.display())));
        }
        for raw in [&self.raw_disk1, &self.raw_disk2].into_iter().flatten() {
            if !raw.exists() {
                return Err(Error::precondition(format!("Disk device not found: {}", raw.display())));
            }
        }
        if self.gpus.is_empty() {
            return Err(Error::precondition(
                "No gpu was assigned to this machine; at least one is required",
            ));
        }
        Ok(())
    }

    /// Bring the tap network up, build the launch plan and hand control to
    /// the hypervisor until the guest powers off.
    pub fn execute(&self, settings: &Settings, iso: Option<&Path>) -> Result<()> {
        self.check_requirements(settings)?;

        let uplink = settings
            .network_interface()
            .ok_or_else(|| Error::precondition("Target network not configured"))?
            .to_string();
        network::ensure_tap_network(&uplink, settings.network_ip())?;

        let iso = match iso {
            Some(path) => Some(path.canonicalize().map_err(|_| {
                Error::precondition(format!("File not found: {}", path.display()))
            })?),
            None => None,
        };

        let host_ctx = HostContext {
            bios: PathBuf::from(BIOS_PATH),
            disk: self.storage_path(settings)?,
            iso,
            scream_shmem: existing(PathBuf::from(SCREAM_SHMEM_PATH)),
            tpm_socket: existing(settings.tpm_socket_path()?),
            host_cpus: num_cpus::get(),
        };

        let plan = qemu::build_launch_plan(self, &host_ctx);
        let binary = settings.qemu_binary();
        info!("launching {} ({} device arguments)", self.name, plan.args().len());
        host::run_attached_as_super(&binary.display().to_string(), plan.args())
    }
}

fn config_path(settings: &Settings, name: &str) -> Result<PathBuf> {
    Ok(settings.machines_dir()?.join(format!("{}.yaml", name)))
}

/// Upgrade configs written by older releases. Files predating the schema
/// field may lack a uuid and mac address; both are generated once here and
/// kept for the life of the machine.
fn migrate(mut machine: MachineConfig) -> MachineConfig {
    if machine.schema < SCHEMA_VERSION {
        if machine.uuid.is_empty() {
            machine.uuid = Uuid::new_v4().to_string();
            info!("assigned uuid {} to legacy machine {}", machine.uuid, machine.name);
        }
        if machine.mac_address.is_empty() {
            machine.mac_address = random_mac();
            warn!("assigned new mac address {} to legacy machine {}", machine.mac_address, machine.name);
        }
        machine.schema = SCHEMA_VERSION;
    }
    machine
}

/// Parse a comma separated list of GPU indices against the number of
/// discovered GPUs. Rejects anything out of range and duplicates, so a bad
/// answer never mutates the config.
pub fn parse_gpu_selection(input: &str, available: usize) -> Result<Vec<usize>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::validation("No options were selected"));
    }
    let mut selected = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        let index: usize = part
            .parse()
            .map_err(|_| Error::validation(format!("{} is not a valid option", part)))?;
        if index >= available {
            return Err(Error::validation(format!("{} is not a valid option", index)));
        }
        if selected.contains(&index) {
            return Err(Error::validation(format!(
                "The gpu number {} is duplicated in your selection",
                index
            )));
        }
        selected.push(index);
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_settings() -> (TempDir, Settings) {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::open_at(tmp.path()).unwrap();
        (tmp, settings)
    }

    #[test]
    fn create_persists_and_reloads() {
        let (_tmp, settings) = test_settings();
        let machine = MachineConfig::create(&settings, "win10", -1, 8192, DiskSource::Size(40000), true).unwrap();
        assert_eq!(machine.cpus, -1);
        assert!(!machine.uuid.is_empty());
        assert!(machine.mac_address.starts_with("52:54:"));

        let loaded = MachineConfig::load(&settings, "win10").unwrap();
        assert_eq!(loaded, machine);
        assert_eq!(MachineConfig::list(&settings).unwrap(), vec!["win10".to_string()]);
    }

    #[test]
    fn create_rejects_small_disk_before_writing_anything() {
        let (_tmp, settings) = test_settings();
        let err = MachineConfig::create(&settings, "tiny", -1, 2000, DiskSource::Size(3000), false).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!MachineConfig::exists(&settings, "tiny").unwrap());
        assert!(MachineConfig::list(&settings).unwrap().is_empty());
    }

    #[test]
    fn create_rejects_small_memory() {
        let (_tmp, settings) = test_settings();
        let err = MachineConfig::create(&settings, "m", -1, 128, DiskSource::Size(20000), false).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!MachineConfig::exists(&settings, "m").unwrap());
    }

    #[test]
    fn create_rejects_duplicate_names() {
        let (_tmp, settings) = test_settings();
        MachineConfig::create(&settings, "dup", 4, 4096, DiskSource::Size(20000), false).unwrap();
        assert!(MachineConfig::create(&settings, "dup", 4, 4096, DiskSource::Size(20000), false).is_err());
    }

    #[test]
    fn cpu_count_validation() {
        let (_tmp, settings) = test_settings();
        let mut machine =
            MachineConfig::create(&settings, "c", 2, 4096, DiskSource::Size(20000), false).unwrap();
        assert!(machine.set_cpus(-2).is_err());
        assert!(machine.set_cpus(0).is_err());
        machine.set_cpus(-1).unwrap();
        assert_eq!(machine.cpus, -1);
    }

    #[test]
    fn disk_sources_are_mutually_exclusive() {
        let (tmp, settings) = test_settings();
        let image = tmp.path().join("disk.qcow2");
        fs::write(&image, b"stub").unwrap();

        let mut machine =
            MachineConfig::create(&settings, "x", 2, 4096, DiskSource::Size(20000), false).unwrap();
        machine.set_disk_path(&image).unwrap();
        assert_eq!(machine.disk_size, None);
        machine.set_disk_size(30000).unwrap();
        assert_eq!(machine.disk_path, None);
    }

    #[test]
    fn raw_disks_fill_two_slots_then_reject() {
        let (tmp, settings) = test_settings();
        let dev1 = tmp.path().join("sdb");
        let dev2 = tmp.path().join("sdc");
        fs::write(&dev1, b"").unwrap();
        fs::write(&dev2, b"").unwrap();

        let mut machine =
            MachineConfig::create(&settings, "r", 2, 4096, DiskSource::Size(20000), false).unwrap();
        machine.add_raw_disk(&dev1).unwrap();
        machine.add_raw_disk(&dev2).unwrap();
        assert_eq!(machine.raw_disk1.as_deref(), Some(dev1.as_path()));
        assert_eq!(machine.raw_disk2.as_deref(), Some(dev2.as_path()));
        assert!(machine.add_raw_disk(&dev1).is_err());
        assert!(machine.add_raw_disk(Path::new("/no/such/device")).is_err());
    }

    #[test]
    fn gpu_selection_parsing() {
        assert_eq!(parse_gpu_selection("0", 2).unwrap(), vec![0]);
        assert_eq!(parse_gpu_selection("1, 0", 2).unwrap(), vec![1, 0]);
        // index 2 when only indices 0..1 exist
        assert!(parse_gpu_selection("2", 2).is_err());
        assert!(parse_gpu_selection("0,0", 2).is_err());
        assert!(parse_gpu_selection("", 2).is_err());
        assert!(parse_gpu_selection("a", 2).is_err());
        assert!(parse_gpu_selection("-1", 2).is_err());
    }

    #[test]
    fn legacy_files_are_migrated_on_load() {
        let (_tmp, settings) = test_settings();
        let path = settings.machines_dir().unwrap().join("old.yaml");
        fs::write(
            &path,
            "machine:\n  name: old\n  cpus: 2\n  memory: 2048\n  disk-size: 20000\n",
        )
        .unwrap();

        let machine = MachineConfig::load(&settings, "old").unwrap();
        assert_eq!(machine.schema, SCHEMA_VERSION);
        assert!(!machine.uuid.is_empty());
        assert!(machine.mac_address.starts_with("52:54:"));
        assert!(!machine.tpm);

        // the generated identity is written back, so it survives reloads
        let reloaded = MachineConfig::load(&settings, "old").unwrap();
        assert_eq!(reloaded.uuid, machine.uuid);
        assert_eq!(reloaded.mac_address, machine.mac_address);
    }

    #[test]
    fn load_missing_machine_is_not_found() {
        let (_tmp, settings) = test_settings();
        let err = MachineConfig::load(&settings, "ghost").unwrap_err();
        assert!(matches!(err, Error::MachineNotFound(_)));
    }

    #[test]
    fn storage_path_prefers_custom_disk() {
        let (tmp, settings) = test_settings();
        let image = tmp.path().join("have").join("disk.qcow2");
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"stub").unwrap();

        let mut machine =
            MachineConfig::create(&settings, "s", 2, 4096, DiskSource::Size(20000), false).unwrap();
        assert!(machine
            .storage_path(&settings)
            .unwrap()
            .ends_with("s-disks/s.qcow2"));
        machine.set_disk_path(&image).unwrap();
        assert_eq!(machine.storage_path(&settings).unwrap(), image);
    }

    #[test]
    fn requirements_fail_without_inputs_or_gpus() {
        let (_tmp, settings) = test_settings();
        let machine =
            MachineConfig::create(&settings, "req", 2, 4096, DiskSource::Size(20000), false).unwrap();
        // regardless of which precondition trips first, nothing is mutated
        assert!(machine.check_requirements(&settings).is_err());
    }
}
