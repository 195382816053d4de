use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, Subcommand};

mod ask;
mod deps;
mod devices;
mod error;
mod gpu;
mod host;
mod input;
mod logger;
mod machine;
mod network;
mod qemu;
mod settings;
mod tpm;

use error::{Error, Result};
use machine::{DiskSource, MachineConfig};
use settings::Settings;

#[derive(Parser)]
#[command(name = "vm-trainer", version, about = "Configure and launch GPU passthrough virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Create new machine settings
    MachineCreate {
        /// The name of the virtual machine
        #[arg(long)]
        name: String,
        /// Number of cpu cores (-1 means all host cores)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        cpus: i64,
        /// Amount of memory in MB
        #[arg(long)]
        memory: u64,
        /// Disk space in MB for a new qcow2 disk
        #[arg(long)]
        disk_size: Option<u64>,
        /// Use an existing disk image instead of creating one
        #[arg(long)]
        existing_disk: Option<PathBuf>,
        /// Attach an emulated TPM 2.0 device
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        tpm: bool,
    },
    /// List existing machine names
    MachineList,
    /// Define the number of cpu cores to use
    MachineSetCpus {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        cpus: i64,
    },
    /// Define the machine memory
    MachineSetMemory {
        #[arg(long)]
        name: String,
        /// Amount of memory in MB
        #[arg(long)]
        memory: u64,
    },
    /// Assign gpus to an existing machine
    MachineSetGpus {
        #[arg(long)]
        name: String,
    },
    /// Select a mouse from the evdev devices
    MachineSelectMouse {
        #[arg(long)]
        name: String,
    },
    /// Select a keyboard from the evdev devices
    MachineSelectKeyboard {
        #[arg(long)]
        name: String,
    },
    /// Create the virtual machine disk (qcow2)
    MachineCreateDisk {
        #[arg(long)]
        name: String,
    },
    /// Add a physical disk device to the machine
    MachineSetDiskDevice {
        #[arg(long)]
        name: String,
        /// The disk device to map into the machine
        #[arg(long)]
        device: PathBuf,
    },
    /// Run the machine
    MachineRun {
        #[arg(long)]
        name: String,
    },
    /// Run the machine with an iso attached to it
    MachineRunWithIso {
        #[arg(long)]
        name: String,
        /// The path to the iso file to attach
        #[arg(long)]
        iso: PathBuf,
    },
    /// Kill the hypervisor process
    MachineKill,
    /// Show IOMMU kernel messages
    ShowIommu,
    /// List devices in IOMMU groups
    ShowIommuDevices,
    /// List GPUs in IOMMU groups
    ShowGpus,
    /// List available evdev user inputs
    UserInputList,
    /// List available evdev mice
    UserInputMouses,
    /// List available evdev keyboards
    UserInputKeyboards,
    /// Add the launcher's network interfaces
    NetworkAddTap {
        /// The physical interface with internet access
        #[arg(long)]
        target: String,
    },
    /// Remove the launcher's network interfaces
    NetworkDelTap,
    /// Show logical network interfaces
    NetworkShowLogical,
    /// Show physical network interfaces
    NetworkShowPhysical,
    /// Show an interface's MAC address
    NetworkShowMac {
        /// The network interface's name
        #[arg(long)]
        name: String,
    },
    /// Set the default disk directory for the machines
    SettingsSetDiskDir {
        #[arg(long)]
        path: PathBuf,
    },
    /// Show the default disk directory for the machines
    SettingsShowDiskDir,
    /// Set the network interface to connect the bridge with
    SettingsSetNetworkInterface {
        #[arg(long)]
        name: String,
    },
    /// Show the network interface the bridge connects with
    SettingsShowNetworkInterface,
    /// Set the bridge network interface's IP address
    SettingsSetIpAddress {
        #[arg(long)]
        ip: String,
    },
    /// Show the bridge network interface's IP address
    SettingsShowIpAddress,
    /// Check all host dependencies
    DependencyCheck,
    /// Start a software TPM device for the hypervisor
    TpmEmulator,
}

fn main() {
    logger::init();

    if nix::unistd::Uid::effective().is_root() {
        eprintln!("vm-trainer can't be executed by the root user. Please do not use sudo.");
        process::exit(1);
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    let settings = Settings::open()?;
    match command {
        Command::MachineCreate { name, cpus, memory, disk_size, existing_disk, tpm } => {
            deps::check_all()?;
            let disk = match (existing_disk, disk_size) {
                (Some(path), _) => DiskSource::Existing(path),
                (None, Some(size)) => DiskSource::Size(size),
                (None, None) => return Err(Error::validation("No disk settings were specified")),
            };
            let machine = MachineConfig::create(&settings, &name, cpus, memory, disk, tpm)?;
            if machine.disk_size.is_some() {
                machine.create_disk(&settings)?;
            }
            Ok(())
        }
        Command::MachineList => {
            for name in MachineConfig::list(&settings)? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::MachineSetCpus { name, cpus } => {
            let mut machine = MachineConfig::load(&settings, &name)?;
            machine.set_cpus(cpus)?;
            machine.save(&settings)
        }
        Command::MachineSetMemory { name, memory } => {
            let mut machine = MachineConfig::load(&settings, &name)?;
            machine.set_memory(memory)?;
            machine.save(&settings)
        }
        Command::MachineSetGpus { name } => {
            let mut machine = MachineConfig::load(&settings, &name)?;
            machine.select_gpus()?;
            machine.save(&settings)
        }
        Command::MachineSelectMouse { name } => {
            let mut machine = MachineConfig::load(&settings, &name)?;
            machine.select_mouse()?;
            machine.save(&settings)
        }
        Command::MachineSelectKeyboard { name } => {
            let mut machine = MachineConfig::load(&settings, &name)?;
            machine.select_keyboard()?;
            machine.save(&settings)
        }
        Command::MachineCreateDisk { name } => {
            let machine = MachineConfig::load(&settings, &name)?;
            machine.create_disk(&settings)
        }
        Command::MachineSetDiskDevice { name, device } => {
            let mut machine = MachineConfig::load(&settings, &name)?;
            machine.add_raw_disk(&device)?;
            machine.save(&settings)
        }
        Command::MachineRun { name } => {
            let machine = MachineConfig::load(&settings, &name)?;
            machine.execute(&settings, None)
        }
        Command::MachineRunWithIso { name, iso } => {
            let machine = MachineConfig::load(&settings, &name)?;
            machine.execute(&settings, Some(&iso))
        }
        Command::MachineKill => host::run_as_super("pkill", &["-f", "qemu-system-x86_64"])
            .map_err(|_| Error::precondition("Failed to kill the qemu process")),
        Command::ShowIommu => {
            for line in devices::iommu_kernel_messages()? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::ShowIommuDevices => {
            for record in devices::list_iommu_devices()? {
                println!("{}", record.description);
            }
            Ok(())
        }
        Command::ShowGpus => {
            for gpu in gpu::discover_gpus()? {
                println!("GPU: {}", gpu.video_vendor);
                println!(
                    "Addresses, video: [{}] audio: [{}]",
                    gpu.video_address,
                    gpu.audio_address.as_deref().unwrap_or("none")
                );
            }
            Ok(())
        }
        Command::UserInputList => {
            for device in input::list_devices()? {
                println!("{}", device);
            }
            Ok(())
        }
        Command::UserInputMouses => {
            for device in input::list_mice()? {
                println!("{}", device);
            }
            Ok(())
        }
        Command::UserInputKeyboards => {
            for device in input::list_keyboards()? {
                println!("{}", device);
            }
            Ok(())
        }
        Command::NetworkAddTap { target } => network::ensure_tap_network(&target, settings.network_ip()),
        Command::NetworkDelTap => {
            network::teardown_tap_network();
            Ok(())
        }
        Command::NetworkShowLogical => {
            for name in network::logical_interfaces()? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::NetworkShowPhysical => {
            for name in network::physical_interfaces()? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::NetworkShowMac { name } => {
            println!("{}", network::mac_address(&name)?);
            Ok(())
        }
        Command::SettingsSetDiskDir { path } => {
            let mut settings = settings;
            settings.set_disk_directory(&path);
            settings.save()
        }
        Command::SettingsShowDiskDir => {
            println!("{}", settings.disk_directory()?.display());
            Ok(())
        }
        Command::SettingsSetNetworkInterface { name } => {
            let mut settings = settings;
            settings.set_network_interface(&name);
            settings.save()
        }
        Command::SettingsShowNetworkInterface => {
            println!("{}", settings.network_interface().unwrap_or(""));
            Ok(())
        }
        Command::SettingsSetIpAddress { ip } => {
            let mut settings = settings;
            settings.set_network_ip(&ip);
            settings.save()
        }
        Command::SettingsShowIpAddress => {
            println!("{}", settings.network_ip());
            Ok(())
        }
        Command::DependencyCheck => {
            deps::check_all()?;
            println!("All dependencies are present");
            Ok(())
        }
        Command::TpmEmulator => tpm::run_emulator(&settings),
    }
}
