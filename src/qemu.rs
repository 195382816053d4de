//! Deterministic assembly of the hypervisor command line.
//!
//! `build_launch_plan` is a pure function of the machine config and a
//! snapshot of host facts; it touches neither the filesystem nor the
//! process table. The same inputs always produce the same argument vector,
//! section by section: base flags, the fixed PCIe topology, inputs, disks,
//! audio shmem, GPUs, network, ISO, TPM.

use log::{debug, warn};

use crate::machine::MachineConfig;
use crate::network::TAP_INTERFACE_NAME;

use std::path::PathBuf;

/// Guest slots reserved for passthrough GPUs: (video bus, audio bus).
/// The topology has room for two cards.
const GPU_BUS_PAIRS: [(&str, &str); 2] = [("pci.4", "pci.5"), ("pci.2", "pci.3")];

/// Host facts sampled once before the plan is built.
pub struct HostContext {
    pub bios: PathBuf,
    pub disk: PathBuf,
    pub iso: Option<PathBuf>,
    pub scream_shmem: Option<PathBuf>,
    pub tpm_socket: Option<PathBuf>,
    pub host_cpus: usize,
}

/// The ordered argument vector handed to the hypervisor binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    args: Vec<String>,
}

impl LaunchPlan {
    fn push(&mut self, option: &str, value: impl Into<String>) {
        self.args.push(option.to_string());
        self.args.push(value.into());
    }

    fn flag(&mut self, option: &str) {
        self.args.push(option.to_string());
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

pub fn build_launch_plan(machine: &MachineConfig, host: &HostContext) -> LaunchPlan {
    let mut plan = LaunchPlan { args: Vec::new() };
    base_section(&mut plan, machine, host);
    pci_topology_section(&mut plan);
    input_section(&mut plan, machine);
    disk_section(&mut plan, machine, host);
    scream_section(&mut plan, host);
    gpu_section(&mut plan, machine);
    network_section(&mut plan, machine);
    iso_section(&mut plan, host);
    tpm_section(&mut plan, machine, host);
    debug!("launch plan has {} arguments", plan.args.len());
    plan
}

fn base_section(plan: &mut LaunchPlan, machine: &MachineConfig, host: &HostContext) {
    // memory is floored to a multiple of 4 MiB
    let memory = (machine.memory / 4) * 4;
    // -1 means "all host cores"
    let cpus = if machine.cpus == -1 {
        host.host_cpus as i64
    } else {
        machine.cpus
    };

    plan.push("-name", format!("guest={},debug-threads=on", machine.name));
    plan.push(
        "-machine",
        "pc-q35-5.1,accel=kvm,usb=off,vmport=off,dump-guest-core=off,kernel_irqchip=on",
    );
    plan.push("-bios", host.bios.display().to_string());
    plan.push(
        "-cpu",
        "host,migratable=on,hv-time,hv-relaxed,hv-vapic,hv-spinlocks=0x4000,hv-vpindex,\
         hv-runtime,hv-synic,hv-stimer,hv-reset,hv-vendor-id=441863197303,hv-frequencies,\
         hv-reenlightenment,hv-tlbflush,kvm=off",
    );
    plan.push("-m", memory.to_string());
    plan.push("-overcommit", "mem-lock=off");
    plan.push("-smp", format!("{},sockets=1,dies=1,cores={},threads=1", cpus, cpus));
    plan.push("-uuid", machine.uuid.clone());
    plan.flag("-no-user-config");
    plan.flag("-nodefaults");
    plan.push("-rtc", "base=localtime,driftfix=slew");
    plan.push("-global", "kvm-pit.lost_tick_policy=delay");
    plan.flag("-no-hpet");
    plan.push("-global", "ICH9-LPC.disable_s3=1");
    plan.push("-global", "ICH9-LPC.disable_s4=1");
    plan.flag("-nographic");
    plan.push(
        "-sandbox",
        "on,obsolete=deny,elevateprivileges=deny,spawn=deny,resourcecontrol=deny",
    );
    plan.push("-msg", "timestamp=on");
}

/// The guest bus layout never varies with configuration: ten root ports
/// plus one conventional bridge. Keeping guest addresses stable across
/// launches stops Windows from re-enumerating its hardware.
fn pci_topology_section(plan: &mut LaunchPlan) {
    plan.push(
        "-device",
        "pcie-root-port,port=0x10,chassis=1,id=pci.1,bus=pcie.0,multifunction=on,addr=0x2",
    );
    plan.push("-device", "pcie-root-port,port=0x11,chassis=2,id=pci.2,bus=pcie.0,addr=0x2.0x1");
    plan.push("-device", "pcie-root-port,port=0x12,chassis=3,id=pci.3,bus=pcie.0,addr=0x2.0x2");
    plan.push("-device", "pcie-root-port,port=0x13,chassis=4,id=pci.4,bus=pcie.0,addr=0x2.0x3");
    plan.push("-device", "pcie-root-port,port=0x14,chassis=5,id=pci.5,bus=pcie.0,addr=0x2.0x4");
    plan.push("-device", "pcie-root-port,port=0x15,chassis=6,id=pci.6,bus=pcie.0,addr=0x2.0x5");
    plan.push("-device", "pcie-root-port,port=0x16,chassis=7,id=pci.7,bus=pcie.0,addr=0x2.0x6");
    plan.push("-device", "pcie-root-port,port=0x17,chassis=8,id=pci.8,bus=pcie.0,addr=0x2.0x7");
    plan.push("-device", "pcie-root-port,port=0x18,chassis=9,id=pci.9,bus=pcie.0,addr=0x3.0x1");
    plan.push("-device", "pcie-root-port,port=0x19,chassis=10,id=pci.10,bus=pcie.0,addr=0x3.0x2");
    plan.push("-device", "pcie-pci-bridge,id=pci.11,bus=pci.1,addr=0x0");
}

fn input_section(plan: &mut LaunchPlan, machine: &MachineConfig) {
    if let Some(mouse) = &machine.evdev_mouse {
        plan.push("-object", format!("input-linux,id=mouse1,evdev={}", mouse.display()));
    }
    if let Some(keyboard) = &machine.evdev_keyboard {
        plan.push(
            "-object",
            format!("input-linux,id=kbd1,evdev={},grab_all=on,repeat=on", keyboard.display()),
        );
    }
}

fn disk_section(plan: &mut LaunchPlan, machine: &MachineConfig, host: &HostContext) {
    plan.push(
        "-blockdev",
        format!(
            "{{\"driver\":\"file\",\"filename\":\"{}\",\"node-name\":\"libvirt-3-storage\",\"auto-read-only\":true,\"discard\":\"unmap\"}}",
            host.disk.display()
        ),
    );
    plan.push(
        "-blockdev",
        "{\"node-name\":\"libvirt-3-format\",\"read-only\":false,\"driver\":\"qcow2\",\"file\":\"libvirt-3-storage\",\"backing\":null}",
    );
    plan.push("-device", "ide-hd,bus=ide.0,drive=libvirt-3-format,id=sata0-0-0,bootindex=1");

    let raw_disks = [(1, &machine.raw_disk1), (2, &machine.raw_disk2)];
    for (number, disk) in raw_disks {
        let disk = match disk {
            Some(disk) => disk,
            None => continue,
        };
        plan.push(
            "-blockdev",
            format!(
                "{{\"driver\":\"host_device\",\"filename\":\"{}\",\"node-name\":\"libvirt-{}-storage\",\"cache\":{{\"direct\":true,\"no-flush\":false}},\"auto-read-only\":true,\"discard\":\"unmap\"}}",
                disk.display(),
                number
            ),
        );
        plan.push(
            "-blockdev",
            format!(
                "{{\"node-name\":\"libvirt-{}-format\",\"read-only\":false,\"cache\":{{\"direct\":true,\"no-flush\":false}},\"driver\":\"raw\",\"file\":\"libvirt-{}-storage\"}}",
                number, number
            ),
        );
        plan.push(
            "-device",
            format!(
                "virtio-blk-pci,bus=pci.{},addr=0x0,drive=libvirt-{}-format,id=virtio-disk{},write-cache=on",
                6 + number,
                number,
                number
            ),
        );
    }
}

/// Shared-memory audio transport, attached only when the host side ring
/// buffer already exists.
fn scream_section(plan: &mut LaunchPlan, host: &HostContext) {
    if let Some(shmem) = &host.scream_shmem {
        plan.push(
            "-object",
            format!(
                "memory-backend-file,id=shmmem-shmem0,mem-path={},size=2097152,share=yes",
                shmem.display()
            ),
        );
        plan.push("-device", "ivshmem-plain,id=shmem0,memdev=shmmem-shmem0,bus=pci.11,addr=0x2");
    }
}

fn gpu_section(plan: &mut LaunchPlan, machine: &MachineConfig) {
    for (index, gpu) in machine.gpus.iter().enumerate() {
        if index >= GPU_BUS_PAIRS.len() {
            warn!("only {} gpus can be attached; ignoring the rest", GPU_BUS_PAIRS.len());
            break;
        }
        let (video_bus, audio_bus) = GPU_BUS_PAIRS[index];
        plan.push(
            "-device",
            format!(
                "vfio-pci,host={},id=hostdev{},bus={},addr=0x0",
                gpu.video.address,
                index * 2,
                video_bus
            ),
        );
        if let Some(audio) = &gpu.audio {
            plan.push(
                "-device",
                format!(
                    "vfio-pci,host={},id=hostdev{},bus={},addr=0x0",
                    audio.address,
                    index * 2 + 1,
                    audio_bus
                ),
            );
        }
    }
}

fn network_section(plan: &mut LaunchPlan, machine: &MachineConfig) {
    plan.push(
        "-netdev",
        format!("tap,id=hostnet0,ifname={},script=no,downscript=no", TAP_INTERFACE_NAME),
    );
    plan.push(
        "-device",
        format!("e1000e,netdev=hostnet0,id=net0,mac={},bus=pci.6,addr=0x0", machine.mac_address),
    );
}

fn iso_section(plan: &mut LaunchPlan, host: &HostContext) {
    if let Some(iso) = &host.iso {
        plan.push(
            "-blockdev",
            format!(
                "{{\"driver\":\"file\",\"filename\":\"{}\",\"node-name\":\"libvirt-2-storage\",\"auto-read-only\":true,\"discard\":\"unmap\"}}",
                iso.display()
            ),
        );
        plan.push(
            "-blockdev",
            "{\"node-name\":\"libvirt-2-format\",\"read-only\":true,\"driver\":\"raw\",\"file\":\"libvirt-2-storage\"}",
        );
        plan.push("-device", "ide-cd,bus=ide.1,drive=libvirt-2-format,id=sata0-0-1");
    }
}

/// The TPM is attached only when the machine asks for one and the emulator
/// socket is already up.
fn tpm_section(plan: &mut LaunchPlan, machine: &MachineConfig, host: &HostContext) {
    if !machine.tpm {
        return;
    }
    if let Some(socket) = &host.tpm_socket {
        plan.push("-chardev", format!("socket,id=chrtpm,path={}", socket.display()));
        plan.push("-tpmdev", "emulator,id=tpm0,chardev=chrtpm");
        plan.push("-device", "tpm-tis,tpmdev=tpm0");
    }
}
