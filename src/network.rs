//! Guest networking: a host bridge with a tap leg for the guest NIC and
//! NAT towards the physical uplink.
//!
//! Every step is idempotent. Interfaces are created only when absent and
//! firewall rules are checked with `iptables -C` before being appended, so
//! launching a second guest or re-running the setup leaves existing state
//! alone.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use log::{debug, info, warn};
use regex::Regex;

use crate::error::Result;
use crate::host;

pub const TAP_INTERFACE_NAME: &str = "vmtrainertap0";
pub const BRIDGE_INTERFACE_NAME: &str = "vmtrainerbr0";

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Physical interfaces resolve through a PCI device path in sysfs.
fn physical_link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"devices/pci[0-9a-f]{4}:").expect("link target pattern is valid"))
}

pub fn interface_exists(name: &str) -> bool {
    Path::new(SYS_CLASS_NET).join(name).exists()
}

/// Bring up the bridge, the tap leg and the NAT rules towards `uplink`.
/// `cidr` is the bridge address including its prefix length.
pub fn ensure_tap_network(uplink: &str, cidr: &str) -> Result<()> {
    ensure_bridge(cidr)?;
    ensure_tap()?;
    ensure_nat_rules(uplink)?;
    Ok(())
}

fn ensure_bridge(cidr: &str) -> Result<()> {
    if interface_exists(BRIDGE_INTERFACE_NAME) {
        debug!("bridge {} already exists", BRIDGE_INTERFACE_NAME);
        return Ok(());
    }
    info!("creating bridge {} ({})", BRIDGE_INTERFACE_NAME, cidr);
    host::run_as_super("ip", &["link", "add", BRIDGE_INTERFACE_NAME, "type", "bridge"])?;
    host::run_as_super("ip", &["addr", "add", cidr, "dev", BRIDGE_INTERFACE_NAME])?;
    host::run_as_super("ip", &["link", "set", BRIDGE_INTERFACE_NAME, "up"])?;
    Ok(())
}

fn ensure_tap() -> Result<()> {
    if interface_exists(TAP_INTERFACE_NAME) {
        debug!("tap {} already exists", TAP_INTERFACE_NAME);
        return Ok(());
    }
    info!("creating tap {} on {}", TAP_INTERFACE_NAME, BRIDGE_INTERFACE_NAME);
    host::run_as_super("ip", &["tuntap", "add", "dev", TAP_INTERFACE_NAME, "mode", "tap"])?;
    host::run_as_super("ip", &["link", "set", TAP_INTERFACE_NAME, "master", BRIDGE_INTERFACE_NAME])?;
    host::run_as_super("ip", &["link", "set", TAP_INTERFACE_NAME, "up"])?;
    Ok(())
}

/// Masquerade guest traffic out of `uplink` and allow forwarding in both
/// directions. Each rule is installed once.
fn ensure_nat_rules(uplink: &str) -> Result<()> {
    let forwarding = host::output("sysctl", &["-n", "net.ipv4.ip_forward"])?;
    if forwarding.trim() != "1" {
        info!("enabling ipv4 forwarding");
        host::run_as_super("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
    }

    let masquerade = ["-t", "nat", "POSTROUTING", "-o", uplink, "-j", "MASQUERADE"];
    append_rule_once(&rule_args(&masquerade))?;

    let outbound = ["FORWARD", "-i", BRIDGE_INTERFACE_NAME, "-o", uplink, "-j", "ACCEPT"];
    append_rule_once(&rule_args(&outbound))?;

    let inbound = [
        "FORWARD", "-i", uplink, "-o", BRIDGE_INTERFACE_NAME,
        "-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
    ];
    append_rule_once(&rule_args(&inbound))?;
    Ok(())
}

fn rule_args(rule: &[&str]) -> Vec<String> {
    rule.iter().map(|s| s.to_string()).collect()
}

/// `-C` asks whether the rule is present; only append on a miss.
fn append_rule_once(rule: &[String]) -> Result<()> {
    let mut check = vec!["iptables".to_string()];
    check.extend(with_action(rule, "-C"));
    if host::succeeds("sudo", &check) {
        debug!("iptables rule already present: {}", rule.join(" "));
        return Ok(());
    }
    host::run_as_super("iptables", &with_action(rule, "-A"))
}

/// The chain name sits after any `-t <table>` prefix; the action flag goes
/// immediately before it.
fn with_action(rule: &[String], action: &str) -> Vec<String> {
    let chain_at = if rule.first().map(|s| s.as_str()) == Some("-t") { 2 } else { 0 };
    let mut args: Vec<String> = rule[..chain_at].to_vec();
    args.push(action.to_string());
    args.extend(rule[chain_at..].iter().cloned());
    args
}

/// Tear the tap and bridge down. Best effort: a guest still holding the tap
/// open makes deletion fail, which is reported but not fatal.
pub fn teardown_tap_network() {
    for name in [TAP_INTERFACE_NAME, BRIDGE_INTERFACE_NAME] {
        if !interface_exists(name) {
            continue;
        }
        if let Err(e) = host::run_as_super("ip", &["link", "delete", name]) {
            warn!("could not remove {}: {}", name, e);
        }
    }
}

/// Interface names under /sys/class/net whose device link does not resolve
/// through a PCI path: bridges, taps, loopback, vpn tunnels.
pub fn logical_interfaces() -> Result<Vec<String>> {
    classify_interfaces(Path::new(SYS_CLASS_NET), false)
}

pub fn physical_interfaces() -> Result<Vec<String>> {
    classify_interfaces(Path::new(SYS_CLASS_NET), true)
}

fn classify_interfaces(class_dir: &Path, physical: bool) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(class_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if is_physical_link(&entry.path()) == physical {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn is_physical_link(path: &Path) -> bool {
    match fs::read_link(path) {
        Ok(target) => physical_link_regex().is_match(&target.to_string_lossy()),
        Err(_) => false,
    }
}

/// The hardware address as sysfs reports it.
pub fn mac_address(name: &str) -> Result<String> {
    let raw = fs::read_to_string(Path::new(SYS_CLASS_NET).join(name).join("address"))?;
    Ok(raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn action_flag_is_inserted_after_the_table_selector() {
        let rule = rule_args(&["-t", "nat", "POSTROUTING", "-o", "eth0", "-j", "MASQUERADE"]);
        assert_eq!(
            with_action(&rule, "-C"),
            vec!["-t", "nat", "-C", "POSTROUTING", "-o", "eth0", "-j", "MASQUERADE"]
        );

        let rule = rule_args(&["FORWARD", "-i", "br0", "-j", "ACCEPT"]);
        assert_eq!(with_action(&rule, "-A"), vec!["-A", "FORWARD", "-i", "br0", "-j", "ACCEPT"]);
    }

    #[test]
    fn interface_classification_follows_the_device_link() {
        let tmp = TempDir::new().unwrap();
        let devices = tmp.path().join("devices/pci0000:00/0000:00:1f.6/net/enp0s31f6");
        fs::create_dir_all(&devices).unwrap();
        let class_dir = tmp.path().join("class-net");
        fs::create_dir_all(&class_dir).unwrap();
        symlink(&devices, class_dir.join("enp0s31f6")).unwrap();
        fs::create_dir_all(class_dir.join("vmtrainerbr0")).unwrap();

        let physical = classify_interfaces(&class_dir, true).unwrap();
        assert_eq!(physical, vec!["enp0s31f6"]);
        let logical = classify_interfaces(&class_dir, false).unwrap();
        assert_eq!(logical, vec!["vmtrainerbr0"]);
    }

    #[test]
    fn missing_interface_does_not_exist() {
        assert!(!interface_exists("definitely-not-an-iface0"));
    }
}
