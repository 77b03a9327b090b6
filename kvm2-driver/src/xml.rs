//! Libvirt descriptor generation.
//!
//! Produces the domain and network XML submitted to libvirt. Both builders
//! are pure: no I/O, and the same input always yields the same document.

use quick_xml::escape::escape;
use std::net::Ipv4Addr;

use crate::error::{DriverError, Result};
use crate::types::Machine;

/// Build the domain descriptor for a machine, generating its MAC first if
/// it has none. The MAC is kept on the machine so later builds reuse it.
pub fn build_domain_descriptor(machine: &mut Machine) -> Result<String> {
    machine.ensure_mac();
    DomainXmlBuilder::new(machine).build()
}

/// Build the descriptor of the private network.
pub fn build_network_descriptor(name: &str, subnet: Ipv4Addr) -> Result<String> {
    NetworkXmlBuilder::new(name, subnet).build()
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    machine: &'a Machine,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a new XML builder for the given machine.
    pub fn new(machine: &'a Machine) -> Self {
        Self { machine }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> Result<String> {
        let m = self.machine;
        if m.memory_mb == 0 || m.cpu_count == 0 || m.disk_size_mb == 0 {
            return Err(DriverError::InvalidConfig(format!(
                "machine {}: memory, cpu and disk size must be positive",
                m.name
            )));
        }
        if m.mac.is_empty() {
            return Err(DriverError::InvalidConfig(format!(
                "machine {} has no MAC address",
                m.name
            )));
        }

        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='MB'>{}</memory>
  <vcpu>{}</vcpu>
  <features>
    <acpi/>
    <apic/>
    <pae/>
  </features>
  <cpu mode='host-passthrough'/>
"#,
            escape(&m.name),
            m.memory_mb,
            m.cpu_count
        ));

        // Boot from the ISO; the disk is formatted by the guest on first boot
        xml.push_str(
            r#"  <os>
    <type>hvm</type>
    <boot dev='cdrom'/>
    <boot dev='hd'/>
    <bootmenu enable='no'/>
  </os>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disks());
        xml.push_str(&self.build_nics());
        xml.push_str(&self.build_console());
        xml.push_str(
            r#"    <rng model='virtio'>
      <backend model='random'>/dev/random</backend>
    </rng>
"#,
        );
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");

        Ok(xml)
    }

    fn build_disks(&self) -> String {
        let m = self.machine;
        format!(
            r#"    <disk type='file' device='cdrom'>
      <source file='{}'/>
      <target dev='hdc' bus='scsi'/>
      <readonly/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw' cache='{}' io='{}'/>
      <source file='{}'/>
      <target dev='hda' bus='virtio'/>
    </disk>
"#,
            escape(&m.iso_path.to_string_lossy()),
            m.cache_mode.as_str(),
            m.io_mode.as_str(),
            escape(&m.disk_path.to_string_lossy())
        )
    }

    fn build_nics(&self) -> String {
        let m = self.machine;
        // The MAC sits on the private NIC; the address resolver matches
        // leases of the private network against it.
        format!(
            r#"    <interface type='network'>
      <source network='{}'/>
      <model type='virtio'/>
    </interface>
    <interface type='network'>
      <mac address='{}'/>
      <source network='{}'/>
      <model type='virtio'/>
    </interface>
"#,
            escape(&m.network),
            escape(&m.mac),
            escape(&m.private_network)
        )
    }

    fn build_console(&self) -> String {
        r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
"#
        .to_string()
    }
}

/// Builder for libvirt network XML.
pub struct NetworkXmlBuilder<'a> {
    name: &'a str,
    subnet: Ipv4Addr,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(name: &'a str, subnet: Ipv4Addr) -> Self {
        Self { name, subnet }
    }

    /// Build the network XML string: DNS off, gateway at .1, DHCP .2-.254.
    pub fn build(&self) -> Result<String> {
        if self.name.is_empty() {
            return Err(DriverError::InvalidConfig("network name is empty".into()));
        }
        let [a, b, c, d] = self.subnet.octets();
        if d != 0 {
            return Err(DriverError::InvalidConfig(format!(
                "subnet {} is not a /24 base address",
                self.subnet
            )));
        }

        Ok(format!(
            r#"<network>
  <name>{name}</name>
  <dns enable='no'/>
  <ip address='{a}.{b}.{c}.1' netmask='255.255.255.0'>
    <dhcp>
      <range start='{a}.{b}.{c}.2' end='{a}.{b}.{c}.254'/>
    </dhcp>
  </ip>
</network>
"#,
            name = escape(self.name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CacheMode, DriverConfig, IoMode};
    use std::path::PathBuf;

    fn machine() -> Machine {
        let config = DriverConfig {
            memory_mb: 2048,
            cpu_count: 2,
            ..Default::default()
        };
        let mut machine = Machine::new("test-vm", "/x", &config);
        machine.disk_path = PathBuf::from("/x/y.img");
        machine
    }

    #[test]
    fn test_basic_xml_generation() {
        let mut machine = machine();
        let xml = build_domain_descriptor(&mut machine).unwrap();

        assert!(xml.contains("<name>test-vm</name>"));
        assert!(xml.contains("<memory unit='MB'>2048</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<source file='/x/y.img'/>"));
        assert!(xml.contains("<source file='/x/machines/test-vm/boot2docker.iso'/>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("<source network='minikube-net'/>"));
    }

    #[test]
    fn test_mac_generated_and_reused() {
        let mut machine = machine();
        assert!(machine.mac.is_empty());

        let first = build_domain_descriptor(&mut machine).unwrap();
        let mac = machine.mac.clone();
        assert!(!mac.is_empty());
        assert!(first.contains(&format!("<mac address='{}'/>", mac)));

        let second = build_domain_descriptor(&mut machine).unwrap();
        assert_eq!(machine.mac, mac);
        assert_eq!(first, second);
    }

    #[test]
    fn test_existing_mac_kept() {
        let mut machine = machine();
        machine.mac = "52:54:00:12:34:56".to_string();
        let xml = build_domain_descriptor(&mut machine).unwrap();
        assert!(xml.contains("<mac address='52:54:00:12:34:56'/>"));
        assert_eq!(machine.mac, "52:54:00:12:34:56");
    }

    #[test]
    fn test_boot_order_cdrom_first() {
        let mut machine = machine();
        let xml = build_domain_descriptor(&mut machine).unwrap();
        let cdrom = xml.find("<boot dev='cdrom'/>").unwrap();
        let hd = xml.find("<boot dev='hd'/>").unwrap();
        assert!(cdrom < hd);
    }

    #[test]
    fn test_disk_modes() {
        let mut machine = machine();
        machine.cache_mode = CacheMode::Writeback;
        machine.io_mode = IoMode::Native;
        let xml = build_domain_descriptor(&mut machine).unwrap();
        assert!(xml.contains("cache='writeback' io='native'"));
    }

    #[test]
    fn test_zero_resources_rejected() {
        let mut machine = machine();
        machine.memory_mb = 0;
        assert!(build_domain_descriptor(&mut machine).is_err());
    }

    #[test]
    fn test_name_is_escaped() {
        let mut machine = machine();
        machine.name = "a<b".to_string();
        let xml = build_domain_descriptor(&mut machine).unwrap();
        assert!(xml.contains("<name>a&lt;b</name>"));
    }

    #[test]
    fn test_network_xml() {
        let xml = build_network_descriptor("minikube-net", Ipv4Addr::new(192, 168, 39, 0)).unwrap();
        assert!(xml.contains("<name>minikube-net</name>"));
        assert!(xml.contains("<dns enable='no'/>"));
        assert!(xml.contains("address='192.168.39.1' netmask='255.255.255.0'"));
        assert!(xml.contains("start='192.168.39.2' end='192.168.39.254'"));
    }

    #[test]
    fn test_network_xml_rejects_host_address() {
        assert!(build_network_descriptor("n", Ipv4Addr::new(10, 0, 0, 7)).is_err());
        assert!(build_network_descriptor("", Ipv4Addr::new(10, 0, 0, 0)).is_err());
    }
}
