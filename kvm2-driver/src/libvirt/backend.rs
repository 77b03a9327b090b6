//! Libvirt connector implementation.

use std::path::Path;
use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::network::Network;

use crate::address::{read_bridge_leases, DNSMASQ_STATE_DIR};
use crate::error::{DriverError, Result};
use crate::state::DomainState;
use crate::traits::{Connection, Connector, DhcpLease, DomainHandle, NetworkHandle};

/// Opens connections to a libvirt daemon.
///
/// Common URIs:
/// - `qemu:///system` - System-wide QEMU/KVM
/// - `qemu:///session` - User session QEMU
/// - `qemu+ssh://user@host/system` - Remote via SSH
pub struct LibvirtConnector {
    uri: String,
}

impl LibvirtConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Connector for LibvirtConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        debug!(uri = %self.uri, "Connecting to libvirt");

        let conn = Connect::open(Some(self.uri.as_str())).map_err(DriverError::connection)?;
        let lib_version = match conn.get_lib_version() {
            Ok(version) => u64::from(version),
            Err(e) => {
                // Still a usable connection; fall back to the legacy lease file
                warn!(error = %e, "Could not read libvirt version");
                0
            }
        };

        Ok(Box::new(LibvirtConnection {
            conn,
            lib_version,
        }))
    }
}

/// An open libvirt connection. Closed on drop.
pub struct LibvirtConnection {
    conn: Connect,
    lib_version: u64,
}

impl Drop for LibvirtConnection {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            warn!(error = %e, "Failed to close libvirt connection");
        }
    }
}

fn is_no_domain(e: &VirtError) -> bool {
    matches!(e.code(), ErrorNumber::NoDomain)
}

fn is_no_network(e: &VirtError) -> bool {
    matches!(e.code(), ErrorNumber::NoNetwork)
}

impl Connection for LibvirtConnection {
    fn lib_version(&self) -> Result<u64> {
        self.conn
            .get_lib_version()
            .map(u64::from)
            .map_err(|e| DriverError::hypervisor("getting libvirt version", e))
    }

    fn lookup_domain(&self, name: &str) -> Result<Option<Box<dyn DomainHandle>>> {
        match Domain::lookup_by_name(&self.conn, name) {
            Ok(domain) => Ok(Some(Box::new(LibvirtDomain {
                name: name.to_string(),
                domain,
            }))),
            Err(e) if is_no_domain(&e) => Ok(None),
            Err(e) => Err(DriverError::hypervisor("looking up domain", e)),
        }
    }

    fn define_domain(&self, xml: &str) -> Result<Box<dyn DomainHandle>> {
        let domain = Domain::define_xml(&self.conn, xml)
            .map_err(|e| DriverError::hypervisor("defining domain", e))?;
        let name = domain
            .get_name()
            .map_err(|e| DriverError::hypervisor("getting domain name", e))?;
        info!(domain = %name, "Domain defined");
        Ok(Box::new(LibvirtDomain { name, domain }))
    }

    fn lookup_network(&self, name: &str) -> Result<Option<Box<dyn NetworkHandle>>> {
        match Network::lookup_by_name(&self.conn, name) {
            Ok(network) => Ok(Some(Box::new(LibvirtNetwork {
                name: name.to_string(),
                network,
                lib_version: self.lib_version,
            }))),
            Err(e) if is_no_network(&e) => Ok(None),
            Err(e) => Err(DriverError::hypervisor("looking up network", e)),
        }
    }

    fn define_network(&self, xml: &str) -> Result<Box<dyn NetworkHandle>> {
        let network = Network::define_xml(&self.conn, xml)
            .map_err(|e| DriverError::hypervisor("defining network", e))?;
        let name = network
            .get_name()
            .map_err(|e| DriverError::hypervisor("getting network name", e))?;
        info!(network = %name, "Network defined");
        Ok(Box::new(LibvirtNetwork {
            name,
            network,
            lib_version: self.lib_version,
        }))
    }
}

/// Domain handle; the underlying reference is freed when dropped.
struct LibvirtDomain {
    name: String,
    domain: Domain,
}

impl DomainHandle for LibvirtDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<DomainState> {
        let (state, _reason) = self
            .domain
            .get_state()
            .map_err(|e| DriverError::hypervisor("getting domain state", e))?;
        Ok(DomainState::from_raw(state as u32))
    }

    fn create(&self) -> Result<()> {
        self.domain
            .create()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("starting domain", e))
    }

    fn destroy(&self) -> Result<()> {
        let active = self
            .domain
            .is_active()
            .map_err(|e| DriverError::hypervisor("checking domain", e))?;
        if !active {
            debug!(domain = %self.name, "Domain not active, nothing to destroy");
            return Ok(());
        }
        self.domain
            .destroy()
            .map_err(|e| DriverError::hypervisor("destroying domain", e))
    }

    fn shutdown(&self) -> Result<()> {
        self.domain
            .shutdown()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("shutting down domain", e))
    }

    fn undefine(&self) -> Result<()> {
        self.domain.undefine().map_err(|e| {
            if is_no_domain(&e) {
                DriverError::DomainNotFound(self.name.clone())
            } else {
                DriverError::hypervisor("undefining domain", e)
            }
        })
    }
}

/// Network handle; the underlying reference is freed when dropped.
struct LibvirtNetwork {
    name: String,
    network: Network,
    lib_version: u64,
}

impl NetworkHandle for LibvirtNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> Result<bool> {
        self.network
            .is_active()
            .map_err(|e| DriverError::hypervisor("checking network", e))
    }

    fn create(&self) -> Result<()> {
        self.network
            .create()
            .map(|_| ())
            .map_err(|e| DriverError::hypervisor("starting network", e))
    }

    fn destroy(&self) -> Result<()> {
        if !self.is_active()? {
            debug!(network = %self.name, "Network not active, nothing to destroy");
            return Ok(());
        }
        self.network
            .destroy()
            .map_err(|e| DriverError::hypervisor("destroying network", e))
    }

    fn undefine(&self) -> Result<()> {
        self.network.undefine().map_err(|e| {
            if is_no_network(&e) {
                DriverError::NetworkNotFound(self.name.clone())
            } else {
                DriverError::hypervisor("undefining network", e)
            }
        })
    }

    fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
        let bridge = self
            .network
            .get_bridge_name()
            .map_err(|e| DriverError::hypervisor("getting bridge name", e))?;
        read_bridge_leases(Path::new(DNSMASQ_STATE_DIR), &bridge, self.lib_version)
    }
}
