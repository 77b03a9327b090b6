//! Driver and collaborator traits.
//!
//! [`Driver`] is the caller-facing operation set. The remaining traits are
//! the seams to the outside world: the hypervisor connection, the disk
//! provisioner and the SSH readiness probe. Each has one production
//! implementation and a test double.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;
use crate::state::{DomainState, MachineState};
use crate::types::Machine;

// =============================================================================
// Caller-facing driver
// =============================================================================

/// Lifecycle operations exposed to the host-provisioning tool.
///
/// Callers must serialize operations on a single machine; no internal
/// locking is performed.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short driver identifier.
    fn driver_name(&self) -> &'static str;

    /// Name of the managed machine.
    fn machine_name(&self) -> &str;

    /// Verify the hypervisor is reachable. Returns the library version.
    async fn pre_command_check(&self) -> Result<u64>;

    /// Create the network, disk and domain, then start the machine.
    async fn create(&mut self) -> Result<()>;

    /// Boot the domain and wait for an IP and SSH.
    async fn start(&mut self) -> Result<()>;

    /// Gracefully shut the domain down and wait for it to power off.
    async fn stop(&mut self) -> Result<()>;

    /// Stop, then start.
    async fn restart(&mut self) -> Result<()> {
        crate::traits::restart(self).await
    }

    /// Power the domain off immediately.
    async fn kill(&mut self) -> Result<()>;

    /// Tear down the private network and the domain, tolerating absence.
    async fn remove(&mut self) -> Result<()>;

    /// Current caller-facing state; `None` if the domain does not exist.
    async fn state(&self) -> Result<MachineState>;

    /// IP on the private network. `Ok(None)` means running but no lease yet.
    async fn ip(&self) -> Result<Option<String>>;

    /// Docker endpoint URL, if an IP is known.
    async fn url(&self) -> Result<Option<String>> {
        self.pre_command_check().await?;
        Ok(self.ip().await?.map(|ip| format!("tcp://{}:2376", ip)))
    }

    /// SSH host, which is the machine IP.
    async fn ssh_hostname(&self) -> Result<Option<String>> {
        self.ip().await
    }

    /// SSH port on the guest.
    fn ssh_port(&self) -> u16;

    /// SSH username on the guest.
    fn ssh_username(&self) -> &str;

    /// Path of the private key used to reach the guest.
    fn ssh_key_path(&self) -> PathBuf;
}

/// Restart expressed purely in terms of the driver's own Stop and Start.
pub async fn restart<D: Driver + ?Sized>(driver: &mut D) -> Result<()> {
    driver.stop().await?;
    driver.start().await
}

// =============================================================================
// Hypervisor API
// =============================================================================

/// Opens connections to the hypervisor management endpoint.
pub trait Connector: Send + Sync {
    /// Open a new connection. Dropping the returned value closes it.
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// An open hypervisor connection.
///
/// Lookups return `Ok(None)` when the object does not exist so callers can
/// tell absence apart from real failures.
pub trait Connection: Send {
    /// Library version as `major * 1_000_000 + minor * 1_000 + micro`.
    fn lib_version(&self) -> Result<u64>;

    fn lookup_domain(&self, name: &str) -> Result<Option<Box<dyn DomainHandle>>>;

    /// Define a persistent domain from XML.
    fn define_domain(&self, xml: &str) -> Result<Box<dyn DomainHandle>>;

    fn lookup_network(&self, name: &str) -> Result<Option<Box<dyn NetworkHandle>>>;

    /// Define a persistent network from XML.
    fn define_network(&self, xml: &str) -> Result<Box<dyn NetworkHandle>>;
}

/// Handle on a defined domain. Dropping it frees the handle.
pub trait DomainHandle: Send {
    fn name(&self) -> &str;

    fn state(&self) -> Result<DomainState>;

    /// Boot the defined domain.
    fn create(&self) -> Result<()>;

    /// Hard power-off. Destroying an inactive domain succeeds.
    fn destroy(&self) -> Result<()>;

    /// Request a graceful (ACPI) shutdown.
    fn shutdown(&self) -> Result<()>;

    /// Delete the persistent definition.
    fn undefine(&self) -> Result<()>;
}

/// Handle on a defined network. Dropping it frees the handle.
pub trait NetworkHandle: Send {
    fn name(&self) -> &str;

    fn is_active(&self) -> Result<bool>;

    /// Start the defined network.
    fn create(&self) -> Result<()>;

    /// Stop the network. Destroying an inactive network succeeds.
    fn destroy(&self) -> Result<()>;

    /// Delete the persistent definition.
    fn undefine(&self) -> Result<()>;

    /// Current DHCP leases handed out on this network.
    fn dhcp_leases(&self) -> Result<Vec<DhcpLease>>;
}

/// One DHCP lease on a libvirt network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: String,
    pub hostname: Option<String>,
}

// =============================================================================
// Disk provisioning and readiness
// =============================================================================

/// Produces a bootable disk image for a machine.
#[async_trait]
pub trait DiskProvisioner: Send + Sync {
    /// Fetch the boot image from `boot_source` and create the machine disk
    /// of `size_mb` megabytes.
    async fn make_disk_image(
        &self,
        machine: &Machine,
        boot_source: &str,
        size_mb: u64,
    ) -> Result<()>;
}

/// Blocks until the guest's SSH endpoint answers, or gives up.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_for_ssh(&self, host: &str, port: u16) -> Result<()>;
}
