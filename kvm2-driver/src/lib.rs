//! # kvm2 Driver
//!
//! Machine driver that runs a single container-host VM on KVM via libvirt.
//!
//! The driver attaches each guest to two networks: a public one that must
//! already exist, and a private NAT network it creates on demand. The
//! guest's address is read back from the private network's DHCP leases.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Driver Trait               │
//! │   (create, start, stop, remove, ...)    │
//! └─────────────────────┬───────────────────┘
//!                       │
//!                  KvmDriver
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ LibvirtConnector  │     │   MockConnector   │
//! │   (via libvirt)   │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kvm2_driver::{Driver, DriverConfig, KvmDriver, Machine};
//! use kvm2_driver::{MockConnector, MockProbe, MockProvisioner};
//!
//! #[tokio::main]
//! async fn main() {
//!     let machine = Machine::new("minikube", "/tmp/store", &DriverConfig::default());
//!     let mut driver = KvmDriver::new(
//!         machine,
//!         Arc::new(MockConnector::new()),
//!         Arc::new(MockProvisioner::new()),
//!         Arc::new(MockProbe::new()),
//!     );
//!     driver.create().await.unwrap();
//! }
//! ```

pub mod address;
pub mod driver;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod probe;
pub mod state;
pub mod storage;
pub mod traits;
pub mod types;
pub mod xml;

pub use driver::{KvmDriver, PollPolicy, DRIVER_NAME, START_IP_POLL, STOP_POLL};
pub use error::{DriverError, Result};
pub use mock::{MockConnector, MockProbe, MockProvisioner};
pub use probe::TcpSshProbe;
pub use state::{DomainState, MachineState};
pub use storage::ImageProvisioner;
pub use traits::{
    Connection, Connector, DhcpLease, DiskProvisioner, DomainHandle, Driver, NetworkHandle,
    ReadinessProbe,
};
pub use types::*;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtConnector;
