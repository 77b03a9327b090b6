//! In-memory hypervisor for tests and development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::{DriverError, Result};
use crate::state::DomainState;
use crate::traits::{
    Connection, Connector, DhcpLease, DiskProvisioner, DomainHandle, NetworkHandle, ReadinessProbe,
};
use crate::types::Machine;

/// Counts of hypervisor calls observed by the mock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub connect: u32,
    pub define_domain: u32,
    pub domain_create: u32,
    pub domain_shutdown: u32,
    pub domain_destroy: u32,
    pub domain_undefine: u32,
    pub domain_state: u32,
    pub define_network: u32,
    pub network_create: u32,
    pub network_destroy: u32,
    pub network_undefine: u32,
    pub lease_queries: u32,
}

struct MockDomain {
    xml: String,
    mac: Option<String>,
    state: DomainState,
    /// Lease queries seen since the last boot
    boot_queries: u32,
    /// State polls left before a requested shutdown completes
    shutdown_countdown: Option<u32>,
}

struct MockNetwork {
    active: bool,
    leases: Vec<DhcpLease>,
}

struct MockState {
    domains: HashMap<String, MockDomain>,
    networks: HashMap<String, MockNetwork>,
    calls: MockCalls,
    failing: HashSet<&'static str>,
    fail_connect: bool,
    lib_version: u64,
    /// IP handed to a booted domain after this many empty lease queries
    boot_lease: Option<(String, u32)>,
    /// State polls a graceful shutdown takes; `None` means it never completes
    shutdown_polls: Option<u32>,
    open_connections: usize,
    open_handles: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            domains: HashMap::new(),
            networks: HashMap::new(),
            calls: MockCalls::default(),
            failing: HashSet::new(),
            fail_connect: false,
            lib_version: 8_000_000,
            boot_lease: None,
            shutdown_polls: Some(0),
            open_connections: 0,
            open_handles: 0,
        }
    }
}

impl MockState {
    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(DriverError::hypervisor(op, "injected failure"));
        }
        Ok(())
    }
}

/// Mock hypervisor connector.
///
/// Simulates domains and networks in memory. Clones share state, so a test
/// can keep one clone for inspection while the driver owns another.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<Mutex<MockState>>,
}

fn lock(inner: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockConnector {
    /// Create a new, empty mock hypervisor.
    pub fn new() -> Self {
        info!("Creating mock hypervisor connector");
        Self::default()
    }

    /// Pre-define a domain in the given state.
    pub fn add_domain(&self, name: &str, state: DomainState) {
        lock(&self.inner).domains.insert(
            name.to_string(),
            MockDomain {
                xml: String::new(),
                mac: None,
                state,
                boot_queries: 0,
                shutdown_countdown: None,
            },
        );
    }

    /// Pre-define a network.
    pub fn add_network(&self, name: &str, active: bool) {
        lock(&self.inner).networks.insert(
            name.to_string(),
            MockNetwork {
                active,
                leases: Vec::new(),
            },
        );
    }

    /// Add a static lease to a network.
    pub fn set_lease(&self, network: &str, mac: &str, ip: &str) {
        if let Some(net) = lock(&self.inner).networks.get_mut(network) {
            net.leases.push(DhcpLease {
                mac: mac.to_string(),
                ip: ip.to_string(),
                hostname: None,
            });
        }
    }

    /// Give each booted domain `ip` once `empty_queries` lease queries have
    /// come back empty.
    pub fn set_boot_lease(&self, ip: &str, empty_queries: u32) {
        lock(&self.inner).boot_lease = Some((ip.to_string(), empty_queries));
    }

    /// Number of state polls a graceful shutdown takes. `None` makes the
    /// guest ignore shutdown requests.
    pub fn set_shutdown_polls(&self, polls: Option<u32>) {
        lock(&self.inner).shutdown_polls = polls;
    }

    /// Make every call named `op` fail.
    pub fn fail_on(&self, op: &'static str) {
        lock(&self.inner).failing.insert(op);
    }

    /// Make `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        lock(&self.inner).fail_connect = fail;
    }

    pub fn set_lib_version(&self, version: u64) {
        lock(&self.inner).lib_version = version;
    }

    pub fn calls(&self) -> MockCalls {
        lock(&self.inner).calls.clone()
    }

    pub fn domain_state(&self, name: &str) -> Option<DomainState> {
        lock(&self.inner).domains.get(name).map(|d| d.state)
    }

    pub fn domain_xml(&self, name: &str) -> Option<String> {
        lock(&self.inner).domains.get(name).map(|d| d.xml.clone())
    }

    pub fn has_network(&self, name: &str) -> bool {
        lock(&self.inner).networks.contains_key(name)
    }

    pub fn network_active(&self, name: &str) -> Option<bool> {
        lock(&self.inner).networks.get(name).map(|n| n.active)
    }

    /// Connections not yet dropped.
    pub fn open_connections(&self) -> usize {
        lock(&self.inner).open_connections
    }

    /// Domain and network handles not yet dropped.
    pub fn open_handles(&self) -> usize {
        lock(&self.inner).open_handles
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = lock(&self.inner);
        state.calls.connect += 1;
        if state.fail_connect {
            return Err(DriverError::connection("mock connection refused"));
        }
        state.open_connections += 1;
        Ok(Box::new(MockConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockConnection {
    inner: Arc<Mutex<MockState>>,
}

impl MockConnection {
    fn domain_handle(&self, state: &mut MockState, name: &str) -> Box<dyn DomainHandle> {
        state.open_handles += 1;
        Box::new(MockDomainHandle {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    fn network_handle(&self, state: &mut MockState, name: &str) -> Box<dyn NetworkHandle> {
        state.open_handles += 1;
        Box::new(MockNetworkHandle {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        lock(&self.inner).open_connections -= 1;
    }
}

/// Pull the MAC out of a domain descriptor.
fn mac_from_xml(xml: &str) -> Option<String> {
    let start = xml.find("<mac address='")? + "<mac address='".len();
    let end = xml[start..].find('\'')?;
    Some(xml[start..start + end].to_string())
}

/// Pull the `<name>` out of a descriptor.
fn name_from_xml(xml: &str) -> Result<String> {
    let start = xml
        .find("<name>")
        .map(|i| i + "<name>".len())
        .ok_or_else(|| DriverError::hypervisor("parsing descriptor", "missing <name>"))?;
    let end = xml[start..]
        .find("</name>")
        .ok_or_else(|| DriverError::hypervisor("parsing descriptor", "unterminated <name>"))?;
    Ok(xml[start..start + end].to_string())
}

impl Connection for MockConnection {
    fn lib_version(&self) -> Result<u64> {
        Ok(lock(&self.inner).lib_version)
    }

    fn lookup_domain(&self, name: &str) -> Result<Option<Box<dyn DomainHandle>>> {
        let mut state = lock(&self.inner);
        state.check("lookup_domain")?;
        if !state.domains.contains_key(name) {
            return Ok(None);
        }
        Ok(Some(self.domain_handle(&mut state, name)))
    }

    fn define_domain(&self, xml: &str) -> Result<Box<dyn DomainHandle>> {
        let mut state = lock(&self.inner);
        state.calls.define_domain += 1;
        state.check("define_domain")?;

        let name = name_from_xml(xml)?;
        if state.domains.contains_key(&name) {
            return Err(DriverError::hypervisor(
                "define_domain",
                format!("domain '{}' already exists", name),
            ));
        }

        debug!(domain = %name, "Mock domain defined");
        state.domains.insert(
            name.clone(),
            MockDomain {
                xml: xml.to_string(),
                mac: mac_from_xml(xml),
                state: DomainState::Shutoff,
                boot_queries: 0,
                shutdown_countdown: None,
            },
        );
        Ok(self.domain_handle(&mut state, &name))
    }

    fn lookup_network(&self, name: &str) -> Result<Option<Box<dyn NetworkHandle>>> {
        let mut state = lock(&self.inner);
        state.check("lookup_network")?;
        if !state.networks.contains_key(name) {
            return Ok(None);
        }
        Ok(Some(self.network_handle(&mut state, name)))
    }

    fn define_network(&self, xml: &str) -> Result<Box<dyn NetworkHandle>> {
        let mut state = lock(&self.inner);
        state.calls.define_network += 1;
        state.check("define_network")?;

        let name = name_from_xml(xml)?;
        if state.networks.contains_key(&name) {
            return Err(DriverError::hypervisor(
                "define_network",
                format!("network '{}' already exists", name),
            ));
        }
        state.networks.insert(
            name.clone(),
            MockNetwork {
                active: false,
                leases: Vec::new(),
            },
        );
        Ok(self.network_handle(&mut state, &name))
    }
}

struct MockDomainHandle {
    name: String,
    inner: Arc<Mutex<MockState>>,
}

impl MockDomainHandle {
    fn with_domain<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut MockDomain, &MockState) -> Result<T>,
    ) -> Result<T> {
        let mut guard = lock(&self.inner);
        guard.check(op)?;
        let state = &mut *guard;
        let mut domain = state
            .domains
            .remove(&self.name)
            .ok_or_else(|| DriverError::DomainNotFound(self.name.clone()))?;
        let result = f(&mut domain, state);
        state.domains.insert(self.name.clone(), domain);
        result
    }
}

impl Drop for MockDomainHandle {
    fn drop(&mut self) {
        lock(&self.inner).open_handles -= 1;
    }
}

impl DomainHandle for MockDomainHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<DomainState> {
        lock(&self.inner).calls.domain_state += 1;
        self.with_domain("domain_state", |domain, _| {
            if domain.state == DomainState::Shutdown {
                match domain.shutdown_countdown {
                    Some(0) => {
                        domain.state = DomainState::Shutoff;
                        domain.shutdown_countdown = None;
                    }
                    Some(n) => domain.shutdown_countdown = Some(n - 1),
                    None => {}
                }
            }
            Ok(domain.state)
        })
    }

    fn create(&self) -> Result<()> {
        lock(&self.inner).calls.domain_create += 1;
        self.with_domain("domain_create", |domain, _| {
            if domain.state == DomainState::Running {
                return Err(DriverError::hypervisor("domain_create", "domain is already running"));
            }
            domain.state = DomainState::Running;
            domain.boot_queries = 0;
            Ok(())
        })
    }

    fn destroy(&self) -> Result<()> {
        lock(&self.inner).calls.domain_destroy += 1;
        self.with_domain("domain_destroy", |domain, _| {
            domain.state = DomainState::Shutoff;
            domain.shutdown_countdown = None;
            Ok(())
        })
    }

    fn shutdown(&self) -> Result<()> {
        lock(&self.inner).calls.domain_shutdown += 1;
        self.with_domain("domain_shutdown", |domain, state| {
            if domain.state != DomainState::Running {
                return Err(DriverError::hypervisor("domain_shutdown", "domain is not running"));
            }
            domain.state = DomainState::Shutdown;
            domain.shutdown_countdown = state.shutdown_polls;
            Ok(())
        })
    }

    fn undefine(&self) -> Result<()> {
        let mut state = lock(&self.inner);
        state.calls.domain_undefine += 1;
        state.check("domain_undefine")?;
        state
            .domains
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| DriverError::DomainNotFound(self.name.clone()))
    }
}

struct MockNetworkHandle {
    name: String,
    inner: Arc<Mutex<MockState>>,
}

impl Drop for MockNetworkHandle {
    fn drop(&mut self) {
        lock(&self.inner).open_handles -= 1;
    }
}

impl NetworkHandle for MockNetworkHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> Result<bool> {
        let state = lock(&self.inner);
        state
            .networks
            .get(&self.name)
            .map(|n| n.active)
            .ok_or_else(|| DriverError::NetworkNotFound(self.name.clone()))
    }

    fn create(&self) -> Result<()> {
        let mut state = lock(&self.inner);
        state.calls.network_create += 1;
        state.check("network_create")?;
        let net = state
            .networks
            .get_mut(&self.name)
            .ok_or_else(|| DriverError::NetworkNotFound(self.name.clone()))?;
        if net.active {
            return Err(DriverError::hypervisor("network_create", "network is already active"));
        }
        net.active = true;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let mut state = lock(&self.inner);
        state.calls.network_destroy += 1;
        state.check("network_destroy")?;
        let net = state
            .networks
            .get_mut(&self.name)
            .ok_or_else(|| DriverError::NetworkNotFound(self.name.clone()))?;
        net.active = false;
        Ok(())
    }

    fn undefine(&self) -> Result<()> {
        let mut state = lock(&self.inner);
        state.calls.network_undefine += 1;
        state.check("network_undefine")?;
        state
            .networks
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| DriverError::NetworkNotFound(self.name.clone()))
    }

    fn dhcp_leases(&self) -> Result<Vec<DhcpLease>> {
        let mut guard = lock(&self.inner);
        guard.calls.lease_queries += 1;
        guard.check("dhcp_leases")?;

        let state = &mut *guard;
        let mut leases = state
            .networks
            .get(&self.name)
            .map(|n| n.leases.clone())
            .ok_or_else(|| DriverError::NetworkNotFound(self.name.clone()))?;

        for domain in state.domains.values_mut() {
            if domain.state != DomainState::Running {
                continue;
            }
            domain.boot_queries += 1;
            if let (Some((ip, empty)), Some(mac)) = (&state.boot_lease, &domain.mac) {
                if domain.boot_queries > *empty {
                    leases.push(DhcpLease {
                        mac: mac.clone(),
                        ip: ip.clone(),
                        hostname: None,
                    });
                }
            }
        }

        Ok(leases)
    }
}

// =============================================================================
// Provisioner and probe doubles
// =============================================================================

/// Disk provisioner that records calls and optionally fails.
#[derive(Clone, Default)]
pub struct MockProvisioner {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiskProvisioner for MockProvisioner {
    async fn make_disk_image(
        &self,
        machine: &Machine,
        _boot_source: &str,
        size_mb: u64,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DriverError::DiskImage(format!(
                "injected failure for {}",
                machine.disk_path.display()
            )));
        }
        debug!(machine = %machine.name, size_mb, "Mock disk image created");
        Ok(())
    }
}

/// Readiness probe that succeeds or fails immediately.
#[derive(Clone, Default)]
pub struct MockProbe {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for MockProbe {
    async fn wait_for_ssh(&self, host: &str, port: u16) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DriverError::SshUnavailable(format!("{}:{} refused", host, port)));
        }
        Ok(())
    }
}
