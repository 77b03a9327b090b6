//! KVM machine driver: lifecycle orchestration over a [`Connector`].
//!
//! Every operation opens its own connection and looks the domain up by
//! name. Handles are dropped (and thereby released) before the operation
//! returns or starts a polling wait, on every path.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::address;
use crate::error::{DriverError, Result};
use crate::state::MachineState;
use crate::storage::prepare_store_dir;
use crate::traits::{Connection, Connector, DiskProvisioner, DomainHandle, Driver, ReadinessProbe};
use crate::types::{Machine, DEFAULT_SSH_PORT, DEFAULT_SSH_USER};
use crate::xml::{build_domain_descriptor, build_network_descriptor};

/// Identifier reported by [`Driver::driver_name`].
pub const DRIVER_NAME: &str = "kvm2";

/// Bounded polling: `attempts` checks, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Longest time the policy can spend sleeping.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

/// Start waits up to 40 x 3s for a DHCP lease.
pub const START_IP_POLL: PollPolicy = PollPolicy::new(40, Duration::from_secs(3));

/// Stop waits up to 60 x 1s for the guest to power off.
pub const STOP_POLL: PollPolicy = PollPolicy::new(60, Duration::from_secs(1));

/// The libvirt/KVM machine driver.
pub struct KvmDriver {
    machine: Machine,
    connector: Arc<dyn Connector>,
    provisioner: Arc<dyn DiskProvisioner>,
    probe: Arc<dyn ReadinessProbe>,
    start_poll: PollPolicy,
    stop_poll: PollPolicy,
}

impl KvmDriver {
    /// Create a driver for `machine` over the given collaborators.
    pub fn new(
        machine: Machine,
        connector: Arc<dyn Connector>,
        provisioner: Arc<dyn DiskProvisioner>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            machine,
            connector,
            provisioner,
            probe,
            start_poll: START_IP_POLL,
            stop_poll: STOP_POLL,
        }
    }

    /// Override the IP wait used by Start.
    pub fn with_start_poll(mut self, policy: PollPolicy) -> Self {
        self.start_poll = policy;
        self
    }

    /// Override the shutdown wait used by Stop.
    pub fn with_stop_poll(mut self, policy: PollPolicy) -> Self {
        self.stop_poll = policy;
        self
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Give the machine record back to the caller.
    pub fn into_machine(self) -> Machine {
        self.machine
    }

    fn connect(&self) -> Result<Box<dyn Connection>> {
        self.connector.connect()
    }

    fn require_domain(&self, conn: &dyn Connection) -> Result<Box<dyn DomainHandle>> {
        conn.lookup_domain(&self.machine.name)?
            .ok_or_else(|| DriverError::DomainNotFound(self.machine.name.clone()))
    }

    /// Make sure the public network exists and the private network is
    /// defined and active.
    fn ensure_private_network(&self) -> Result<()> {
        let m = &self.machine;
        let conn = self.connect()?;

        if conn.lookup_network(&m.network)?.is_none() {
            return Err(DriverError::NetworkNotFound(m.network.clone()));
        }

        let net = match conn.lookup_network(&m.private_network)? {
            Some(net) => {
                debug!(network = %m.private_network, "Private network already defined");
                net
            }
            None => {
                let xml = build_network_descriptor(&m.private_network, m.private_subnet)?;
                match conn.define_network(&xml) {
                    Ok(net) => net,
                    // Someone else defined it in the meantime
                    Err(e) => match conn.lookup_network(&m.private_network)? {
                        Some(net) => {
                            debug!(
                                network = %m.private_network,
                                error = %e,
                                "Network already exists"
                            );
                            net
                        }
                        None => return Err(e),
                    },
                }
            }
        };

        if !net.is_active()? {
            info!(network = %m.private_network, "Starting private network");
            if let Err(e) = net.create() {
                if !net.is_active()? {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Define the domain unless a previous Create already did. Returns
    /// true when an existing definition was reused.
    fn define_domain(&mut self) -> Result<bool> {
        let xml = build_domain_descriptor(&mut self.machine)?;
        debug!(xml = %xml, "Generated domain XML");

        let conn = self.connect()?;
        if conn.lookup_domain(&self.machine.name)?.is_some() {
            info!("Domain already defined, reusing it");
            return Ok(true);
        }
        let _domain = conn.define_domain(&xml)?;
        Ok(false)
    }

    /// Wait for the booted domain to get an IP and answer on SSH.
    async fn wait_until_reachable(&mut self) -> Result<()> {
        self.machine.ip_address = None;
        info!("Waiting to get IP");
        let ip = self.wait_for_ip().await?;
        self.machine.ip_address = Some(ip.clone());

        info!("Waiting for SSH to be available");
        if let Err(e) = self.probe.wait_for_ssh(&ip, self.ssh_port()).await {
            self.machine.ip_address = None;
            return Err(match e {
                DriverError::SshUnavailable(_) => e,
                other => DriverError::SshUnavailable(other.to_string()),
            });
        }
        Ok(())
    }

    async fn wait_for_ip(&self) -> Result<String> {
        let policy = self.start_poll;
        let started = Instant::now();

        for attempt in 1..=policy.attempts {
            match self.ip().await {
                Ok(Some(ip)) => {
                    info!(ip = %ip, "Found IP for machine");
                    return Ok(ip);
                }
                Ok(None) => {
                    debug!(
                        attempt,
                        max_attempts = policy.attempts,
                        "Waiting for machine to come up"
                    );
                }
                Err(DriverError::NotRunning { state }) => {
                    debug!(
                        attempt,
                        max_attempts = policy.attempts,
                        state = %state,
                        "Machine not running yet"
                    );
                }
                Err(e) => return Err(e),
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }

        warn!(attempts = policy.attempts, "Machine did not get an IP");
        Err(DriverError::IpTimeout {
            attempts: policy.attempts,
            waited: started.elapsed(),
        })
    }
}

/// Record a teardown failure unless the resource was already gone.
fn record_teardown(failures: &mut Vec<String>, what: String, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!(what = %what, "Already gone"),
        Err(e) => {
            warn!(what = %what, error = %e, "Teardown step failed");
            failures.push(format!("{}: {}", what, e));
        }
    }
}

#[async_trait]
impl Driver for KvmDriver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn machine_name(&self) -> &str {
        &self.machine.name
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn pre_command_check(&self) -> Result<u64> {
        let conn = self.connect()?;
        let version = conn.lib_version()?;
        debug!(version, "Using libvirt version");
        Ok(version)
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn create(&mut self) -> Result<()> {
        info!("Creating machine");
        self.machine.validate().map_err(|e| e.in_step("validating machine"))?;

        info!("Creating network");
        self.ensure_private_network()
            .map_err(|e| e.in_step("creating network"))?;

        info!("Setting up store directory");
        prepare_store_dir(&self.machine.machine_dir())
            .map_err(|e| e.in_step("setting up store directory"))?;

        info!("Building disk image");
        self.provisioner
            .make_disk_image(
                &self.machine,
                &self.machine.boot2docker_url,
                self.machine.disk_size_mb,
            )
            .await
            .map_err(|e| e.in_step("creating disk"))?;

        info!("Defining domain");
        let reused = self
            .define_domain()
            .map_err(|e| e.in_step("creating domain"))?;

        debug!("Finished creating machine, now starting machine");
        let started = if reused && matches!(self.state().await, Ok(MachineState::Running)) {
            // Left running by an earlier Create that gave up waiting
            info!("Domain already running, skipping boot");
            self.wait_until_reachable().await
        } else {
            self.start().await
        };
        started.map_err(|e| e.in_step("starting machine"))
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn start(&mut self) -> Result<()> {
        info!("Booting domain");
        {
            let conn = self.connect()?;
            let domain = self.require_domain(conn.as_ref())?;
            domain.create()?;
        }

        self.wait_until_reachable().await
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn stop(&mut self) -> Result<()> {
        self.machine.ip_address = None;

        let state = self.state().await?;
        if state == MachineState::Stopped {
            info!("Machine already stopped");
            return Ok(());
        }

        {
            let conn = self.connect()?;
            let domain = self.require_domain(conn.as_ref())?;
            domain.shutdown()?;
        }

        let policy = self.stop_poll;
        let mut current = state;
        for attempt in 1..=policy.attempts {
            current = self.state().await?;
            if current == MachineState::Stopped {
                info!("Machine stopped");
                return Ok(());
            }
            info!(
                attempt,
                max_attempts = policy.attempts,
                state = %current,
                "Waiting for machine to stop"
            );
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }

        warn!(state = %current, "Graceful shutdown timed out");
        Err(DriverError::StopTimeout {
            state: current,
            attempts: policy.attempts,
        })
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn kill(&mut self) -> Result<()> {
        info!("Killing machine");
        let conn = self.connect()?;
        let domain = self.require_domain(conn.as_ref())?;
        domain.destroy()
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn remove(&mut self) -> Result<()> {
        debug!("Removing machine");
        let conn = self.connect()?;
        let mut failures = Vec::new();

        let network = &self.machine.private_network;
        debug!("Checking if the network needs to be deleted");
        match conn.lookup_network(network) {
            Ok(None) => warn!(network = %network, "Network does not exist, nothing to clean up"),
            Ok(Some(net)) => {
                info!(network = %network, "Network exists, removing");
                record_teardown(
                    &mut failures,
                    format!("destroying network {}", network),
                    net.destroy(),
                );
                record_teardown(
                    &mut failures,
                    format!("undefining network {}", network),
                    net.undefine(),
                );
            }
            Err(e) => {
                warn!(network = %network, error = %e, "Network lookup failed");
                failures.push(format!("looking up network {}: {}", network, e));
            }
        }

        let name = &self.machine.name;
        debug!("Checking if the domain needs to be deleted");
        match conn.lookup_domain(name) {
            Ok(None) => warn!(domain = %name, "Domain does not exist, nothing to clean up"),
            Ok(Some(domain)) => {
                info!(domain = %name, "Domain exists, removing");
                record_teardown(
                    &mut failures,
                    format!("destroying domain {}", name),
                    domain.destroy(),
                );
                record_teardown(
                    &mut failures,
                    format!("undefining domain {}", name),
                    domain.undefine(),
                );
            }
            Err(e) => {
                warn!(domain = %name, error = %e, "Domain lookup failed");
                failures.push(format!("looking up domain {}: {}", name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DriverError::Teardown { failures })
        }
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn state(&self) -> Result<MachineState> {
        let conn = self.connect()?;
        let Some(domain) = conn.lookup_domain(&self.machine.name)? else {
            debug!("Domain not found");
            return Ok(MachineState::None);
        };
        let native = domain.state()?;
        Ok(MachineState::from(native))
    }

    #[instrument(skip(self), fields(machine = %self.machine.name))]
    async fn ip(&self) -> Result<Option<String>> {
        let state = self.state().await?;
        if state != MachineState::Running {
            return Err(DriverError::NotRunning { state });
        }
        let conn = self.connect()?;
        address::lookup_ip(conn.as_ref(), &self.machine.private_network, &self.machine.mac)
    }

    fn ssh_port(&self) -> u16 {
        if self.machine.ssh_port == 0 {
            DEFAULT_SSH_PORT
        } else {
            self.machine.ssh_port
        }
    }

    fn ssh_username(&self) -> &str {
        if self.machine.ssh_user.is_empty() {
            DEFAULT_SSH_USER
        } else {
            &self.machine.ssh_user
        }
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.machine.resolve_store_path("id_rsa")
    }
}
