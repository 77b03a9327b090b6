//! End-to-end lifecycle tests over the in-memory hypervisor.

use std::sync::Arc;

use kvm2_driver::{
    Driver, DriverConfig, DriverError, KvmDriver, Machine, MachineState, MockConnector, MockProbe,
    MockProvisioner,
};
use tempfile::TempDir;
use tokio::time::Instant;

const NAME: &str = "minikube";
const PRIVATE: &str = "minikube-net";
const BOOT_IP: &str = "192.168.39.23";

struct Harness {
    _store: TempDir,
    mock: MockConnector,
    provisioner: MockProvisioner,
    driver: KvmDriver,
}

fn harness_with(provisioner: MockProvisioner) -> Harness {
    let store = tempfile::tempdir().unwrap();
    let mock = MockConnector::new();
    mock.add_network("default", true);
    mock.set_boot_lease(BOOT_IP, 2);

    let machine = Machine::new(NAME, store.path(), &DriverConfig::default());
    let driver = KvmDriver::new(
        machine,
        Arc::new(mock.clone()),
        Arc::new(provisioner.clone()),
        Arc::new(MockProbe::new()),
    );

    Harness {
        _store: store,
        mock,
        provisioner,
        driver,
    }
}

fn harness() -> Harness {
    harness_with(MockProvisioner::new())
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle() {
    let Harness { _store, mock, mut driver, .. } = harness();

    assert_eq!(driver.state().await.unwrap(), MachineState::None);

    driver.create().await.unwrap();
    assert_eq!(driver.state().await.unwrap(), MachineState::Running);
    assert_eq!(driver.machine().ip_address.as_deref(), Some(BOOT_IP));
    assert_eq!(mock.network_active(PRIVATE), Some(true));
    assert!(driver.machine().machine_dir().is_dir());

    let xml = mock.domain_xml(NAME).unwrap();
    assert!(xml.contains(&driver.machine().mac));
    assert!(xml.contains("<source network='default'/>"));
    assert!(xml.contains("<source network='minikube-net'/>"));

    driver.stop().await.unwrap();
    assert_eq!(driver.state().await.unwrap(), MachineState::Stopped);
    assert_eq!(driver.machine().ip_address, None);

    driver.restart().await.unwrap();
    assert_eq!(driver.state().await.unwrap(), MachineState::Running);
    assert_eq!(driver.ip().await.unwrap().as_deref(), Some(BOOT_IP));
    assert_eq!(
        driver.url().await.unwrap().as_deref(),
        Some("tcp://192.168.39.23:2376")
    );

    driver.kill().await.unwrap();
    assert_eq!(driver.state().await.unwrap(), MachineState::Stopped);

    driver.remove().await.unwrap();
    assert_eq!(driver.state().await.unwrap(), MachineState::None);
    assert!(!mock.has_network(PRIVATE));
    assert!(mock.has_network("default"));

    driver.remove().await.unwrap();

    assert_eq!(mock.open_handles(), 0);
    assert_eq!(mock.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_create_waits_for_lease() {
    let Harness { _store, mock, mut driver, .. } = harness();

    let before = Instant::now();
    driver.create().await.unwrap();

    // Two empty lease queries, one sleep after each
    assert_eq!(before.elapsed(), kvm2_driver::START_IP_POLL.interval * 2);
    assert_eq!(mock.calls().lease_queries, 3);
}

#[tokio::test]
async fn test_create_requires_public_network() {
    let store = tempfile::tempdir().unwrap();
    let mock = MockConnector::new();
    let machine = Machine::new(NAME, store.path(), &DriverConfig::default());
    let mut driver = KvmDriver::new(
        machine,
        Arc::new(mock.clone()),
        Arc::new(MockProvisioner::new()),
        Arc::new(MockProbe::new()),
    );

    let err = driver.create().await.unwrap_err();

    assert_eq!(err.failed_step(), Some("creating network"));
    assert!(err.to_string().contains("default"));
    assert_eq!(mock.calls().define_network, 0);
    assert_eq!(mock.calls().define_domain, 0);
}

#[tokio::test]
async fn test_create_stops_at_disk_failure() {
    let Harness {
        _store,
        mock,
        provisioner,
        mut driver,
        ..
    } = harness_with(MockProvisioner::failing());

    let err = driver.create().await.unwrap_err();

    assert_eq!(err.failed_step(), Some("creating disk"));
    assert_eq!(provisioner.calls(), 1);
    assert_eq!(mock.calls().define_domain, 0);
    // No rollback: the private network stays
    assert_eq!(mock.network_active(PRIVATE), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_create_reuses_inactive_private_network() {
    let Harness { _store, mock, mut driver, .. } = harness();
    mock.add_network(PRIVATE, false);

    driver.create().await.unwrap();

    let calls = mock.calls();
    assert_eq!(calls.define_network, 0);
    assert_eq!(calls.network_create, 1);
    assert_eq!(mock.network_active(PRIVATE), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_create_reports_ip_timeout() {
    let Harness { _store, mock, mut driver, .. } = harness();
    mock.set_boot_lease(BOOT_IP, u32::MAX);

    let err = driver.create().await.unwrap_err();

    assert_eq!(err.failed_step(), Some("starting machine"));
    assert!(err.is_timeout());
    assert_eq!(mock.calls().lease_queries, 40);
    // The domain is left defined and running for the caller to inspect
    assert_eq!(driver.state().await.unwrap(), MachineState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_create_retry_after_ip_timeout() {
    let Harness { _store, mock, mut driver, .. } = harness();
    mock.set_boot_lease(BOOT_IP, u32::MAX);
    assert!(driver.create().await.unwrap_err().is_timeout());

    // The guest finally gets its lease; the running domain is not booted again
    mock.set_boot_lease(BOOT_IP, 0);
    driver.create().await.unwrap();

    assert_eq!(driver.state().await.unwrap(), MachineState::Running);
    assert_eq!(driver.machine().ip_address.as_deref(), Some(BOOT_IP));
    let calls = mock.calls();
    assert_eq!(calls.define_domain, 1);
    assert_eq!(calls.domain_create, 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_retry_after_disk_failure() {
    let Harness { _store, mock, mut driver, .. } = harness_with(MockProvisioner::failing());
    assert!(driver.create().await.is_err());

    // Same machine record, working provisioner
    let machine = driver.into_machine();
    let mut driver = KvmDriver::new(
        machine,
        Arc::new(mock.clone()),
        Arc::new(MockProvisioner::new()),
        Arc::new(MockProbe::new()),
    );
    driver.create().await.unwrap();

    assert_eq!(mock.calls().define_network, 1);
    assert_eq!(driver.state().await.unwrap(), MachineState::Running);
}

#[tokio::test]
async fn test_connection_failure_surfaces_hint() {
    let Harness { _store, mock, mut driver, .. } = harness();
    mock.set_fail_connect(true);

    let err = driver.pre_command_check().await.unwrap_err();
    assert!(matches!(err, DriverError::ConnectionFailed { .. }));
    assert!(err.to_string().contains("libvirtd group"));

    let err = driver.create().await.unwrap_err();
    assert_eq!(err.failed_step(), Some("creating network"));
}

#[tokio::test]
async fn test_pre_command_check_reports_version() {
    let Harness { _store, mock, driver, .. } = harness();
    mock.set_lib_version(10_000_000);
    assert_eq!(driver.pre_command_check().await.unwrap(), 10_000_000);
}
