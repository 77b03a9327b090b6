//! Private-network address resolution.
//!
//! A running guest gets its address from the dnsmasq instance libvirt runs
//! for the private network. We find it by matching the machine's MAC
//! against the network's DHCP leases. No lease yet is the normal state
//! while the guest boots, so it is reported as `Ok(None)`.

use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::traits::{Connection, DhcpLease};

/// Where libvirt keeps dnsmasq state for its networks.
pub const DNSMASQ_STATE_DIR: &str = "/var/lib/libvirt/dnsmasq";

/// First libvirt version (1.2.6) that writes the JSON `.status` file.
pub const STATUS_FILE_MIN_VERSION: u64 = 1_002_006;

/// Look up the private-network IP leased to `mac`.
pub fn lookup_ip(conn: &dyn Connection, network: &str, mac: &str) -> Result<Option<String>> {
    let net = conn
        .lookup_network(network)?
        .ok_or_else(|| DriverError::NetworkNotFound(network.to_string()))?;

    let leases = net.dhcp_leases()?;
    debug!(network = %network, leases = leases.len(), "Fetched DHCP leases");

    Ok(leases
        .into_iter()
        .find(|lease| lease.mac.eq_ignore_ascii_case(mac))
        .map(|lease| lease.ip)
        .filter(|ip| !ip.is_empty()))
}

/// Read the leases dnsmasq recorded for `bridge`. A missing file means no
/// lease has been handed out yet.
pub fn read_bridge_leases(
    state_dir: &Path,
    bridge: &str,
    lib_version: u64,
) -> Result<Vec<DhcpLease>> {
    if lib_version >= STATUS_FILE_MIN_VERSION {
        let path = state_dir.join(format!("{}.status", bridge));
        match std::fs::read_to_string(&path) {
            Ok(content) => parse_status_file(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    } else {
        let path = state_dir.join(format!("{}.leases", bridge));
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(parse_leases_file(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Deserialize)]
struct StatusEntry {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "mac-address")]
    mac_address: String,
    #[serde(default)]
    hostname: Option<String>,
}

/// Parse the JSON `.status` file written by libvirt >= 1.2.6.
pub fn parse_status_file(content: &str) -> Result<Vec<DhcpLease>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let entries: Vec<StatusEntry> = serde_json::from_str(content)
        .map_err(|e| DriverError::hypervisor("parsing dnsmasq status file", e))?;

    Ok(entries
        .into_iter()
        .map(|e| DhcpLease {
            mac: e.mac_address,
            ip: e.ip_address,
            hostname: e.hostname,
        })
        .collect())
}

/// Parse a legacy dnsmasq `.leases` file:
/// `<expiry> <mac> <ip> <hostname> <client-id>` per line.
pub fn parse_leases_file(content: &str) -> Vec<DhcpLease> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let hostname = fields.get(3).filter(|h| **h != "*").map(|h| h.to_string());
            Some(DhcpLease {
                mac: fields[1].to_string(),
                ip: fields[2].to_string(),
                hostname,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::traits::Connector;

    const STATUS: &str = r#"[
  {
    "ip-address": "192.168.39.57",
    "mac-address": "52:54:00:aa:bb:cc",
    "hostname": "minikube",
    "client-id": "01:52:54:00:aa:bb:cc",
    "expiry-time": 1500000000
  },
  {
    "ip-address": "192.168.39.60",
    "mac-address": "52:54:00:11:22:33",
    "expiry-time": 1500000001
  }
]"#;

    #[test]
    fn test_parse_status_file() {
        let leases = parse_status_file(STATUS).unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].ip, "192.168.39.57");
        assert_eq!(leases[0].hostname.as_deref(), Some("minikube"));
        assert_eq!(leases[1].hostname, None);
    }

    #[test]
    fn test_parse_empty_status_file() {
        assert!(parse_status_file("").unwrap().is_empty());
        assert!(parse_status_file("[]").unwrap().is_empty());
        assert!(parse_status_file("{not json").is_err());
    }

    #[test]
    fn test_parse_leases_file() {
        let content = "1500000000 52:54:00:aa:bb:cc 192.168.39.57 minikube 01:52:54:00:aa:bb:cc\n\
                       1500000001 52:54:00:11:22:33 192.168.39.60 * *\n\
                       garbage\n";
        let leases = parse_leases_file(content);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(leases[0].hostname.as_deref(), Some("minikube"));
        assert_eq!(leases[1].ip, "192.168.39.60");
        assert_eq!(leases[1].hostname, None);
    }

    #[test]
    fn test_read_bridge_leases_by_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("virbr1.status"), STATUS).unwrap();
        std::fs::write(
            dir.path().join("virbr1.leases"),
            "1 52:54:00:de:ad:01 10.0.0.9 old *\n",
        )
        .unwrap();

        let modern = read_bridge_leases(dir.path(), "virbr1", 4_000_000).unwrap();
        assert_eq!(modern.len(), 2);

        let legacy = read_bridge_leases(dir.path(), "virbr1", 1_002_005).unwrap();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].ip, "10.0.0.9");

        let missing = read_bridge_leases(dir.path(), "virbr9", 4_000_000).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_lookup_ip_matches_mac_case_insensitively() {
        let mock = MockConnector::new();
        mock.add_network("minikube-net", true);
        mock.set_lease("minikube-net", "52:54:00:AA:BB:CC", "192.168.39.57");

        let conn = mock.connect().unwrap();
        let ip = lookup_ip(conn.as_ref(), "minikube-net", "52:54:00:aa:bb:cc").unwrap();
        assert_eq!(ip.as_deref(), Some("192.168.39.57"));

        let none = lookup_ip(conn.as_ref(), "minikube-net", "52:54:00:00:00:01").unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn test_lookup_ip_missing_network() {
        let mock = MockConnector::new();
        let conn = mock.connect().unwrap();
        let err = lookup_ip(conn.as_ref(), "minikube-net", "52:54:00:aa:bb:cc").unwrap_err();
        assert!(err.is_not_found());
    }
}
