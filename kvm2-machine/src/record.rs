//! Persisted machine records.
//!
//! Each invocation runs one operation, so the machine record (and with it
//! the generated MAC) is kept as JSON in the machine directory between
//! runs.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, info};

use kvm2_driver::Machine;

use crate::config::Config;

/// Name of the record file inside the machine directory.
pub const RECORD_FILE: &str = "config.json";

fn record_path(config: &Config) -> PathBuf {
    config
        .store_path
        .join("machines")
        .join(&config.machine_name)
        .join(RECORD_FILE)
}

/// Load the saved record, or build a fresh one from configuration.
pub fn load_or_new(config: &Config) -> Result<Machine> {
    let path = record_path(config);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            debug!(path = %path.display(), "Loaded machine record");
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse machine record: {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No machine record, using configuration");
            Ok(Machine::new(
                config.machine_name.clone(),
                config.store_path.clone(),
                &config.driver,
            ))
        }
        Err(e) => Err(e)
            .with_context(|| format!("Failed to read machine record: {}", path.display())),
    }
}

/// Write the record into the machine directory.
pub fn save(machine: &Machine) -> Result<()> {
    let dir = machine.machine_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create machine directory: {}", dir.display()))?;

    let path = machine.resolve_store_path(RECORD_FILE);
    let content = serde_json::to_string_pretty(machine)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write machine record: {}", path.display()))?;
    debug!(path = %path.display(), "Saved machine record");
    Ok(())
}

/// Delete the record. A missing record is fine.
pub fn forget(machine: &Machine) -> Result<()> {
    let path = machine.resolve_store_path(RECORD_FILE);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            info!(path = %path.display(), "Removed machine record");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)
            .with_context(|| format!("Failed to remove machine record: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(store: &std::path::Path) -> Config {
        Config {
            store_path: store.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn test_fresh_record_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let machine = load_or_new(&config(dir.path())).unwrap();
        assert_eq!(machine.name, "minikube");
        assert!(machine.mac.is_empty());
    }

    #[test]
    fn test_saved_record_keeps_mac() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut machine = load_or_new(&config).unwrap();
        let mac = machine.ensure_mac().to_string();
        save(&machine).unwrap();

        let reloaded = load_or_new(&config).unwrap();
        assert_eq!(reloaded.mac, mac);

        forget(&reloaded).unwrap();
        forget(&reloaded).unwrap();
        assert!(load_or_new(&config).unwrap().mac.is_empty());
    }
    #[test]
    fn test_observed_ip_stays_out_of_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let mut machine = load_or_new(&config).unwrap();
        machine.ip_address = Some("192.168.39.23".to_string());
        save(&machine).unwrap();

        let content = std::fs::read_to_string(machine.resolve_store_path(RECORD_FILE)).unwrap();
        assert!(!content.contains("ip_address"));
        assert!(!content.contains("192.168.39.23"));
        assert_eq!(load_or_new(&config).unwrap().ip_address, None);
    }
}
