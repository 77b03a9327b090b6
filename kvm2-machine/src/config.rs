//! Configuration management for the CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use kvm2_driver::{CacheMode, DriverConfig, IoMode};

use crate::cli::Args;

/// Default machine name.
pub const DEFAULT_MACHINE_NAME: &str = "minikube";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Machine (and domain) name
    pub machine_name: String,
    /// Root of the state directory
    pub store_path: PathBuf,
    /// Driver settings
    pub driver: DriverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine_name: DEFAULT_MACHINE_NAME.to_string(),
            store_path: default_store_path(),
            driver: DriverConfig::default(),
        }
    }
}

/// `$HOME/.kvm2`, or a system directory when there is no home.
fn default_store_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".kvm2"),
        None => PathBuf::from("/var/lib/kvm2"),
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Build the effective configuration: file (if any), then CLI overrides.
    pub fn from_args(args: &Args) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = base.with_cli_overrides(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if let Some(ref name) = args.machine_name {
            self.machine_name = name.clone();
        }
        if let Some(ref path) = args.store_path {
            self.store_path = path.clone();
        }

        let driver = &mut self.driver;
        if let Some(memory) = args.kvm_memory {
            driver.memory_mb = memory;
        }
        if let Some(disk) = args.kvm_disk_size {
            driver.disk_size_mb = disk;
        }
        if let Some(cpus) = args.kvm_cpu_count {
            driver.cpu_count = cpus;
        }
        if let Some(ref network) = args.kvm_network {
            driver.network = network.clone();
        }
        if let Some(ref url) = args.kvm_boot2docker_url {
            driver.boot2docker_url = url.clone();
        }
        if let Some(ref mode) = args.kvm_cache_mode {
            driver.cache_mode = mode
                .parse::<CacheMode>()
                .with_context(|| format!("invalid --kvm-cache-mode '{}'", mode))?;
        }
        if let Some(ref mode) = args.kvm_io_mode {
            driver.io_mode = mode
                .parse::<IoMode>()
                .with_context(|| format!("invalid --kvm-io-mode '{}'", mode))?;
        }
        if let Some(ref user) = args.kvm_ssh_user {
            driver.ssh_user = user.clone();
        }

        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.machine_name.is_empty() {
            anyhow::bail!("machine name is empty");
        }
        self.driver.validate().context("invalid driver configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["kvm2-machine"];
        argv.extend_from_slice(extra);
        argv.push("status");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "machine_name: dev\nstore_path: /srv/kvm2\ndriver:\n  memory_mb: 2048\n  io_mode: native\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.machine_name, "dev");
        assert_eq!(config.store_path, PathBuf::from("/srv/kvm2"));
        assert_eq!(config.driver.memory_mb, 2048);
        assert_eq!(config.driver.io_mode, IoMode::Native);
        assert_eq!(config.driver.cpu_count, 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/kvm2.yaml").is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = Config::default()
            .with_cli_overrides(&args(&[
                "--machine-name",
                "m1",
                "--store-path",
                "/tmp/store",
                "--kvm-cpu-count",
                "4",
                "--kvm-network",
                "lan",
                "--kvm-cache-mode",
                "writeback",
                "--kvm-io-mode",
                "native",
            ]))
            .unwrap();

        assert_eq!(config.machine_name, "m1");
        assert_eq!(config.store_path, PathBuf::from("/tmp/store"));
        assert_eq!(config.driver.cpu_count, 4);
        assert_eq!(config.driver.network, "lan");
        assert_eq!(config.driver.cache_mode, CacheMode::Writeback);
        assert_eq!(config.driver.io_mode, IoMode::Native);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_mode_rejected() {
        let err = Config::default()
            .with_cli_overrides(&args(&["--kvm-io-mode", "turbo"]))
            .unwrap_err();
        assert!(err.to_string().contains("--kvm-io-mode"));
    }

    #[test]
    fn test_zero_memory_rejected() {
        let config = Config::default()
            .with_cli_overrides(&args(&["--kvm-memory", "0"]))
            .unwrap();
        assert!(config.validate().is_err());
    }
}
