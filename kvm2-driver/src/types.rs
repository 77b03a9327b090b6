//! Machine model and driver configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DriverError, Result};

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default libvirt connection URI.
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";
/// Name of the private network shared by every machine of an installation.
pub const DEFAULT_PRIVATE_NETWORK: &str = "minikube-net";
/// Named public network the guest also attaches to.
pub const DEFAULT_NETWORK: &str = "default";
/// Default SSH user on the guest.
pub const DEFAULT_SSH_USER: &str = "docker";
/// Default SSH port on the guest.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// File name of the boot ISO inside the machine directory.
pub const ISO_FILENAME: &str = "boot2docker.iso";

// =============================================================================
// DISK MODES
// =============================================================================

/// Disk caching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Default,
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Default => "default",
            CacheMode::None => "none",
            CacheMode::Writethrough => "writethrough",
            CacheMode::Writeback => "writeback",
            CacheMode::Directsync => "directsync",
            CacheMode::Unsafe => "unsafe",
        }
    }
}

impl FromStr for CacheMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(CacheMode::Default),
            "none" => Ok(CacheMode::None),
            "writethrough" => Ok(CacheMode::Writethrough),
            "writeback" => Ok(CacheMode::Writeback),
            "directsync" => Ok(CacheMode::Directsync),
            "unsafe" => Ok(CacheMode::Unsafe),
            other => Err(DriverError::InvalidConfig(format!(
                "unknown disk cache mode '{}' (expected default, none, writethrough, \
                 writeback, directsync or unsafe)",
                other
            ))),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk IO mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    #[default]
    Threads,
    Native,
}

impl IoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoMode::Threads => "threads",
            IoMode::Native => "native",
        }
    }
}

impl FromStr for IoMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "threads" => Ok(IoMode::Threads),
            "native" => Ok(IoMode::Native),
            other => Err(DriverError::InvalidConfig(format!(
                "unknown disk IO mode '{}' (expected threads or native)",
                other
            ))),
        }
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// DRIVER CONFIGURATION
// =============================================================================

/// User-facing driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Memory in MB
    pub memory_mb: u64,
    /// Disk size in MB
    pub disk_size_mb: u64,
    /// Number of vCPUs
    pub cpu_count: u32,
    /// Name of the public network to attach to
    pub network: String,
    /// Boot ISO source (URL or local path). Empty means the ISO must
    /// already be present in the machine directory.
    pub boot2docker_url: String,
    /// Disk cache mode
    pub cache_mode: CacheMode,
    /// Disk IO mode
    pub io_mode: IoMode,
    /// SSH username
    pub ssh_user: String,
    /// SSH port
    pub ssh_port: u16,
    /// Libvirt connection URI
    pub libvirt_uri: String,
    /// Name of the private network
    pub private_network: String,
    /// Base address of the private /24
    pub private_subnet: Ipv4Addr,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            disk_size_mb: 20000,
            cpu_count: 1,
            network: DEFAULT_NETWORK.to_string(),
            boot2docker_url: String::new(),
            cache_mode: CacheMode::Default,
            io_mode: IoMode::Threads,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            private_network: DEFAULT_PRIVATE_NETWORK.to_string(),
            private_subnet: Ipv4Addr::new(192, 168, 39, 0),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| {
            DriverError::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.memory_mb == 0 {
            return Err(DriverError::InvalidConfig("memory must be positive".into()));
        }
        if self.cpu_count == 0 {
            return Err(DriverError::InvalidConfig("cpu count must be positive".into()));
        }
        if self.disk_size_mb == 0 {
            return Err(DriverError::InvalidConfig("disk size must be positive".into()));
        }
        if self.network.is_empty() {
            return Err(DriverError::InvalidConfig("network name is empty".into()));
        }
        if self.private_network.is_empty() {
            return Err(DriverError::InvalidConfig("private network name is empty".into()));
        }
        if self.network == self.private_network {
            return Err(DriverError::InvalidConfig(format!(
                "public and private network are both '{}'",
                self.network
            )));
        }
        if self.private_subnet.octets()[3] != 0 {
            return Err(DriverError::InvalidConfig(format!(
                "private subnet {} is not a /24 base address",
                self.private_subnet
            )));
        }
        Ok(())
    }
}

// =============================================================================
// MACHINE
// =============================================================================

/// A single guest VM managed by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Machine name, also the libvirt domain name
    pub name: String,
    /// Root of the provisioning tool's state directory
    pub store_path: PathBuf,
    /// Memory in MB
    pub memory_mb: u64,
    /// Number of vCPUs
    pub cpu_count: u32,
    /// Disk size in MB
    pub disk_size_mb: u64,
    /// Path of the raw disk image
    pub disk_path: PathBuf,
    /// Path of the boot ISO
    pub iso_path: PathBuf,
    /// Boot ISO source (URL or local path)
    pub boot2docker_url: String,
    /// MAC on the private network; generated on first use
    pub mac: String,
    /// Last IP observed; never authoritative, so not persisted
    #[serde(skip)]
    pub ip_address: Option<String>,
    /// SSH username
    pub ssh_user: String,
    /// SSH port
    pub ssh_port: u16,
    /// Public network name
    pub network: String,
    /// Private network name
    pub private_network: String,
    /// Base address of the private /24
    pub private_subnet: Ipv4Addr,
    /// Disk cache mode
    pub cache_mode: CacheMode,
    /// Disk IO mode
    pub io_mode: IoMode,
}

impl Machine {
    /// Build a machine record from driver configuration.
    pub fn new(
        name: impl Into<String>,
        store_path: impl Into<PathBuf>,
        config: &DriverConfig,
    ) -> Self {
        let mut machine = Self {
            name: name.into(),
            store_path: store_path.into(),
            memory_mb: config.memory_mb,
            cpu_count: config.cpu_count,
            disk_size_mb: config.disk_size_mb,
            disk_path: PathBuf::new(),
            iso_path: PathBuf::new(),
            boot2docker_url: config.boot2docker_url.clone(),
            mac: String::new(),
            ip_address: None,
            ssh_user: config.ssh_user.clone(),
            ssh_port: config.ssh_port,
            network: config.network.clone(),
            private_network: config.private_network.clone(),
            private_subnet: config.private_subnet,
            cache_mode: config.cache_mode,
            io_mode: config.io_mode,
        };
        machine.disk_path = machine.resolve_store_path(format!("{}.img", machine.name));
        machine.iso_path = machine.resolve_store_path(ISO_FILENAME);
        machine
    }

    /// Directory holding this machine's files.
    pub fn machine_dir(&self) -> PathBuf {
        self.store_path.join("machines").join(&self.name)
    }

    /// Resolve a file name inside the machine directory.
    pub fn resolve_store_path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.machine_dir().join(file)
    }

    /// Return the MAC, generating one the first time.
    pub fn ensure_mac(&mut self) -> &str {
        if self.mac.is_empty() {
            self.mac = generate_mac_address();
        }
        &self.mac
    }

    /// Validate the resource settings.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DriverError::InvalidConfig("machine name is empty".into()));
        }
        if self.memory_mb == 0 || self.cpu_count == 0 || self.disk_size_mb == 0 {
            return Err(DriverError::InvalidConfig(format!(
                "machine {}: memory, cpu and disk size must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Generate a random MAC address in the locally administered range.
pub fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0] & 0x3f,
        bytes[1],
        bytes[2]
    )
}
