//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// kvm2-machine - run a container-host VM on KVM
#[derive(Parser, Debug)]
#[command(name = "kvm2-machine")]
#[command(about = "kvm2-machine - manage a container-host VM on KVM via libvirt")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not given)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Machine name, also used as the libvirt domain name
    #[arg(long)]
    pub machine_name: Option<String>,

    /// Root of the state directory
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Size of memory for host in MB
    #[arg(long)]
    pub kvm_memory: Option<u64>,

    /// Size of disk for host in MB
    #[arg(long)]
    pub kvm_disk_size: Option<u64>,

    /// Number of CPUs
    #[arg(long)]
    pub kvm_cpu_count: Option<u32>,

    /// Name of the public network to attach to
    #[arg(long)]
    pub kvm_network: Option<String>,

    /// The URL of the boot2docker image
    #[arg(long, env = "KVM_BOOT2DOCKER_URL")]
    pub kvm_boot2docker_url: Option<String>,

    /// Disk cache mode (default, none, writethrough, writeback, directsync, unsafe)
    #[arg(long)]
    pub kvm_cache_mode: Option<String>,

    /// Disk IO mode (threads, native)
    #[arg(long)]
    pub kvm_io_mode: Option<String>,

    /// SSH username
    #[arg(long, env = "KVM_SSH_USER")]
    pub kvm_ssh_user: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Lifecycle operation to run.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Define networks, disk and domain, then boot the machine
    Create,
    /// Boot a defined machine and wait for its IP and SSH
    Start,
    /// Gracefully shut the machine down
    Stop,
    /// Stop then start
    Restart,
    /// Force the machine off
    Kill,
    /// Tear down the domain and private network
    Remove,
    /// Print the machine state
    Status,
    /// Print the machine's private IP
    Ip,
    /// Print the container engine URL
    Url,
    /// Check that libvirt is reachable
    Check,
}

impl Command {
    /// Whether the command can change the persisted machine record.
    pub fn mutates_record(&self) -> bool {
        matches!(
            self,
            Command::Create | Command::Start | Command::Stop | Command::Restart | Command::Kill
        )
    }
}
