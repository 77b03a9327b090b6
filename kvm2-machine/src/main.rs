//! # kvm2-machine
//!
//! Operator CLI for the kvm2 driver. Each invocation loads the machine
//! record, runs one lifecycle operation against libvirt and saves the
//! record again.
//!
//! ## Usage
//! ```bash
//! kvm2-machine --kvm-boot2docker-url file:///tmp/boot2docker.iso create
//! kvm2-machine ip
//! kvm2-machine remove
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use kvm2_common::LogFormat;
use kvm2_driver::{Connector, Driver, ImageProvisioner, KvmDriver, TcpSshProbe};

mod cli;
mod config;
mod record;

use cli::{Args, Command};
use config::Config;

#[cfg(feature = "libvirt")]
fn connector(config: &Config) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(kvm2_driver::LibvirtConnector::new(
        config.driver.libvirt_uri.clone(),
    )))
}

#[cfg(not(feature = "libvirt"))]
fn connector(_config: &Config) -> Result<Arc<dyn Connector>> {
    anyhow::bail!("kvm2-machine was built without the libvirt feature")
}

async fn run(driver: &mut KvmDriver, command: Command) -> Result<()> {
    match command {
        Command::Create => driver.create().await?,
        Command::Start => driver.start().await?,
        Command::Stop => driver.stop().await?,
        Command::Restart => driver.restart().await?,
        Command::Kill => driver.kill().await?,
        Command::Remove => driver.remove().await?,
        Command::Status => println!("{}", driver.state().await?),
        Command::Ip => println!("{}", driver.ip().await?.unwrap_or_default()),
        Command::Url => println!("{}", driver.url().await?.unwrap_or_default()),
        Command::Check => {
            let version = driver.pre_command_check().await?;
            println!("libvirt {}", version);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let format = if args.log_json { LogFormat::Json } else { LogFormat::Text };
    kvm2_common::init(&args.log_level, format)?;

    let config = Config::from_args(&args)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        machine = %config.machine_name,
        store = %config.store_path.display(),
        uri = %config.driver.libvirt_uri,
        "kvm2-machine configured"
    );

    let machine = record::load_or_new(&config)?;
    let mut driver = KvmDriver::new(
        machine,
        connector(&config)?,
        Arc::new(ImageProvisioner::new()?),
        Arc::new(TcpSshProbe::new()),
    );

    let result = run(&mut driver, args.command).await;
    if let Err(ref e) = result {
        error!(error = %e, command = ?args.command, "Command failed");
    }

    // Save even on failure: a partial Create still generated the MAC
    let machine = driver.into_machine();
    if args.command == Command::Remove {
        if result.is_ok() {
            record::forget(&machine)?;
        }
    } else if args.command.mutates_record() && machine.machine_dir().exists() {
        record::save(&machine)?;
    }

    result
}
