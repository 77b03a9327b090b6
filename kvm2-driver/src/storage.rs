//! Machine directory and disk image management.
//!
//! The machine directory holds the boot ISO and the raw disk. libvirt's
//! qemu process runs as a different user, so every ancestor of that
//! directory must be traversable by group and others.

use async_trait::async_trait;
use futures::StreamExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::error::{DriverError, Result};
use crate::traits::DiskProvisioner;
use crate::types::Machine;

/// Group and other execute bits.
const TRAVERSE_BITS: u32 = 0o011;

/// Bytes per MB as the provisioning tool counts them.
const BYTES_PER_MB: u64 = 1_000_000;

/// Create `dir` (mode 0755) and make it and all its ancestors traversable.
///
/// Only the group/other execute bits are added; no other permission bit
/// is touched. Directories that already have them are left alone.
pub fn prepare_store_dir(dir: &Path) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .map_err(|e| {
            DriverError::Io(std::io::Error::new(
                e.kind(),
                format!("making store path directory {}: {}", dir.display(), e),
            ))
        })?;

    let dir = std::fs::canonicalize(dir)?;
    for ancestor in dir.ancestors() {
        if ancestor.parent().is_none() {
            break;
        }
        ensure_traversable(ancestor)?;
    }
    Ok(())
}

fn ensure_traversable(dir: &Path) -> Result<()> {
    let metadata = std::fs::metadata(dir)?;
    let mode = metadata.permissions().mode();
    if mode & TRAVERSE_BITS != TRAVERSE_BITS {
        debug!(
            path = %dir.display(),
            mode = format!("{:o}", mode & 0o7777),
            "Setting executable bit"
        );
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode | TRAVERSE_BITS))?;
    }
    Ok(())
}

/// Production disk provisioner.
///
/// Places the boot ISO in the machine directory (copied from a local path
/// or downloaded over HTTP) and creates a sparse raw disk that the guest
/// formats on first boot.
pub struct ImageProvisioner {
    client: reqwest::Client,
}

impl ImageProvisioner {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DriverError::DiskImage(format!("building HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    #[instrument(skip(self), fields(dest = %dest.display()))]
    async fn fetch_boot_image(&self, source: &str, dest: &Path) -> Result<()> {
        if source.is_empty() {
            if fs::try_exists(dest).await? {
                debug!("Using boot image already in place");
                return Ok(());
            }
            return Err(DriverError::DiskImage(format!(
                "no boot image source given and {} does not exist",
                dest.display()
            )));
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            return self.download(source, dest).await;
        }

        let local = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        if local == dest {
            return Ok(());
        }
        info!(source = %local.display(), "Copying boot image");
        fs::copy(&local, dest).await.map_err(|e| {
            DriverError::DiskImage(format!(
                "copying {} to {}: {}",
                local.display(),
                dest.display(),
                e
            ))
        })?;
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url = %url, "Downloading boot image");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DriverError::DiskImage(format!("downloading {}: {}", url, e)))?;

        // Write to a temporary name so an interrupted download is not
        // mistaken for a complete image.
        let partial = dest.with_extension("iso.part");
        let mut file = File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| DriverError::DiskImage(format!("downloading {}: {}", url, e)))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        fs::rename(&partial, dest).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display(), size_mb = size_mb))]
    async fn create_raw_disk(&self, path: &Path, size_mb: u64) -> Result<()> {
        if fs::try_exists(path).await? {
            info!("Disk image already exists, keeping it");
            return Ok(());
        }

        info!("Creating raw disk image");
        let file = File::create(path).await?;
        file.set_len(size_mb * BYTES_PER_MB).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl DiskProvisioner for ImageProvisioner {
    async fn make_disk_image(
        &self,
        machine: &Machine,
        boot_source: &str,
        size_mb: u64,
    ) -> Result<()> {
        if size_mb == 0 {
            return Err(DriverError::DiskImage("disk size must be positive".into()));
        }
        if let Some(parent) = machine.disk_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.fetch_boot_image(boot_source, &machine.iso_path).await?;
        self.create_raw_disk(&machine.disk_path, size_mb).await
    }
}
