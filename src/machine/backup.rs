use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone};
use tracing::info;

use crate::machine::Machine;

/// VBoxManage has been observed to exit 0 on a partially failed clone, so
/// success is judged by this output phrase, not by the exit code.
const CLONE_CREATED_MARKER: &str = "Clone medium created in format 'VMDK'";

impl Machine {
    /// Clone the VM's disk to `destination` as a free-standing portable
    /// VMDK image, the backup format.
    ///
    /// The clone is only trusted if VBoxManage's output confirms it, and the
    /// image is then detached from the media registry so the file is no
    /// longer locked by VirtualBox. A detach failure after a good clone
    /// still fails the backup: a registry-locked file is not a finished
    /// backup. The detach is skipped entirely when the clone did not verify.
    pub async fn write_disk_clone(&self, destination: &Path) -> Result<()> {
        if destination.exists() {
            bail!("backup file {} already exists", destination.display());
        }

        let disk_uuid = self.disk_uuid().await;
        if disk_uuid.is_empty() {
            bail!("could not resolve the disk UUID of the exam server VM");
        }

        let dest = destination.to_string_lossy();
        info!(disk_uuid = %disk_uuid, destination = %dest, "writing disk backup");

        let output = self
            .vbox
            .invoke(&["clonemedium", disk_uuid.as_str(), dest.as_ref(), "--format", "VMDK"])
            .await
            .with_context(|| format!("cloning disk {disk_uuid} to {dest}"))?;

        if !output.contains(CLONE_CREATED_MARKER) {
            bail!(
                "clone of disk {disk_uuid} to {dest} did not complete: {}",
                output.trim()
            );
        }

        self.vbox
            .invoke(&["closemedium", dest.as_ref()])
            .await
            .with_context(|| format!("detaching backup image {dest} from the media registry"))?;

        Ok(())
    }
}

/// File name for a backup written at `timestamp`, e.g.
/// `2026-08-08_13-05-09.vmdk`.
pub fn backup_file_name<Tz: TimeZone>(timestamp: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    timestamp.format("%Y-%m-%d_%H-%M-%S.vmdk").to_string()
}
