//! Self-healing for a known VirtualBox failure mode: after an interrupted
//! operation, `VirtualBox.xml` can carry two `<HardDisk>` registrations with
//! the same backing file but different UUIDs, and older VBoxManage releases
//! then refuse every subsequent command with an "already exists" error. The
//! repair removes the orphaned registration with a rewrite-and-swap that
//! leaves the configuration either intact or repaired, never missing.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error};

/// Suffix of the backup the original configuration is renamed to.
pub const BACKUP_SUFFIX: &str = ".examboxbackup";

/// VBoxManage keeps the configuration file open and takes about five seconds
/// after its last run to notice that the path now refers to a different
/// inode. Invoking it again inside this window reproduces the same error.
const SETTLE_AFTER_SWAP: Duration = Duration::from_millis(5500);

static DUPLICATE_DISK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"because a hard disk '[^']*' with UUID \{([0-9a-fA-F-]+)\} already exists").unwrap()
});

/// Extract the orphaned disk UUID from failed VBoxManage output. `None`
/// means the failure is not this signature and must be propagated unchanged.
pub fn detect_duplicate_disk(output: &str) -> Option<String> {
    DUPLICATE_DISK_RE
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// The double-rename failure: the live configuration was moved aside and
/// could not be moved back. The only repair failure that is surfaced to the
/// user with exact paths, because guessing at the on-disk state here would
/// risk data loss.
#[derive(Debug, thiserror::Error)]
#[error(
    "could not repair the VirtualBox configuration: {} was moved to {} and could not be restored; rename it back manually",
    .live.display(),
    .backup.display()
)]
pub struct RepairStranded {
    pub live: PathBuf,
    pub backup: PathBuf,
}

/// Rewrite-and-swap repair of the VirtualBox global configuration file.
pub struct ConfigRepair {
    config_path: PathBuf,
    settle: Duration,
}

impl ConfigRepair {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            settle: SETTLE_AFTER_SWAP,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_settle(config_path: PathBuf, settle: Duration) -> Self {
        Self { config_path, settle }
    }

    /// Remove the orphaned disk registration `uuid` from the configuration.
    ///
    /// Sequence: write a fixed copy to a `.new` sibling, rename the original
    /// to a backup, rename the fixed copy into place, then wait for
    /// VirtualBox to notice the file changed underneath it. Any failure
    /// before the final rename leaves the original untouched or restorable.
    pub async fn repair(&self, uuid: &str) -> Result<()> {
        debug!(uuid, config = %self.config_path.display(), "removing duplicate hard disk registration");

        let fixed = self.write_fixed_config(uuid)?;
        let backup = self.backup_original()?;
        self.swap_in(&fixed, &backup)?;

        debug!(settle = ?self.settle, "waiting for VirtualBox to notice the rewritten configuration");
        tokio::time::sleep(self.settle).await;

        Ok(())
    }

    /// Copy the configuration line-by-line to a `.new` sibling, omitting
    /// exactly the lines that register the offending UUID. The match is
    /// UUID-scoped so unrelated `<HardDisk>` entries are untouched.
    fn write_fixed_config(&self, uuid: &str) -> Result<PathBuf> {
        let source = File::open(&self.config_path).with_context(|| {
            format!(
                "opening VirtualBox configuration {}",
                self.config_path.display()
            )
        })?;

        let fixed_path = sibling_with_suffix(&self.config_path, ".new");
        let fixed_file = File::create(&fixed_path)
            .with_context(|| format!("creating {}", fixed_path.display()))?;

        let duplicate_marker = format!("<HardDisk uuid=\"{{{uuid}}}\"");
        let mut writer = BufWriter::new(fixed_file);
        for line in BufReader::new(source).lines() {
            let line = line.with_context(|| format!("reading {}", self.config_path.display()))?;
            if line.contains(&duplicate_marker) {
                debug!(line = %line.trim(), "dropping duplicate hard disk line");
                continue;
            }
            writeln!(writer, "{line}").with_context(|| format!("writing {}", fixed_path.display()))?;
        }
        writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|f| f.sync_all())
            .with_context(|| format!("flushing {}", fixed_path.display()))?;

        Ok(fixed_path)
    }

    /// Move the original configuration aside. Failing here fails the whole
    /// repair: proceeding without a backup would risk data loss.
    fn backup_original(&self) -> Result<PathBuf> {
        let backup_path = sibling_with_suffix(&self.config_path, BACKUP_SUFFIX);
        fs::rename(&self.config_path, &backup_path).with_context(|| {
            format!(
                "backing up {} to {}",
                self.config_path.display(),
                backup_path.display()
            )
        })?;
        Ok(backup_path)
    }

    /// Rename the fixed copy into place. On failure, try to restore the
    /// backup; if that also fails the on-disk state is ambiguous and the
    /// typed [`RepairStranded`] error names both paths for manual recovery.
    fn swap_in(&self, fixed: &Path, backup: &Path) -> Result<()> {
        if let Err(swap_err) = fs::rename(fixed, &self.config_path) {
            error!(
                error = %swap_err,
                fixed = %fixed.display(),
                live = %self.config_path.display(),
                "failed to move fixed configuration into place, restoring backup"
            );

            if let Err(restore_err) = fs::rename(backup, &self.config_path) {
                error!(error = %restore_err, "restoring the configuration backup also failed");
                return Err(RepairStranded {
                    live: self.config_path.clone(),
                    backup: backup.to_path_buf(),
                }
                .into());
            }

            return Err(swap_err).with_context(|| {
                format!(
                    "replacing {} with the rewritten configuration",
                    self.config_path.display()
                )
            });
        }

        Ok(())
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
