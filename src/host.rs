use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};
use tracing::debug;

/// Host facts captured once at construction time and threaded through the
/// machine facade. Keeping them in a plain struct lets tests supply fixed
/// values instead of probing the machine the tests run on.
#[derive(Debug, Clone, Copy)]
pub struct HostFacts {
    /// Number of logical CPU cores.
    pub cpu_cores: u64,
    /// Total RAM in megabytes.
    pub memory_mb: u64,
}

impl HostFacts {
    /// Probe the local machine.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_cores = sys.cpus().len() as u64;
        let memory_mb = sys.total_memory() / (1024 * 1024);
        debug!(cpu_cores, memory_mb, "detected host facts");

        Self { cpu_cores, memory_mb }
    }
}

/// CPU count for the exam server VM: leave one core to the host, but give
/// the guest at least two.
pub fn box_cpus(host_cores: u64) -> u64 {
    host_cores.saturating_sub(1).max(2)
}

/// Memory for the exam server VM: 74 % of host RAM. The caller refuses
/// creation below its minimum threshold; this only computes the share.
pub fn box_memory_mb(host_memory_mb: u64) -> u64 {
    host_memory_mb * 74 / 100
}

/// A directory's filesystem has less free space than required.
#[derive(Debug, thiserror::Error)]
#[error("path {} has only {} bytes free (limit {})", .path.display(), .free, .limit)]
pub struct LowDiskSpace {
    pub path: PathBuf,
    pub free: u64,
    pub limit: u64,
}

/// Check that every listed directory has at least `limit` bytes free on its
/// filesystem. Paths whose mount point cannot be resolved are skipped with a
/// debug log, matching the query philosophy elsewhere: missing facts are not
/// fatal.
pub fn check_free_disk(limit: u64, paths: &[&Path]) -> Result<(), LowDiskSpace> {
    let disks = Disks::new_with_refreshed_list();

    for path in paths {
        match free_space_for(&disks, path) {
            Some(free) => {
                debug!(path = %path.display(), free, "free disk space");
                if free < limit {
                    return Err(LowDiskSpace {
                        path: path.to_path_buf(),
                        free,
                        limit,
                    });
                }
            }
            None => debug!(path = %path.display(), "no mounted filesystem found for path"),
        }
    }

    Ok(())
}

/// Free bytes on the filesystem holding `path`: the disk with the longest
/// mount point that is a prefix of the path.
fn free_space_for(disks: &Disks, path: &Path) -> Option<u64> {
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
