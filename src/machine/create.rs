use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use semver::Version;
use tracing::info;

use crate::host;
use crate::machine::{command, Machine, BOX_NAME, BOX_SNAPSHOT_NAME, SHARED_FOLDER_NAME, STORAGE_CONTROLLER_NAME};

/// Capacity the converted disk image is resized to, in megabytes.
pub const DISK_SIZE_MB: u64 = 55 * 1024;

/// The guest OS needs this much RAM to run an exam; creation is refused on
/// hosts whose 74 % share falls below it.
pub const MIN_BOX_MEMORY_MB: u64 = 4096;

/// Creation refused before any external command was issued. Distinguishable
/// from tool failure so the UI can phrase it as "fix your machine", not
/// "VirtualBox broke".
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(
        "a disk image already exists at {}; remove the current server before installing a new one",
        .0.display()
    )]
    DiskImageExists(PathBuf),
    #[error(
        "not enough memory for the exam server: {calculated} MiB available for the VM, {minimum} MiB required"
    )]
    MemoryBelowMinimum { calculated: u64, minimum: u64 },
}

/// Everything the creation command batch depends on, resolved up front.
struct CreationPlan<'a> {
    raw_image: &'a Path,
    disk_image: &'a Path,
    share_dir: &'a Path,
    cpus: u64,
    memory_mb: u64,
    box_type: &'a str,
    box_version: &'a str,
    vbox_version: &'a Version,
}

impl Machine {
    /// Create the exam server VM from a raw disk image: convert and resize
    /// the disk, register and configure the VM, tag it with its type and
    /// version, attach the shared folder and storage, and take the
    /// post-install snapshot that later serves as the restore point.
    ///
    /// The batch stops at the first failing command and surfaces that error;
    /// no rollback is attempted; the caller removes the half-created VM and
    /// retries. Preconditions are checked before anything external runs.
    pub async fn create_new(
        &self,
        box_type: &str,
        raw_image: &Path,
        box_version: &str,
    ) -> Result<()> {
        let disk_image = self.config.disk_image_path();
        if disk_image.exists() {
            return Err(CreateError::DiskImageExists(disk_image).into());
        }

        let memory_mb = host::box_memory_mb(self.host.memory_mb);
        if memory_mb < MIN_BOX_MEMORY_MB {
            return Err(CreateError::MemoryBelowMinimum {
                calculated: memory_mb,
                minimum: MIN_BOX_MEMORY_MB,
            }
            .into());
        }
        let cpus = host::box_cpus(self.host.cpu_cores);

        fs::create_dir_all(&self.config.data_dir).with_context(|| {
            format!("creating data directory {}", self.config.data_dir.display())
        })?;
        fs::create_dir_all(&self.config.share_dir).with_context(|| {
            format!("creating share directory {}", self.config.share_dir.display())
        })?;

        let vbox_version = self.vbox.version().await;
        info!(
            %vbox_version,
            cpus,
            memory_mb,
            box_type,
            box_version,
            raw_image = %raw_image.display(),
            "creating exam server VM"
        );

        let plan = CreationPlan {
            raw_image,
            disk_image: &disk_image,
            share_dir: &self.config.share_dir,
            cpus,
            memory_mb,
            box_type,
            box_version,
            vbox_version: &vbox_version,
        };
        self.vbox
            .run_commands(&creation_commands(&plan))
            .await
            .context("creating the exam server VM")?;

        self.vbox.cache().reset().await;
        Ok(())
    }
}

fn creation_commands(plan: &CreationPlan<'_>) -> Vec<Vec<String>> {
    let raw_image = plan.raw_image.to_string_lossy();
    let disk_image = plan.disk_image.to_string_lossy();
    let share_dir = plan.share_dir.to_string_lossy();

    vec![
        command(&["convertfromraw", &raw_image, &disk_image, "--format", "VDI"]),
        command(&["modifymedium", &disk_image, "--resize", &DISK_SIZE_MB.to_string()]),
        command(&["createvm", "--name", BOX_NAME, "--register"]),
        command(&[
            "modifyvm",
            BOX_NAME,
            "--cpus",
            &plan.cpus.to_string(),
            "--memory",
            &plan.memory_mb.to_string(),
            "--firmware",
            "efi",
            "--chipset",
            "ich9",
            "--acpi",
            "on",
            "--ioapic",
            "on",
        ]),
        clipboard_command(plan.vbox_version),
        command(&["guestproperty", "set", BOX_NAME, "boxType", plan.box_type]),
        command(&["guestproperty", "set", BOX_NAME, "boxVersion", plan.box_version]),
        command(&[
            "sharedfolder",
            "add",
            BOX_NAME,
            "--name",
            SHARED_FOLDER_NAME,
            "--hostpath",
            &share_dir,
        ]),
        command(&["storagectl", BOX_NAME, "--add", "sata", "--name", STORAGE_CONTROLLER_NAME]),
        command(&[
            "storageattach",
            BOX_NAME,
            "--storagectl",
            STORAGE_CONTROLLER_NAME,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "hdd",
            "--medium",
            &disk_image,
        ]),
        command(&["snapshot", BOX_NAME, "take", BOX_SNAPSHOT_NAME]),
    ]
}

/// VirtualBox 6.1 renamed `--clipboard` to `--clipboard-mode`; the two
/// spellings are mutually exclusive, so the VBoxManage version picks one.
fn clipboard_command(vbox_version: &Version) -> Vec<String> {
    if *vbox_version >= Version::new(6, 1, 0) {
        command(&["modifyvm", BOX_NAME, "--clipboard-mode", "bidirectional"])
    } else {
        command(&["modifyvm", BOX_NAME, "--clipboard", "bidirectional"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::machine::tests::{test_config, test_host};
    use crate::vbox::testing::FakeRunner;

    fn plan_fixture<'a>(vbox_version: &'a Version) -> CreationPlan<'a> {
        CreationPlan {
            raw_image: Path::new("/tmp/exam-image.raw"),
            disk_image: Path::new("/home/exam/exambox/exambox-disk.vdi"),
            share_dir: Path::new("/home/exam/exam-share"),
            cpus: 7,
            memory_mb: 12124,
            box_type: "exam/server-qa",
            box_version: "SERVER7108X v69",
            vbox_version,
        }
    }

    #[test]
    fn creation_batch_is_ordered_convert_to_snapshot() {
        let version = Version::new(6, 1, 2);
        let commands = creation_commands(&plan_fixture(&version));

        let heads: Vec<&str> = commands.iter().map(|c| c[0].as_str()).collect();
        assert_eq!(
            heads,
            [
                "convertfromraw",
                "modifymedium",
                "createvm",
                "modifyvm",
                "modifyvm",
                "guestproperty",
                "guestproperty",
                "sharedfolder",
                "storagectl",
                "storageattach",
                "snapshot",
            ]
        );

        // The snapshot taken last is the restore point.
        let snapshot = commands.last().unwrap();
        assert_eq!(snapshot[1..], [BOX_NAME, "take", BOX_SNAPSHOT_NAME].map(String::from));

        // Sizing flags land on the first modifyvm.
        let modify = &commands[3];
        assert!(modify.windows(2).any(|w| w[0] == "--cpus" && w[1] == "7"));
        assert!(modify.windows(2).any(|w| w[0] == "--memory" && w[1] == "12124"));
    }

    #[test]
    fn clipboard_flag_is_version_gated() {
        let older = clipboard_command(&Version::new(5, 2, 30));
        assert!(older.contains(&"--clipboard".to_string()));
        assert!(!older.contains(&"--clipboard-mode".to_string()));

        let newer = clipboard_command(&Version::new(6, 1, 0));
        assert!(newer.contains(&"--clipboard-mode".to_string()));

        // The zero version from a failed parse degrades to the older flag.
        let unknown = clipboard_command(&Version::new(0, 0, 0));
        assert!(unknown.contains(&"--clipboard".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn existing_disk_image_refuses_before_any_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.data_dir).unwrap();
        fs::write(config.disk_image_path(), "old disk").unwrap();

        let runner = Arc::new(FakeRunner::new(|_, _: &[String]| FakeRunner::ok("")));
        let machine = Machine::with_runner(config, test_host(), runner.clone());

        let err = machine
            .create_new("exam/server-qa", Path::new("/tmp/image.raw"), "v69")
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CreateError>(),
            Some(CreateError::DiskImageExists(_))
        ));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_memory_host_refuses_before_any_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|_, _: &[String]| FakeRunner::ok("")));
        let host = crate::host::HostFacts {
            cpu_cores: 4,
            memory_mb: 4096, // 74 % of this is well below the minimum
        };
        let machine = Machine::with_runner(test_config(dir.path()), host, runner.clone());

        let err = machine
            .create_new("exam/server-qa", Path::new("/tmp/image.raw"), "v69")
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CreateError>(),
            Some(CreateError::MemoryBelowMinimum { .. })
        ));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_runs_batch_and_resets_cache() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|_, args: &[String]| {
            match args.first().map(String::as_str) {
                Some("--version") => FakeRunner::ok("6.1.2r135662\n"),
                Some("showvminfo") => FakeRunner::ok("VMState=\"poweroff\"\n"),
                _ => FakeRunner::ok(""),
            }
        }));
        let machine = Machine::with_runner(test_config(dir.path()), test_host(), runner.clone());

        // Prime the vminfo cache, then create; the stale entry must not survive.
        machine.disk_uuid().await;
        machine
            .create_new("exam/server-qa", Path::new("/tmp/image.raw"), "v69")
            .await
            .unwrap();
        machine.disk_uuid().await;
        assert_eq!(runner.count_of("showvminfo"), 2);

        // 6.1+ host got the renamed clipboard flag.
        let clipboard: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.contains(&"--clipboard-mode".to_string()))
            .collect();
        assert_eq!(clipboard.len(), 1);

        assert_eq!(runner.count_of("snapshot"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_batch_failure_stops_and_surfaces_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|_, args: &[String]| {
            match args.first().map(String::as_str) {
                Some("--version") => FakeRunner::ok("6.1.2\n"),
                Some("createvm") => FakeRunner::fail("VBoxManage: error: machine exists"),
                _ => FakeRunner::ok(""),
            }
        }));
        let machine = Machine::with_runner(test_config(dir.path()), test_host(), runner.clone());

        let err = machine
            .create_new("exam/server-qa", Path::new("/tmp/image.raw"), "v69")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("machine exists"));

        // Nothing after the failing createvm ran.
        assert_eq!(runner.count_of("modifyvm"), 0);
        assert_eq!(runner.count_of("snapshot"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_duplicate_disk_signature_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::write(
            &config.virtualbox_config_path,
            "<VirtualBox>\n  <HardDisk uuid=\"{ABCD-1234}\" location=\"/x/y.vdi\"/>\n</VirtualBox>\n",
        )
        .unwrap();

        let runner = Arc::new(FakeRunner::new(|_, args: &[String]| {
            match args.first().map(String::as_str) {
                Some("--version") => FakeRunner::ok("6.1.2\n"),
                Some("createvm") => FakeRunner::fail(
                    "because a hard disk '/x/y.vdi' with UUID {ABCD-1234} already exists",
                ),
                _ => FakeRunner::ok(""),
            }
        }));
        let machine = Machine::with_runner(config.clone(), test_host(), runner.clone());

        let err = machine
            .create_new("exam/server-qa", Path::new("/tmp/image.raw"), "v69")
            .await
            .unwrap_err();

        // Repair ran once and rewrote the configuration...
        let live = fs::read_to_string(&config.virtualbox_config_path).unwrap();
        assert!(!live.contains("{ABCD-1234}"));

        // ...the failed command was reissued exactly once...
        assert_eq!(runner.count_of("createvm"), 2);

        // ...and the second occurrence became a hard error instead of a loop.
        assert!(format!("{err:#}").contains("after duplicate hard disk repair"));
        assert_eq!(runner.count_of("modifyvm"), 0);
    }
}
