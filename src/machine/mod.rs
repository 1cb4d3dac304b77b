//! The managed box: the single exam server VM and the operations the UI
//! layer performs on it. Queries are derived on demand from VBoxManage
//! output and never fail: a box in a transient bad state must not take the
//! UI down with it. Mutating operations return real errors.

mod backup;
mod create;

pub use backup::backup_file_name;
pub use create::{CreateError, DISK_SIZE_MB, MIN_BOX_MEMORY_MB};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use semver::Version;
use tracing::{debug, warn};

use crate::config::Config;
use crate::host::HostFacts;
use crate::vbox::cache::{FACT_TTL, STATE_TTL};
use crate::vbox::invoker::CommandRunner;
use crate::vbox::{parse, VBoxManage};

/// Name of the one VM this process manages. Every VBoxManage command is
/// addressed to it.
pub const BOX_NAME: &str = "ExamboxServer";

/// Snapshot taken right after creation completes. Restoring it is how
/// "remove exam data" works.
pub const BOX_SNAPSHOT_NAME: &str = "Installed";

/// Shared-folder name the guest expects to find its transfer directory under.
pub(crate) const SHARED_FOLDER_NAME: &str = "media_usb1";

pub(crate) const STORAGE_CONTROLLER_NAME: &str = "SATA Controller";

/// Facade over the VBoxManage control plane for the single managed VM.
pub struct Machine {
    vbox: Arc<VBoxManage>,
    config: Config,
    host: HostFacts,
}

impl Machine {
    /// Construct against the real system: probes host facts and invokes the
    /// configured VBoxManage binary.
    pub fn new(config: Config) -> Self {
        let vbox = Arc::new(VBoxManage::new(&config));
        Self {
            vbox,
            config,
            host: HostFacts::detect(),
        }
    }

    /// Construct with an injected runner and fixed host facts.
    pub fn with_runner(config: Config, host: HostFacts, runner: Arc<dyn CommandRunner>) -> Self {
        let vbox = Arc::new(VBoxManage::with_runner(&config, runner));
        Self { vbox, config, host }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the exam server VM is registered with VirtualBox. Asks the
    /// hypervisor every time; "we created it once" is not ground truth.
    pub async fn installed(&self) -> bool {
        match self.vbox.invoke(&["list", "vms"]).await {
            Ok(output) => parse::vm_list_contains(&output, BOX_NAME),
            Err(err) => {
                debug!(error = %err, "could not list VMs");
                false
            }
        }
    }

    /// Whether the exam server VM is currently running.
    pub async fn running(&self) -> bool {
        self.vm_state().await == "running"
    }

    /// UUID of the VM's primary disk image; empty when unavailable.
    pub async fn disk_uuid(&self) -> String {
        parse::disk_uuid(&self.vm_info().await)
    }

    /// Full path of the VM's primary disk image; empty when unavailable.
    pub async fn disk_location(&self) -> String {
        parse::disk_location(&self.vm_info().await)
    }

    /// The VM's log directory; empty when unavailable.
    pub async fn log_dir(&self) -> String {
        parse::log_dir(&self.vm_info().await)
    }

    /// A guest property value; empty when unset or unavailable. The
    /// extracted value is cached under the property name.
    pub async fn guest_property(&self, name: &str) -> String {
        if let Some(cached) = self.vbox.cache().get(name).await {
            return cached;
        }

        let output = match self
            .vbox
            .invoke(&["guestproperty", "get", BOX_NAME, name])
            .await
        {
            Ok(output) => output,
            Err(err) => {
                debug!(property = name, error = %err, "could not get guest property");
                return String::new();
            }
        };

        let value = parse::guest_property_value(&output);
        self.vbox.cache().set(name, &value, FACT_TTL).await;
        value
    }

    /// The `boxType` tag set at creation time (display/filtering only).
    pub async fn box_type(&self) -> String {
        self.guest_property("boxType").await
    }

    /// The `boxVersion` tag set at creation time.
    pub async fn box_version(&self) -> String {
        self.guest_property("boxVersion").await
    }

    /// Size of a disk image on the host filesystem in megabytes, the
    /// expected size of a backup of it. 0 when unavailable.
    pub async fn medium_size_on_disk(&self, location: &str) -> u64 {
        // showmediuminfo is documented to also accept a medium UUID, but in
        // practice only the path form works reliably.
        let output = match self.vbox.invoke(&["showmediuminfo", location]).await {
            Ok(output) => output,
            Err(err) => {
                debug!(location, error = %err, "could not get medium info");
                return 0;
            }
        };

        match parse::medium_size_mb(&output) {
            Some(megabytes) => megabytes,
            None => {
                warn!(location, "no size-on-disk line in medium info");
                0
            }
        }
    }

    /// VirtualBox's default machine folder, from `list systemproperties`.
    pub async fn default_machine_folder(&self) -> Option<PathBuf> {
        let output = match self.vbox.invoke(&["list", "systemproperties"]).await {
            Ok(output) => output,
            Err(err) => {
                debug!(error = %err, "could not list system properties");
                return None;
            }
        };
        parse::default_machine_folder(&output).map(PathBuf::from)
    }

    /// The VBoxManage version; `0.0.0` when it cannot be determined.
    pub async fn hypervisor_version(&self) -> Version {
        self.vbox.version().await
    }

    /// Whether the VBoxManage binary is present and responding.
    pub async fn hypervisor_available(&self) -> bool {
        self.vbox.available().await
    }

    /// Configure the bridged network adapter and power the VM on with a
    /// graphical console. The NIC configuration is reissued on every start
    /// so a changed bridge device or adapter type takes effect.
    pub async fn start(&self, nic_type: &str, bridge_device: &str) -> Result<()> {
        self.sweep_stale_vm_dirs().await;

        let commands = start_commands(nic_type, bridge_device);
        self.vbox
            .run_commands(&commands)
            .await
            .context("starting the exam server VM")?;
        self.vbox.cache().reset().await;
        Ok(())
    }

    /// Revert the VM to the post-install snapshot. This is how exam data is
    /// removed; it does not delete the VM.
    pub async fn restore_snapshot(&self) -> Result<()> {
        self.vbox
            .invoke(&["snapshot", BOX_NAME, "restore", BOX_SNAPSHOT_NAME])
            .await
            .context("restoring the post-install snapshot")?;
        self.vbox.cache().reset().await;
        Ok(())
    }

    /// Remove leftover VM directories under the default machine folder that
    /// contain nothing but a single `.vbox` file, debris VirtualBox leaves
    /// behind after interrupted unregister operations. Best effort.
    pub async fn sweep_stale_vm_dirs(&self) {
        let Some(folder) = self.default_machine_folder().await else {
            debug!("no default machine folder, skipping stale VM dir sweep");
            return;
        };
        if let Err(err) = sweep_stale_vm_dirs_in(&folder) {
            debug!(folder = %folder.display(), error = %err, "stale VM dir sweep failed");
        }
    }

    /// Raw machine-readable `showvminfo` dump, cached under `"vminfo"`.
    async fn vm_info(&self) -> String {
        if let Some(cached) = self.vbox.cache().get("vminfo").await {
            return cached;
        }

        let raw = match self
            .vbox
            .invoke(&["showvminfo", "--machinereadable", BOX_NAME])
            .await
        {
            Ok(output) => output,
            Err(err) => {
                debug!(error = %err, "could not get VM info");
                String::new()
            }
        };

        // The empty dump is cached too: a missing VM should not retrigger a
        // slow external query for every field the UI asks about.
        self.vbox.cache().set("vminfo", &raw, FACT_TTL).await;
        raw
    }

    /// The `VMState` value, cached briefly under `"vmstate"`. Empty when the
    /// VM is not installed or the state cannot be determined.
    async fn vm_state(&self) -> String {
        if let Some(cached) = self.vbox.cache().get("vmstate").await {
            return cached;
        }

        let raw = match self
            .vbox
            .invoke(&["showvminfo", "--machinereadable", BOX_NAME])
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if parse::is_not_installed(&format!("{err:#}")) {
                    debug!("VM state query: no VM installed");
                } else {
                    debug!(error = %err, "could not get VM state");
                }
                return String::new();
            }
        };

        let state = parse::vm_state(&raw);
        if state.is_empty() {
            debug!("no VMState field in VM info");
            return String::new();
        }

        self.vbox.cache().set("vmstate", &state, STATE_TTL).await;
        state
    }
}

pub(crate) fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn start_commands(nic_type: &str, bridge_device: &str) -> Vec<Vec<String>> {
    vec![
        command(&[
            "modifyvm",
            BOX_NAME,
            "--nic1",
            "bridged",
            "--bridgeadapter1",
            bridge_device,
            "--nictype1",
            nic_type,
        ]),
        command(&["startvm", BOX_NAME, "--type", "gui"]),
    ]
}

fn sweep_stale_vm_dirs_in(folder: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let dir = entry.path();
        let children = fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
        let [only] = children.as_slice() else {
            continue;
        };

        if only.file_type()?.is_file() && only.path().extension().is_some_and(|e| e == "vbox") {
            debug!(dir = %dir.display(), "removing stale VM directory");
            fs::remove_dir_all(&dir)?;
        }
    }
    Ok(())
}
