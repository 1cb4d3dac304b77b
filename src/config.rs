use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Crate configuration. Every field has a platform-aware default so the UI
/// layer can run with no config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path (or bare command name resolved via PATH) of the VBoxManage binary.
    pub vboxmanage_path: PathBuf,
    /// VirtualBox's global XML configuration file. Read and conditionally
    /// rewritten by the duplicate-disk repair.
    pub virtualbox_config_path: PathBuf,
    /// Directory holding the exam server's disk image.
    pub data_dir: PathBuf,
    /// Host directory exported to the guest as the `media_usb1` shared folder.
    pub share_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            vboxmanage_path: default_vboxmanage_path(),
            virtualbox_config_path: default_virtualbox_config_path(&home),
            data_dir: home.join("exambox"),
            share_dir: home.join("exam-share"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.vboxmanage_path.as_os_str().is_empty(),
            "vboxmanage_path must not be empty"
        );
        anyhow::ensure!(
            !self.virtualbox_config_path.as_os_str().is_empty(),
            "virtualbox_config_path must not be empty"
        );
        anyhow::ensure!(
            self.data_dir != self.share_dir,
            "data_dir and share_dir must be different directories"
        );
        Ok(())
    }

    /// Full path of the exam server's primary disk image.
    pub fn disk_image_path(&self) -> PathBuf {
        self.data_dir.join("exambox-disk.vdi")
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_vboxmanage_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        PathBuf::from(r"C:\Program Files\Oracle\VirtualBox\VBoxManage.exe")
    } else {
        // Resolved via PATH.
        PathBuf::from("VBoxManage")
    }
}

fn default_virtualbox_config_path(home: &Path) -> PathBuf {
    if cfg!(target_os = "windows") {
        home.join(".VirtualBox").join("VirtualBox.xml")
    } else if cfg!(target_os = "macos") {
        home.join("Library").join("VirtualBox").join("VirtualBox.xml")
    } else {
        home.join(".config").join("VirtualBox").join("VirtualBox.xml")
    }
}
