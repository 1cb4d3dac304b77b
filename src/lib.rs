//! Control plane for the single VirtualBox VM that runs the offline exam
//! server. Drives the `VBoxManage` binary, serializes access to it, caches
//! its slow responses, and repairs a known duplicate-disk corruption of the
//! VirtualBox configuration file. Consumed by the desktop UI layer; this
//! crate has no user-facing surface of its own.

pub mod config;
pub mod host;
pub mod machine;
pub mod vbox;

pub use config::Config;
pub use machine::{Machine, BOX_NAME, BOX_SNAPSHOT_NAME};
pub use vbox::invoker::{CommandRunner, RunOutput, SystemRunner};
pub use vbox::VBoxManage;
