//! Low-level VBoxManage control plane: serialized invocation of the binary,
//! TTL caching of its slow responses, regex extraction of typed facts from
//! its output, and self-healing of the duplicate-hard-disk configuration
//! corruption.

pub mod cache;
pub mod invoker;
pub mod parse;
pub mod repair;

pub use cache::{ResponseCache, FACT_TTL, STATE_TTL};
pub use invoker::VBoxManage;
pub use repair::RepairStranded;
