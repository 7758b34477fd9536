//! Runtime environment detection and host path translation.
//!
//! When the agent runs inside a container, the host filesystem is expected to be mounted under a
//! prefix (e.g. `/logtail_host`). Every host path reported by a container runtime (log files,
//! hosts files, `/proc/<pid>`) has to be translated through that prefix before it is opened.
mod checks;
mod detect;
mod error;
mod host;

pub use detect::{RuntimeEnvironment, detect_runtime_environment};
pub use error::{Error, Result};
pub use host::{DEFAULT_MOUNT_PATH, HostPaths};
