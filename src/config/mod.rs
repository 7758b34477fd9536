//! Configuration of the discovery core and of the stdout pipelines.
//!
//! Discovery settings are read once from the environment; pipeline settings are deserialized from
//! a JSON document with `PascalCase` keys.
mod discovery;
mod error;
mod stdout;

pub use discovery::DiscoveryConfig;
pub use error::{Error, Result};
pub use stdout::{PipelineConfig, StdoutConfig, load_pipelines};
