//! Stdout ingestion: tails container log files, decodes their framing and groups lines into
//! logical records.
//!
//! A [`StdoutService`] owns one [`FileReader`] per matching container. Each reader feeds its
//! bytes to a [`StdoutParser`], which hands finished records to a [`Collector`].
mod collector;
mod error;
mod framing;
mod parser;
mod reader;
mod service;

pub use collector::{
    CONTENT_KEY, ChannelCollector, Collector, LogicalRecord, PipelineContext, SOURCE_KEY, TIME_KEY,
};
pub use error::{Error, Result};
pub use framing::{StreamFragment, StreamType, parse_line};
pub use parser::{ParserOptions, StdoutParser};
pub use reader::{CheckpointHandle, FileReader, ReaderMetrics, ReaderOptions};
pub use service::{ServiceDeps, StdoutService};
