//! # testlog collection
//!
//! Wires the engines into one per-unit pipeline.
//!
//! This crate provides:
//! - [`UnitLogService`]: unit lifecycle (started / writes / finished) on top
//!   of console capture, stdio line filtering and deduplication
//! - Report assembly with failure grouping and token-budget truncation
//! - YAML configuration ([`ReporterLogConfig`])
//! - Output writers for finished unit records

pub mod config;
pub mod output;
pub mod service;
pub mod types;

// Re-export main types
pub use config::{CaptureSettings, ReporterLogConfig, StdioSettings};
pub use output::{JsonLinesFileWriter, MemoryOutputWriter, OutputWriter, StdoutJsonWriter};
pub use service::UnitLogService;
pub use types::{LogReport, ServiceStats};
