//! # testlog common
//!
//! Types and errors shared by every crate of the testlog pipeline.
//!
//! The pipeline captures console and stdio output produced by concurrently
//! running test units, filters and deduplicates it, and bounds its size
//! before handing a per-unit log stream to a report builder.

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{Error, Result, ResultExt};
pub use types::{
    ConsoleEntry, DedupMetadata, EntryOrigin, LogEntry, LogLevel, StreamType, SuppressedSummary,
    UnitLogs, UnitStatus,
};
