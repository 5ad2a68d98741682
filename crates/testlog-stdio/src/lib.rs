//! # testlog stdio
//!
//! Line-level interception of the process's stdout/stderr writers.
//!
//! Raw writes arrive in arbitrary chunks; [`StreamFilter`] reassembles them
//! into complete lines, tests each line against a [`FilterRule`] and keeps
//! the trailing partial line for the next write. [`StdioInterceptor`] puts
//! filtering writers into the process-wide stream slots of [`streams`] and
//! restores the exact original writers on disable.

pub mod filter;
pub mod interceptor;
pub mod line_buffer;
pub mod streams;

#[cfg(test)]
pub(crate) mod test_support;

pub use filter::{preset_names, preset_patterns, FilterPattern, FilterRule};
pub use interceptor::{StdioInterceptor, StdioOptions, StdioStats, WriteSink};
pub use line_buffer::{LineAccumulator, LineDecision, StreamFilter, DEFAULT_MAX_PENDING};
pub use streams::{MemoryWriter, RawWriter, StdioWriter, WriterHandle};
