//! # testlog capture
//!
//! Isolates console output of concurrently running test units.
//!
//! - [`ConsoleBuffer`]: ordered per-context store with byte/line caps
//! - [`console`]: the process-wide console facade whose methods can be swapped
//! - [`ConsoleInterceptor`]: installs routing wrappers into the facade and
//!   restores the exact originals on disable
//! - [`ConsoleCapture`]: context lifecycle (start, stop, grace-period cleanup)
//! - [`CaptureLayer`]: bridges `tracing` events into the active context

pub mod buffer;
pub mod capture;
pub mod console;
pub mod context;
pub mod format;
pub mod interceptor;
pub mod layer;

#[cfg(test)]
pub(crate) mod test_support;

pub use buffer::{AddOutcome, BufferLimits, ConsoleBuffer};
pub use capture::{
    CaptureConfig, CaptureStats, ConsoleCapture, ContextState, EntryHook, PendingCleanup,
};
pub use console::ConsoleSink;
pub use context::{current_context, spawn_in_context};
pub use format::{render_args, ArgObject, ConsoleArg};
pub use interceptor::{ConsoleInterceptor, IngestTarget};
pub use layer::CaptureLayer;
