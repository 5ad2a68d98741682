//! Process-wide console facade.
//!
//! Code under test logs through [`log`], [`info`], [`warn`], [`error`],
//! [`debug`] and [`trace`]. Each level dispatches through a swappable
//! method slot; by default the slots print to the real stdout/stderr.
//! [`crate::ConsoleInterceptor`] replaces the slots to route output into
//! capture buffers and later puts the original sinks back.

use crate::format::{render_args, ConsoleArg};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use testlog_common::LogLevel;

/// A console method implementation
pub type ConsoleSink = Arc<dyn Fn(LogLevel, &[ConsoleArg]) + Send + Sync>;

lazy_static! {
    static ref METHODS: RwLock<HashMap<LogLevel, ConsoleSink>> = RwLock::new(default_methods());
}

fn default_methods() -> HashMap<LogLevel, ConsoleSink> {
    let stdout_sink: ConsoleSink = Arc::new(|_, args| {
        let _ = writeln!(std::io::stdout().lock(), "{}", render_args(args));
    });
    let stderr_sink: ConsoleSink = Arc::new(|_, args| {
        let _ = writeln!(std::io::stderr().lock(), "{}", render_args(args));
    });

    LogLevel::ALL
        .iter()
        .map(|level| {
            let sink = if level.is_stderr() {
                Arc::clone(&stderr_sink)
            } else {
                Arc::clone(&stdout_sink)
            };
            (*level, sink)
        })
        .collect()
}

/// Current implementation of the method for `level`.
pub fn method(level: LogLevel) -> ConsoleSink {
    METHODS.read().get(&level).cloned().unwrap_or_else(noop_sink)
}

fn noop_sink() -> ConsoleSink {
    Arc::new(|_, _| {})
}

/// Installs `sink` for `level` and returns the implementation it replaced.
pub fn replace_method(level: LogLevel, sink: ConsoleSink) -> Option<ConsoleSink> {
    METHODS.write().insert(level, sink)
}

/// Dispatches a console call.
pub fn emit(level: LogLevel, args: &[ConsoleArg]) {
    // Clone out of the lock: the sink may itself log.
    let sink = method(level);
    sink(level, args);
}

pub fn log(args: &[ConsoleArg]) {
    emit(LogLevel::Log, args)
}

pub fn info(args: &[ConsoleArg]) {
    emit(LogLevel::Info, args)
}

pub fn warn(args: &[ConsoleArg]) {
    emit(LogLevel::Warn, args)
}

pub fn error(args: &[ConsoleArg]) {
    emit(LogLevel::Error, args)
}

pub fn debug(args: &[ConsoleArg]) {
    emit(LogLevel::Debug, args)
}

pub fn trace(args: &[ConsoleArg]) {
    emit(LogLevel::Trace, args)
}

/// Single-string shorthand for [`emit`].
pub fn print(level: LogLevel, text: impl Into<String>) {
    emit(level, &[ConsoleArg::Str(text.into())])
}
