//! Console interceptor: swaps the console facade's methods for routing
//! wrappers and restores the exact originals on disable.

use crate::console::{self, ConsoleSink};
use crate::format::ConsoleArg;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use testlog_common::{Error, LogLevel, Result};
use tracing::{debug, warn};

/// Only one interceptor may own the console at a time.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Receiver of intercepted console calls
pub trait IngestTarget: Send + Sync {
    /// Routes one call. Returns `true` when the call was captured for an
    /// active context and should not reach the terminal.
    fn ingest_call(&self, level: LogLevel, args: &[ConsoleArg]) -> bool;
}

/// Patch handle over the console facade
pub struct ConsoleInterceptor {
    /// Sinks captured at enable time, restored verbatim on disable
    originals: Option<HashMap<LogLevel, ConsoleSink>>,
    /// Wrappers we installed, used to detect foreign re-patching
    wrappers: HashMap<LogLevel, ConsoleSink>,
    passthrough: bool,
}

impl std::fmt::Debug for ConsoleInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleInterceptor")
            .field("enabled", &self.is_enabled())
            .field("passthrough", &self.passthrough)
            .finish()
    }
}

impl ConsoleInterceptor {
    /// With `passthrough`, captured calls are also printed to the terminal.
    pub fn new(passthrough: bool) -> Self {
        Self {
            originals: None,
            wrappers: HashMap::new(),
            passthrough,
        }
    }

    /// Installs the routing wrappers.
    ///
    /// Returns `Ok(false)` when this interceptor is already enabled, and an
    /// error when a different interceptor owns the console.
    pub fn enable(&mut self, target: Weak<dyn IngestTarget>) -> Result<bool> {
        if self.originals.is_some() {
            return Ok(false);
        }
        if INSTALLED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::already_installed("console interceptor"));
        }

        let mut originals = HashMap::new();
        for level in LogLevel::ALL {
            let original = console::method(level);
            let wrapper = routing_wrapper(Arc::clone(&original), target.clone(), self.passthrough);
            console::replace_method(level, Arc::clone(&wrapper));
            self.wrappers.insert(level, wrapper);
            originals.insert(level, original);
        }
        self.originals = Some(originals);

        debug!("Console interceptor enabled");
        Ok(true)
    }

    /// Restores the sinks captured by [`enable`](Self::enable).
    ///
    /// Returns `false` when the interceptor was not enabled.
    pub fn disable(&mut self) -> bool {
        let Some(originals) = self.originals.take() else {
            return false;
        };

        for (level, original) in originals {
            let current = console::replace_method(level, original);
            let ours = self.wrappers.remove(&level);
            let replaced_by_us = match (current, ours) {
                (Some(current), Some(ours)) => Arc::ptr_eq(&current, &ours),
                _ => false,
            };
            if !replaced_by_us {
                warn!(
                    level = %level,
                    "Console method was re-patched while intercepted; restoring original"
                );
            }
        }

        INSTALLED.store(false, Ordering::SeqCst);
        debug!("Console interceptor disabled");
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.originals.is_some()
    }

    /// Original sink captured for `level`, while enabled.
    pub fn original(&self, level: LogLevel) -> Option<ConsoleSink> {
        self.originals
            .as_ref()
            .and_then(|originals| originals.get(&level).cloned())
    }
}

impl Drop for ConsoleInterceptor {
    fn drop(&mut self) {
        self.disable();
    }
}

fn routing_wrapper(
    original: ConsoleSink,
    target: Weak<dyn IngestTarget>,
    passthrough: bool,
) -> ConsoleSink {
    Arc::new(move |level: LogLevel, args: &[ConsoleArg]| {
        let captured = match target.upgrade() {
            Some(target) => catch_unwind(AssertUnwindSafe(|| target.ingest_call(level, args)))
                .unwrap_or_else(|_| {
                    debug!(target: "testlog::capture", "Console capture panicked; passing call through");
                    false
                }),
            None => false,
        };

        if !captured || passthrough {
            original(level, args);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::render_args;
    use crate::test_support::console_lock;
    use parking_lot::Mutex;

    struct Recorder {
        capture: bool,
        seen: Mutex<Vec<String>>,
    }

    impl IngestTarget for Recorder {
        fn ingest_call(&self, level: LogLevel, args: &[ConsoleArg]) -> bool {
            self.seen.lock().push(format!("{}:{}", level, render_args(args)));
            self.capture
        }
    }

    struct Panicker;

    impl IngestTarget for Panicker {
        fn ingest_call(&self, _: LogLevel, _: &[ConsoleArg]) -> bool {
            panic!("capture failure");
        }
    }

    fn recording_sink() -> (ConsoleSink, Arc<Mutex<Vec<String>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let out_in_sink = Arc::clone(&out);
        let sink: ConsoleSink = Arc::new(move |_, args| out_in_sink.lock().push(render_args(args)));
        (sink, out)
    }

    #[test]
    fn test_enable_disable_restores_exact_originals() {
        let _guard = console_lock();
        let before: Vec<ConsoleSink> = LogLevel::ALL.iter().map(|l| console::method(*l)).collect();

        let recorder: Arc<dyn IngestTarget> = Arc::new(Recorder {
            capture: true,
            seen: Mutex::new(Vec::new()),
        });
        let mut interceptor = ConsoleInterceptor::new(false);
        assert!(interceptor.enable(Arc::downgrade(&recorder)).unwrap());
        assert!(!interceptor.enable(Arc::downgrade(&recorder)).unwrap());
        assert!(interceptor.is_enabled());

        for (level, original) in LogLevel::ALL.iter().zip(&before) {
            assert!(!Arc::ptr_eq(&console::method(*level), original));
            assert!(Arc::ptr_eq(&interceptor.original(*level).unwrap(), original));
        }

        assert!(interceptor.disable());
        assert!(!interceptor.disable());
        for (level, original) in LogLevel::ALL.iter().zip(&before) {
            assert!(Arc::ptr_eq(&console::method(*level), original));
        }
    }

    #[test]
    fn test_second_interceptor_is_refused() {
        let _guard = console_lock();
        let recorder: Arc<dyn IngestTarget> = Arc::new(Recorder {
            capture: false,
            seen: Mutex::new(Vec::new()),
        });

        let mut first = ConsoleInterceptor::new(false);
        let mut second = ConsoleInterceptor::new(false);
        first.enable(Arc::downgrade(&recorder)).unwrap();
        let err = second.enable(Arc::downgrade(&recorder)).unwrap_err();
        assert!(matches!(err, Error::AlreadyInstalled { .. }));

        first.disable();
        assert!(second.enable(Arc::downgrade(&recorder)).unwrap());
        second.disable();
    }

    #[test]
    fn test_uncaptured_calls_reach_original() {
        let _guard = console_lock();
        let (sink, printed) = recording_sink();
        let saved = console::replace_method(LogLevel::Log, sink).unwrap();

        let recorder = Arc::new(Recorder {
            capture: false,
            seen: Mutex::new(Vec::new()),
        });
        let target: Arc<dyn IngestTarget> = recorder.clone();
        let mut interceptor = ConsoleInterceptor::new(false);
        interceptor.enable(Arc::downgrade(&target)).unwrap();

        console::log(&["visible".into()]);
        interceptor.disable();
        console::replace_method(LogLevel::Log, saved);

        assert_eq!(*printed.lock(), vec!["visible"]);
        assert_eq!(*recorder.seen.lock(), vec!["log:visible"]);
    }

    #[test]
    fn test_captured_calls_are_swallowed_unless_passthrough() {
        let _guard = console_lock();
        let (sink, printed) = recording_sink();
        let saved = console::replace_method(LogLevel::Log, sink).unwrap();
        let target: Arc<dyn IngestTarget> = Arc::new(Recorder {
            capture: true,
            seen: Mutex::new(Vec::new()),
        });

        let mut quiet = ConsoleInterceptor::new(false);
        quiet.enable(Arc::downgrade(&target)).unwrap();
        console::log(&["hidden".into()]);
        quiet.disable();

        let mut loud = ConsoleInterceptor::new(true);
        loud.enable(Arc::downgrade(&target)).unwrap();
        console::log(&["shown".into()]);
        loud.disable();

        console::replace_method(LogLevel::Log, saved);
        assert_eq!(*printed.lock(), vec!["shown"]);
    }

    #[test]
    fn test_capture_panic_is_swallowed() {
        let _guard = console_lock();
        let (sink, printed) = recording_sink();
        let saved = console::replace_method(LogLevel::Error, sink).unwrap();

        let target: Arc<dyn IngestTarget> = Arc::new(Panicker);
        let mut interceptor = ConsoleInterceptor::new(false);
        interceptor.enable(Arc::downgrade(&target)).unwrap();
        console::error(&["still printed".into()]);
        interceptor.disable();
        console::replace_method(LogLevel::Error, saved);

        assert_eq!(*printed.lock(), vec!["still printed"]);
    }
}
