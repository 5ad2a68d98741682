//! Stdio interceptor: filtering writers installed into the stream slots

use crate::filter::{FilterPattern, FilterRule};
use crate::line_buffer::{LineDecision, StreamFilter};
use crate::streams::{self, RawWriter, WriterHandle};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use testlog_common::{Error, Result, StreamType, SuppressedSummary};
use tracing::{debug, warn};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Interceptor options
#[derive(Debug, Clone, PartialEq)]
pub struct StdioOptions {
    /// Apply the filter to stdout
    pub suppress_stdout: bool,
    /// Apply the filter to stderr
    pub suppress_stderr: bool,
    pub filter_pattern: FilterPattern,
    pub framework_presets: Vec<String>,
    /// Send suppressed stdout lines to the original stderr instead of
    /// dropping them
    pub redirect_to_stderr: bool,
    /// Filter the incomplete trailing line on disable instead of passing it
    pub flush_with_filtering: bool,
}

impl Default for StdioOptions {
    fn default() -> Self {
        Self {
            suppress_stdout: true,
            suppress_stderr: false,
            filter_pattern: FilterPattern::Unset,
            framework_presets: Vec::new(),
            redirect_to_stderr: false,
            flush_with_filtering: false,
        }
    }
}

impl StdioOptions {
    pub fn compile(&self) -> Result<FilterRule> {
        FilterRule::new(&self.filter_pattern, &self.framework_presets)
    }
}

/// Receiver of intercepted raw writes
pub trait WriteSink: Send + Sync {
    /// Takes one raw write. Returns `true` when the write was captured and
    /// should not reach the terminal.
    fn capture_write(&self, stream: StreamType, bytes: &[u8]) -> bool;
}

/// Per-stream line counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StdioStats {
    pub stdout: SuppressedSummary,
    pub stderr: SuppressedSummary,
}

impl StdioStats {
    pub fn combined(&self) -> SuppressedSummary {
        let mut total = self.stdout;
        total.merge(self.stderr);
        total
    }
}

struct FilteringWriter {
    stream: StreamType,
    filter: Mutex<StreamFilter>,
    target: WriterHandle,
    redirect: Option<WriterHandle>,
    sink: Option<Weak<dyn WriteSink>>,
}

impl FilteringWriter {
    fn offer_to_sink(&self, bytes: &[u8]) -> bool {
        let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        catch_unwind(AssertUnwindSafe(|| sink.capture_write(self.stream, bytes))).unwrap_or_else(
            |_| {
                debug!(stream = %self.stream, "Write capture panicked; filtering write instead");
                false
            },
        )
    }

    fn emit(&self, line: &[u8], decision: LineDecision) -> io::Result<()> {
        match decision {
            LineDecision::Pass => self.target.write_bytes(line),
            LineDecision::Suppress => match &self.redirect {
                Some(redirect) => redirect.write_bytes(line),
                None => Ok(()),
            },
        }
    }

    fn finish(&self, filter_remainder: bool) -> io::Result<()> {
        let remainder = self.filter.lock().finish(filter_remainder);
        if let Some((line, decision)) = remainder {
            self.emit(&line, decision)?;
        }
        self.target.flush()
    }
}

impl RawWriter for FilteringWriter {
    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        if self.offer_to_sink(bytes) {
            return Ok(());
        }
        // Decide under the lock, write outside it.
        let lines = self.filter.lock().feed(bytes);
        for (line, decision) in lines {
            self.emit(&line, decision)?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.target.flush()
    }
}

struct Installed {
    original_stdout: WriterHandle,
    original_stderr: WriterHandle,
    stdout: Arc<FilteringWriter>,
    stderr: Arc<FilteringWriter>,
}

/// Patch handle over the process stream slots
pub struct StdioInterceptor {
    options: StdioOptions,
    rule: Arc<FilterRule>,
    sink: Option<Weak<dyn WriteSink>>,
    installed: Option<Installed>,
    last_stats: StdioStats,
}

impl std::fmt::Debug for StdioInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioInterceptor")
            .field("options", &self.options)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl StdioInterceptor {
    /// Compiles the filter rule; invalid patterns fail here, not on write.
    pub fn new(options: StdioOptions) -> Result<Self> {
        let rule = Arc::new(options.compile()?);
        Ok(Self {
            options,
            rule,
            sink: None,
            installed: None,
            last_stats: StdioStats::default(),
        })
    }

    /// Offers every write to `sink` before filtering; captured writes skip
    /// the terminal. Takes effect on the next [`enable`](Self::enable).
    pub fn with_sink(mut self, sink: Weak<dyn WriteSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn options(&self) -> &StdioOptions {
        &self.options
    }

    /// Installs filtering writers in front of the current stream writers.
    ///
    /// Returns `Ok(false)` when already enabled; fails when another
    /// interceptor owns the streams.
    pub fn enable(&mut self) -> Result<bool> {
        if self.installed.is_some() {
            return Ok(false);
        }
        if INSTALLED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::already_installed("stdio interceptor"));
        }

        let original_stdout = streams::current_writer(StreamType::Stdout);
        let original_stderr = streams::current_writer(StreamType::Stderr);

        let stdout = Arc::new(FilteringWriter {
            stream: StreamType::Stdout,
            filter: Mutex::new(StreamFilter::new(
                Arc::clone(&self.rule),
                self.options.suppress_stdout,
            )),
            target: Arc::clone(&original_stdout),
            redirect: self
                .options
                .redirect_to_stderr
                .then(|| Arc::clone(&original_stderr)),
            sink: self.sink.clone(),
        });
        let stderr = Arc::new(FilteringWriter {
            stream: StreamType::Stderr,
            filter: Mutex::new(StreamFilter::new(
                Arc::clone(&self.rule),
                self.options.suppress_stderr,
            )),
            target: Arc::clone(&original_stderr),
            redirect: None,
            sink: self.sink.clone(),
        });

        streams::replace_writer(StreamType::Stdout, stdout.clone());
        streams::replace_writer(StreamType::Stderr, stderr.clone());

        self.installed = Some(Installed {
            original_stdout,
            original_stderr,
            stdout,
            stderr,
        });
        debug!(
            pure = self.rule.is_pure(),
            redirect = self.options.redirect_to_stderr,
            "Stdio interceptor enabled"
        );
        Ok(true)
    }

    /// Flushes buffered partial lines and restores the writers captured at
    /// enable time. Returns `false` when not enabled.
    pub fn disable(&mut self) -> bool {
        let Some(installed) = self.installed.take() else {
            return false;
        };

        for writer in [&installed.stdout, &installed.stderr] {
            if let Err(e) = writer.finish(self.options.flush_with_filtering) {
                warn!(stream = %writer.stream, error = %e, "Failed to flush buffered output");
            }
        }

        let current_stdout = streams::replace_writer(StreamType::Stdout, installed.original_stdout);
        let current_stderr = streams::replace_writer(StreamType::Stderr, installed.original_stderr);
        let stdout_ours: WriterHandle = installed.stdout.clone();
        let stderr_ours: WriterHandle = installed.stderr.clone();
        if !Arc::ptr_eq(&current_stdout, &stdout_ours) || !Arc::ptr_eq(&current_stderr, &stderr_ours) {
            warn!("Stream writer was replaced while intercepted; restoring original");
        }

        self.last_stats = StdioStats {
            stdout: installed.stdout.filter.lock().counts(),
            stderr: installed.stderr.filter.lock().counts(),
        };
        INSTALLED.store(false, Ordering::SeqCst);
        debug!(
            suppressed = self.last_stats.combined().suppressed_lines,
            "Stdio interceptor disabled"
        );
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.installed.is_some()
    }

    /// Line counts of the current installation, or of the last one once
    /// disabled.
    pub fn stats(&self) -> StdioStats {
        match &self.installed {
            Some(installed) => StdioStats {
                stdout: installed.stdout.filter.lock().counts(),
                stderr: installed.stderr.filter.lock().counts(),
            },
            None => self.last_stats,
        }
    }
}

impl Drop for StdioInterceptor {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{write_stream, MemoryWriter};
    use crate::test_support::stream_lock;

    struct Harness {
        stdout: Arc<MemoryWriter>,
        stderr: Arc<MemoryWriter>,
        saved: (WriterHandle, WriterHandle),
    }

    impl Harness {
        fn new() -> Self {
            let stdout = MemoryWriter::new();
            let stderr = MemoryWriter::new();
            let saved = (
                streams::replace_writer(StreamType::Stdout, stdout.clone()),
                streams::replace_writer(StreamType::Stderr, stderr.clone()),
            );
            Self {
                stdout,
                stderr,
                saved,
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            streams::replace_writer(StreamType::Stdout, self.saved.0.clone());
            streams::replace_writer(StreamType::Stderr, self.saved.1.clone());
        }
    }

    fn nest_options() -> StdioOptions {
        StdioOptions {
            filter_pattern: FilterPattern::single(r"^\[Nest\]"),
            ..StdioOptions::default()
        }
    }

    #[test]
    fn test_split_banner_is_suppressed() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let mut interceptor = StdioInterceptor::new(nest_options()).unwrap();
        interceptor.enable().unwrap();

        for chunk in ["[Ne", "st] ", "X", "\nkept", " line\n"] {
            write_stream(StreamType::Stdout, chunk.as_bytes()).unwrap();
        }
        interceptor.disable();

        assert_eq!(harness.stdout.contents(), "kept line\n");
        let stats = interceptor.stats();
        assert_eq!(stats.stdout.total_lines, 2);
        assert_eq!(stats.stdout.suppressed_lines, 1);
    }

    #[test]
    fn test_disable_restores_exact_writers() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let before_out = streams::current_writer(StreamType::Stdout);
        let before_err = streams::current_writer(StreamType::Stderr);

        let mut interceptor = StdioInterceptor::new(nest_options()).unwrap();
        assert!(interceptor.enable().unwrap());
        assert!(!interceptor.enable().unwrap());
        assert!(!Arc::ptr_eq(&streams::current_writer(StreamType::Stdout), &before_out));

        assert!(interceptor.disable());
        assert!(!interceptor.disable());
        assert!(Arc::ptr_eq(&streams::current_writer(StreamType::Stdout), &before_out));
        assert!(Arc::ptr_eq(&streams::current_writer(StreamType::Stderr), &before_err));
        drop(harness);
    }

    #[test]
    fn test_only_one_interceptor_at_a_time() {
        let _guard = stream_lock();
        let _harness = Harness::new();
        let mut first = StdioInterceptor::new(StdioOptions::default()).unwrap();
        let mut second = StdioInterceptor::new(StdioOptions::default()).unwrap();
        first.enable().unwrap();
        assert!(matches!(second.enable(), Err(Error::AlreadyInstalled { .. })));
        first.disable();
        assert!(second.enable().unwrap());
    }

    #[test]
    fn test_partial_line_passes_on_disable_by_default() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let mut interceptor = StdioInterceptor::new(nest_options()).unwrap();
        interceptor.enable().unwrap();
        write_stream(StreamType::Stdout, b"[Nest] unterminated").unwrap();
        assert_eq!(harness.stdout.contents(), "");
        interceptor.disable();
        assert_eq!(harness.stdout.contents(), "[Nest] unterminated");
    }

    #[test]
    fn test_partial_line_filtered_when_configured() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let mut interceptor = StdioInterceptor::new(StdioOptions {
            flush_with_filtering: true,
            ..nest_options()
        })
        .unwrap();
        interceptor.enable().unwrap();
        write_stream(StreamType::Stdout, b"[Nest] unterminated").unwrap();
        interceptor.disable();
        assert_eq!(harness.stdout.contents(), "");
    }

    #[test]
    fn test_pure_mode_and_unset() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let mut pure = StdioInterceptor::new(StdioOptions {
            filter_pattern: FilterPattern::SuppressAll,
            ..StdioOptions::default()
        })
        .unwrap();
        pure.enable().unwrap();
        write_stream(StreamType::Stdout, b"one\ntwo\n").unwrap();
        pure.disable();
        assert_eq!(harness.stdout.contents(), "");

        let mut open = StdioInterceptor::new(StdioOptions::default()).unwrap();
        open.enable().unwrap();
        write_stream(StreamType::Stdout, b"three\n").unwrap();
        open.disable();
        assert_eq!(harness.stdout.contents(), "three\n");
    }

    #[test]
    fn test_redirect_sends_suppressed_stdout_to_stderr() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let mut interceptor = StdioInterceptor::new(StdioOptions {
            redirect_to_stderr: true,
            ..nest_options()
        })
        .unwrap();
        interceptor.enable().unwrap();
        write_stream(StreamType::Stdout, b"[Nest] banner\nresult\n").unwrap();
        interceptor.disable();

        assert_eq!(harness.stdout.contents(), "result\n");
        assert_eq!(harness.stderr.contents(), "[Nest] banner\n");
    }

    #[test]
    fn test_stderr_untouched_unless_enabled() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let mut interceptor = StdioInterceptor::new(StdioOptions {
            filter_pattern: FilterPattern::SuppressAll,
            ..StdioOptions::default()
        })
        .unwrap();
        interceptor.enable().unwrap();
        write_stream(StreamType::Stderr, b"error: boom\n").unwrap();
        interceptor.disable();
        assert_eq!(harness.stderr.contents(), "error: boom\n");
    }

    struct Collector {
        claim: bool,
        seen: Mutex<Vec<(StreamType, Vec<u8>)>>,
    }

    impl WriteSink for Collector {
        fn capture_write(&self, stream: StreamType, bytes: &[u8]) -> bool {
            self.seen.lock().push((stream, bytes.to_vec()));
            self.claim
        }
    }

    struct Exploding;

    impl WriteSink for Exploding {
        fn capture_write(&self, _: StreamType, _: &[u8]) -> bool {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_sink_claims_writes_before_filtering() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let sink = Arc::new(Collector {
            claim: true,
            seen: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn WriteSink> = Arc::downgrade(&sink) as Weak<dyn WriteSink>;
        let mut interceptor = StdioInterceptor::new(nest_options()).unwrap().with_sink(weak);
        interceptor.enable().unwrap();

        write_stream(StreamType::Stdout, b"[Nest] banner
").unwrap();
        write_stream(StreamType::Stderr, b"oops
").unwrap();
        interceptor.disable();

        assert_eq!(harness.stdout.contents(), "");
        assert_eq!(harness.stderr.contents(), "");
        let seen = sink.seen.lock();
        assert_eq!(seen[0], (StreamType::Stdout, b"[Nest] banner\n".to_vec()));
        assert_eq!(seen[1], (StreamType::Stderr, b"oops\n".to_vec()));
        // Claimed writes never reach the line filter.
        assert_eq!(interceptor.stats().stdout.total_lines, 0);
    }

    #[test]
    fn test_declined_or_failing_sink_falls_back_to_filter() {
        let _guard = stream_lock();
        let harness = Harness::new();
        let declining = Arc::new(Collector {
            claim: false,
            seen: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn WriteSink> = Arc::downgrade(&declining) as Weak<dyn WriteSink>;
        let mut interceptor = StdioInterceptor::new(nest_options()).unwrap().with_sink(weak);
        interceptor.enable().unwrap();
        write_stream(StreamType::Stdout, b"[Nest] banner
kept
").unwrap();
        interceptor.disable();
        assert_eq!(harness.stdout.contents(), "kept\n");
        assert_eq!(declining.seen.lock().len(), 1);

        let exploding: Arc<dyn WriteSink> = Arc::new(Exploding);
        let mut interceptor = StdioInterceptor::new(nest_options())
            .unwrap()
            .with_sink(Arc::downgrade(&exploding));
        interceptor.enable().unwrap();
        write_stream(StreamType::Stdout, b"still here
").unwrap();
        drop(exploding);
        write_stream(StreamType::Stdout, b"sink gone
").unwrap();
        interceptor.disable();
        assert_eq!(harness.stdout.contents(), "kept\nstill here\nsink gone\n");
    }

    #[test]
    fn test_invalid_pattern_fails_at_construction() {
        let err = StdioInterceptor::new(StdioOptions {
            filter_pattern: FilterPattern::single("[unclosed"),
            ..StdioOptions::default()
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }
}
