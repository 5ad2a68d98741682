//! Unit log service: the host-facing side of the pipeline.
//!
//! The host reports "unit started", raw writes and "unit finished with
//! status"; the service routes console calls and stdio lines into the
//! unit's capture buffer, collapses repeats through the deduplicator and
//! hands back one [`UnitLogs`] record per unit.

use crate::config::ReporterLogConfig;
use crate::output::OutputWriter;
use crate::types::{LogReport, ServiceStats};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::sync::Weak;
use testlog_capture::{current_context, AddOutcome, ConsoleCapture};
use testlog_common::{
    ConsoleEntry, EntryOrigin, Error, LogEntry, LogLevel, Result, StreamType, SuppressedSummary,
    UnitLogs, UnitStatus,
};
use testlog_dedup::{DeduplicationService, FailureRecord, GroupingOptions, LogDeduplicator};
use testlog_stdio::line_buffer::strip_line_ending;
use testlog_stdio::{FilterRule, LineDecision, StdioInterceptor, StreamFilter, WriteSink};
use testlog_truncation::{Section, SectionPriority, TruncationPolicy};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main unit log service
pub struct UnitLogService {
    config: ReporterLogConfig,
    capture: ConsoleCapture,
    deduplicator: Arc<LogDeduplicator>,
    grouping: DeduplicationService,
    truncation: TruncationPolicy,
    stdio_rule: Arc<FilterRule>,
    router: Arc<UnitRouter>,
    stdio: Mutex<Option<StdioInterceptor>>,
    outputs: RwLock<Vec<Box<dyn OutputWriter>>>,
    finished: Mutex<Vec<UnitLogs>>,
    failures: Mutex<Vec<FailureRecord>>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for UnitLogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitLogService")
            .field("config", &self.config)
            .field("units_count", &self.router.units.read().len())
            .field("outputs_count", &self.outputs.read().len())
            .field("total_lines", &self.router.total_lines.load(Ordering::SeqCst))
            .finish()
    }
}

impl UnitLogService {
    /// Builds every engine from `config`; configuration errors surface here.
    pub fn new(config: ReporterLogConfig) -> Result<Self> {
        let capture = ConsoleCapture::new(config.capture.to_capture_config())?;
        let deduplicator = Arc::new(LogDeduplicator::new(config.deduplication.clone())?);
        let stdio_rule = Arc::new(config.stdio.to_options().compile()?);
        let truncation = TruncationPolicy::new(&config.truncation)?;
        let grouping = DeduplicationService::new(GroupingOptions::default())?;

        if deduplicator.is_enabled() {
            let dedup = Arc::clone(&deduplicator);
            capture.set_entry_hook(Some(Arc::new(
                move |unit_id: &str,
                      mut entry: ConsoleEntry,
                      add: &mut dyn FnMut(ConsoleEntry) -> AddOutcome| {
                    let log = LogEntry::new(entry.level, entry.text.clone()).with_test_id(unit_id);
                    let prepared = dedup.prepare(&log);
                    entry.dedup_key = Some(prepared.key.clone());
                    // Only entries the buffer kept count towards dedup stats.
                    match add(entry) {
                        AddOutcome::Appended | AddOutcome::Collapsed => {
                            let duplicate = dedup.record(prepared, &log);
                            trace!(unit_id = %unit_id, duplicate, "Entry recorded");
                        }
                        AddOutcome::Truncated | AddOutcome::Rejected => {}
                    }
                },
            )));
        }

        let router = Arc::new(UnitRouter {
            capture: capture.clone(),
            units: RwLock::new(HashMap::new()),
            redirect_to_stderr: config.stdio.redirect_to_stderr,
            total_lines: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        });

        Ok(Self {
            config,
            capture,
            deduplicator,
            grouping,
            truncation,
            stdio_rule,
            router,
            stdio: Mutex::new(None),
            outputs: RwLock::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ReporterLogConfig {
        &self.config
    }

    pub fn capture(&self) -> &ConsoleCapture {
        &self.capture
    }

    pub fn deduplicator(&self) -> &LogDeduplicator {
        &self.deduplicator
    }

    /// Adds an output that receives every finished unit
    pub fn add_output(&self, output: Box<dyn OutputWriter>) {
        self.outputs.write().push(output);
    }

    /// Registers a unit and starts capturing for it. Repeated calls for a
    /// running unit are ignored.
    pub fn unit_started(&self, unit_id: &str) {
        if self.config.stdio.patch_streams {
            self.ensure_stdio_patched();
        }
        let mut units = self.router.units.write();
        if units.contains_key(unit_id) {
            return;
        }
        self.capture.start_capture(unit_id);
        let stdio = &self.config.stdio;
        // Overlong lines are cut at the buffer's byte cap.
        let line_limit = self.config.capture.max_bytes;
        units.insert(
            unit_id.to_string(),
            Arc::new(UnitCollector {
                stdout: Mutex::new(
                    StreamFilter::new(Arc::clone(&self.stdio_rule), stdio.suppress_stdout)
                        .with_line_limit(line_limit),
                ),
                stderr: Mutex::new(
                    StreamFilter::new(Arc::clone(&self.stdio_rule), stdio.suppress_stderr)
                        .with_line_limit(line_limit),
                ),
                tasks: Mutex::new(Vec::new()),
            }),
        );
        debug!(unit_id = %unit_id, "Unit registered for log collection");
    }

    /// Runs `fut` with `unit_id` active, so console calls and stream writes
    /// made while it runs land in the unit's buffer.
    pub async fn run_unit<F: Future>(&self, unit_id: &str, fut: F) -> F::Output {
        self.capture.run_with_capture(unit_id.to_string(), fut).await
    }

    /// Feeds one raw stdout/stderr write of `unit_id` through the line
    /// filter into its buffer.
    pub fn record_write(&self, unit_id: &str, stream: StreamType, bytes: &[u8]) -> Result<()> {
        self.router.record_write(unit_id, stream, bytes)
    }

    /// Whether the process stream writers are patched by this service
    pub fn is_stdio_patched(&self) -> bool {
        self.stdio
            .lock()
            .as_ref()
            .map(StdioInterceptor::is_enabled)
            .unwrap_or(false)
    }

    /// Records the failure message of a unit for grouping in the report.
    pub fn record_failure(&self, unit_id: &str, message: impl Into<String>) {
        self.failures
            .lock()
            .push(FailureRecord::new(unit_id, message).with_title(unit_id));
    }

    /// Reads `stream` line by line into `unit_id` until EOF or shutdown.
    pub fn collect_from_stream(
        self: &Arc<Self>,
        unit_id: &str,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        stream_type: StreamType,
    ) -> Result<()> {
        let collector = self.router.get_unit(unit_id)?;
        let service = Arc::clone(self);
        let unit_id = unit_id.to_string();
        let cancel_token = self.cancel_token.child_token();

        let task = tokio::spawn(async move {
            service
                .stream_reader(stream, stream_type, unit_id, cancel_token)
                .await;
        });
        collector.tasks.lock().push(task);
        Ok(())
    }

    /// Finishes a unit: waits for its stream readers, flushes partial lines,
    /// stops capture and returns the unit's record. The record also goes to
    /// every output and is kept for [`finalize_report`](Self::finalize_report).
    pub async fn unit_finished(&self, unit_id: &str, status: UnitStatus) -> Result<UnitLogs> {
        let collector = self.router.get_unit(unit_id)?;

        // Readers still write through `record_write`, so the unit stays
        // registered until they are done.
        let tasks: Vec<_> = collector.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(READER_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!(unit_id = %unit_id, "Stream reader did not finish in time");
            }
        }
        self.router.units.write().remove(unit_id);

        let mut suppressed = SuppressedSummary::default();
        for stream in [StreamType::Stdout, StreamType::Stderr] {
            let mut filter = collector.filter(stream).lock();
            let remainder = filter.finish(self.config.stdio.flush_with_filtering);
            suppressed.merge(filter.counts());
            drop(filter);
            if let Some((line, decision)) = remainder {
                self.router.route_line(unit_id, stream, &line, decision);
            }
        }

        let mut entries = self.capture.stop_capture(unit_id);
        self.attach_sources(&mut entries);

        let logs = UnitLogs {
            unit_id: unit_id.to_string(),
            status,
            entries,
            suppressed: (suppressed.suppressed_lines > 0).then_some(suppressed),
        };

        for output in self.outputs.write().iter_mut() {
            if let Err(e) = output.write(&logs) {
                warn!(unit_id = %unit_id, error = %e, "Failed to write unit record");
            }
        }
        self.finished.lock().push(logs.clone());

        debug!(
            unit_id = %unit_id,
            status = %status,
            entries = logs.entries.len(),
            "Unit finished"
        );
        Ok(logs)
    }

    /// Builds the report over all units finished so far and clears them.
    ///
    /// Similar failures are grouped; then whole sections are dropped, lowest
    /// priority first, until the estimate fits the token budget.
    pub fn finalize_report(&self) -> Result<LogReport> {
        let mut units: Vec<UnitLogs> = std::mem::take(&mut *self.finished.lock());
        let failures: Vec<FailureRecord> = std::mem::take(&mut *self.failures.lock());
        let compression = self.grouping.compress(&failures);

        let failed = units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .count();
        let summary = format!(
            "{} units ({} failed), {} failures in {} groups",
            units.len(),
            failed,
            failures.len(),
            compression.groups.len()
        );

        let mut sections = vec![Section::new("summary", SectionPriority::Summary, summary.clone())];
        for failure in &compression.failures {
            let mut content = failure.message.clone();
            if let Some(stack) = &failure.stack {
                content.push('\n');
                content.push_str(stack);
            }
            sections.push(Section::new(
                format!("failure:{}", failure.id),
                SectionPriority::FailureDetail,
                content,
            ));
        }
        if !compression.groups.is_empty() {
            let groups_json = serde_json::to_string(&compression.groups)?;
            sections.push(Section::new("groups", SectionPriority::Metadata, groups_json));
        }
        for unit in &units {
            if unit.entries.is_empty() {
                continue;
            }
            let priority = match unit.status {
                UnitStatus::Failed => SectionPriority::ConsoleOutput,
                UnitStatus::Passed | UnitStatus::Skipped => SectionPriority::PassedLogs,
            };
            let content = unit
                .entries
                .iter()
                .map(|e| e.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(Section::new(format!("logs:{}", unit.unit_id), priority, content));
        }

        let result = self.truncation.apply(sections);
        let dropped: HashSet<&str> = result.removed.iter().map(String::as_str).collect();

        for unit in &mut units {
            if dropped.contains(format!("logs:{}", unit.unit_id).as_str()) {
                unit.entries.clear();
            }
        }
        let kept_failures = compression
            .failures
            .into_iter()
            .filter(|f| !dropped.contains(format!("failure:{}", f.id).as_str()))
            .collect();
        let failure_groups = if dropped.contains("groups") {
            Vec::new()
        } else {
            compression.groups
        };

        info!(
            units = units.len(),
            dropped_sections = result.removed.len(),
            estimated_tokens = result.tokens_after,
            "Log report finalized"
        );

        Ok(LogReport {
            summary,
            units,
            failures: kept_failures,
            failure_groups,
            dropped_sections: result.removed,
            estimated_tokens: result.tokens_after,
            within_budget: result.within_budget,
        })
    }

    pub fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            active_units: self.router.units.read().len(),
            finished_units: self.finished.lock().len(),
            total_lines: self.router.total_lines.load(Ordering::SeqCst),
            total_bytes: self.router.total_bytes.load(Ordering::SeqCst),
            capture: self.capture.get_stats(),
            deduplication: self.deduplicator.get_stats(),
        }
    }

    /// Cancels stream readers, closes outputs and releases the console and
    /// stream writers.
    pub fn close(&self) -> Result<()> {
        self.cancel_token.cancel();
        if let Some(mut interceptor) = self.stdio.lock().take() {
            interceptor.disable();
        }

        let mut first_error = None;
        for output in self.outputs.write().iter_mut() {
            if let Err(e) = output.close() {
                warn!(error = %e, "Error closing output writer");
                first_error.get_or_insert(e);
            }
        }
        self.capture.reset();
        info!("Unit log service closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ===== INTERNAL METHODS =====

    fn ensure_stdio_patched(&self) {
        let mut stdio = self.stdio.lock();
        if stdio.is_some() {
            return;
        }
        let router: Arc<dyn WriteSink> = self.router.clone();
        let sink: Weak<dyn WriteSink> = Arc::downgrade(&router);
        let mut interceptor = match StdioInterceptor::new(self.config.stdio.to_options()) {
            Ok(interceptor) => interceptor.with_sink(sink),
            Err(e) => {
                warn!(error = %e, "Failed to build stdio interceptor");
                return;
            }
        };
        match interceptor.enable() {
            Ok(_) => *stdio = Some(interceptor),
            Err(e) => debug!(error = %e, "Stdio writers not patched"),
        }
    }

    fn attach_sources(&self, entries: &mut [ConsoleEntry]) {
        if !self.config.deduplication.include_sources {
            return;
        }
        for entry in entries.iter_mut() {
            let (Some(key), Some(meta)) = (entry.dedup_key.as_deref(), entry.deduplication.as_mut())
            else {
                continue;
            };
            if let Some(cached) = self.deduplicator.get_entry(key) {
                meta.sources = cached.sources.into_iter().collect();
            }
        }
    }

    async fn stream_reader(
        &self,
        stream: impl tokio::io::AsyncRead + Unpin,
        stream_type: StreamType,
        unit_id: String,
        cancel_token: CancellationToken,
    ) {
        debug!(unit_id = %unit_id, stream = %stream_type, "Stream reader started");
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let mut line_num = 0u64;

        loop {
            line.clear();
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!(unit_id = %unit_id, "Stream reader cancelled");
                    break;
                }
                result = reader.read_until(b'\n', &mut line) => {
                    match result {
                        Ok(0) => {
                            debug!(unit_id = %unit_id, "Stream ended");
                            break;
                        }
                        Ok(_) => {
                            line_num += 1;
                            if let Err(e) = self.record_write(&unit_id, stream_type, &line) {
                                warn!(
                                    unit_id = %unit_id,
                                    error = %e,
                                    "Failed to record output line"
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            error!(
                                unit_id = %unit_id,
                                error = %e,
                                "Error reading from stream"
                            );
                            break;
                        }
                    }
                }
            }
        }

        debug!(unit_id = %unit_id, lines = line_num, "Stream reader finished");
    }
}

/// Routing state shared with the stdio interceptor: the registered units
/// and their line filters.
struct UnitRouter {
    capture: ConsoleCapture,
    units: RwLock<HashMap<String, Arc<UnitCollector>>>,
    redirect_to_stderr: bool,
    total_lines: AtomicU64,
    total_bytes: AtomicU64,
}

impl UnitRouter {
    fn get_unit(&self, unit_id: &str) -> Result<Arc<UnitCollector>> {
        self.units
            .read()
            .get(unit_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unit {}", unit_id)))
    }

    fn record_write(&self, unit_id: &str, stream: StreamType, bytes: &[u8]) -> Result<()> {
        let collector = self.get_unit(unit_id)?;
        self.total_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        let lines = collector.filter(stream).lock().feed(bytes);
        for (line, decision) in lines {
            self.route_line(unit_id, stream, &line, decision);
        }
        Ok(())
    }

    fn route_line(&self, unit_id: &str, stream: StreamType, line: &[u8], decision: LineDecision) {
        self.total_lines.fetch_add(1, Ordering::SeqCst);
        let level = match decision {
            LineDecision::Pass => stream.level(),
            // Redirected lines continue on stderr, unfiltered.
            LineDecision::Suppress if stream == StreamType::Stdout && self.redirect_to_stderr => {
                LogLevel::Error
            }
            LineDecision::Suppress => return,
        };
        let text = String::from_utf8_lossy(strip_line_ending(line)).into_owned();
        self.capture
            .ingest_entry(unit_id, ConsoleEntry::new(level, text, EntryOrigin::Intercepted));
    }
}

impl WriteSink for UnitRouter {
    fn capture_write(&self, stream: StreamType, bytes: &[u8]) -> bool {
        let Some(unit_id) = current_context() else {
            return false;
        };
        self.record_write(&unit_id, stream, bytes).is_ok()
    }
}

/// Per-unit line filters and reader tasks
struct UnitCollector {
    stdout: Mutex<StreamFilter>,
    stderr: Mutex<StreamFilter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnitCollector {
    fn filter(&self, stream: StreamType) -> &Mutex<StreamFilter> {
        match stream {
            StreamType::Stdout => &self.stdout,
            StreamType::Stderr => &self.stderr,
        }
    }
}
