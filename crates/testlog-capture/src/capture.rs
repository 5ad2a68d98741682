//! Console capture orchestrator.
//!
//! Each context moves through `unregistered -> capturing -> stopped ->
//! removed`. Stopping a context hands back its entries but keeps the buffer
//! alive for a grace period, so output from work that outlives the unit
//! (timers, unawaited tasks) is still attributed to it instead of leaking
//! into the terminal or another unit.

use crate::buffer::{AddOutcome, BufferLimits, ConsoleBuffer};
use crate::context;
use crate::format::{args_to_json, render_args, ConsoleArg};
use crate::interceptor::{ConsoleInterceptor, IngestTarget};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use testlog_common::{ConsoleEntry, EntryOrigin, LogLevel, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub max_bytes: usize,
    pub max_lines: usize,
    pub grace_period: Duration,
    /// Install the console interceptor on first `start_capture`
    pub patch_console: bool,
    /// Also print captured calls to the terminal
    pub passthrough: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 50_000,
            max_lines: 1_000,
            grace_period: Duration::from_millis(100),
            patch_console: true,
            passthrough: false,
        }
    }
}

impl CaptureConfig {
    pub fn limits(&self) -> BufferLimits {
        BufferLimits {
            max_bytes: self.max_bytes,
            max_lines: self.max_lines,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.limits().validate()
    }
}

/// Lifecycle state of a registered context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Capturing,
    /// Stopped, draining its grace period
    Stopped,
}

/// Scheduled removal of a stopped context's buffer
#[derive(Debug, Clone)]
pub struct PendingCleanup {
    pub context_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub grace: Duration,
    deadline: Instant,
    generation: u64,
    token: CancellationToken,
}

/// Wraps the buffering of every entry accepted for a known context.
///
/// The hook gets the context id, the entry and the buffer's add. It may
/// annotate the entry before adding it and act on the [`AddOutcome`]; an
/// entry the hook never adds is dropped. Used to attach dedup keys and to
/// count only entries the buffer kept.
pub type EntryHook =
    Arc<dyn Fn(&str, ConsoleEntry, &mut dyn FnMut(ConsoleEntry) -> AddOutcome) + Send + Sync>;

/// Observability snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub active_buffers: usize,
    pub pending_cleanups: usize,
    pub is_patched: bool,
}

struct ContextSlot {
    state: ContextState,
    buffer: ConsoleBuffer,
}

/// Console capture orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConsoleCapture {
    inner: Arc<CaptureInner>,
}

struct CaptureInner {
    config: CaptureConfig,
    // Lock order: contexts, then entry_hook, then pending, then interceptor.
    contexts: RwLock<HashMap<String, ContextSlot>>,
    pending: Mutex<HashMap<String, PendingCleanup>>,
    interceptor: Mutex<ConsoleInterceptor>,
    generation: AtomicU64,
    entry_hook: RwLock<Option<EntryHook>>,
}

impl std::fmt::Debug for ConsoleCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleCapture")
            .field("config", &self.inner.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}

impl ConsoleCapture {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let passthrough = config.passthrough;
        Ok(Self {
            inner: Arc::new(CaptureInner {
                config,
                contexts: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                interceptor: Mutex::new(ConsoleInterceptor::new(passthrough)),
                generation: AtomicU64::new(0),
                entry_hook: RwLock::new(None),
            }),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Installs (or with `None` removes) the hook run on each entry.
    pub fn set_entry_hook(&self, hook: Option<EntryHook>) {
        *self.inner.entry_hook.write() = hook;
    }

    /// Registers an empty buffer for `context_id`. No-op when capture is
    /// disabled or the context is already capturing. A context that is
    /// still in its grace period gets a fresh buffer and its cleanup is
    /// cancelled.
    pub fn start_capture(&self, context_id: &str) {
        if !self.inner.config.enabled {
            return;
        }
        self.sweep_expired();
        self.ensure_patched();

        let mut contexts = self.inner.contexts.write();
        if let Some(slot) = contexts.get(context_id) {
            if slot.state == ContextState::Capturing {
                return;
            }
        }

        if let Some(pending) = self.inner.pending.lock().remove(context_id) {
            pending.token.cancel();
        }

        // Limits were validated in `new`.
        let buffer = match ConsoleBuffer::new(self.inner.config.limits()) {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!(context_id = %context_id, error = %e, "Failed to create console buffer");
                return;
            }
        };
        contexts.insert(
            context_id.to_string(),
            ContextSlot {
                state: ContextState::Capturing,
                buffer,
            },
        );
        debug!(context_id = %context_id, "Console capture started");
    }

    /// Runs `fut` with `context_id` as the active context for every console
    /// call made while it is polled.
    pub async fn run_with_capture<F: Future>(&self, context_id: impl Into<String>, fut: F) -> F::Output {
        context::scope(context_id.into(), fut).await
    }

    /// Synchronous counterpart of [`run_with_capture`](Self::run_with_capture).
    pub fn run_with_capture_sync<R>(&self, context_id: impl Into<String>, f: impl FnOnce() -> R) -> R {
        context::sync_scope(context_id.into(), f)
    }

    /// Stops a context and returns its entries in arrival order.
    ///
    /// The buffer is kept for the grace period; entries arriving in that
    /// window are retrievable with [`take_late_entries`](Self::take_late_entries).
    /// Unknown contexts yield an empty list.
    pub fn stop_capture(&self, context_id: &str) -> Vec<ConsoleEntry> {
        self.sweep_expired();

        let mut contexts = self.inner.contexts.write();
        let Some(slot) = contexts.get_mut(context_id) else {
            return Vec::new();
        };

        let entries = slot.buffer.take_events();
        if slot.state == ContextState::Stopped {
            return entries;
        }
        slot.state = ContextState::Stopped;

        let grace = self.inner.config.grace_period;
        if grace.is_zero() {
            contexts.remove(context_id);
            debug!(context_id = %context_id, entries = entries.len(), "Console capture stopped and removed");
            return entries;
        }

        let pending = PendingCleanup {
            context_id: context_id.to_string(),
            scheduled_at: Utc::now(),
            grace,
            deadline: Instant::now() + grace,
            generation: self.inner.generation.fetch_add(1, Ordering::SeqCst),
            token: CancellationToken::new(),
        };
        self.spawn_cleanup_timer(&pending);
        self.inner
            .pending
            .lock()
            .insert(context_id.to_string(), pending);

        debug!(
            context_id = %context_id,
            entries = entries.len(),
            grace_ms = grace.as_millis() as u64,
            "Console capture stopped"
        );
        entries
    }

    /// Removes a buffer immediately, cancelling any pending cleanup.
    pub fn clear_buffer(&self, context_id: &str) -> bool {
        let removed = self.inner.contexts.write().remove(context_id).is_some();
        if let Some(pending) = self.inner.pending.lock().remove(context_id) {
            pending.token.cancel();
        }
        if removed {
            debug!(context_id = %context_id, "Console buffer cleared");
        }
        removed
    }

    /// Routes one console call into `context_id`'s buffer. Returns `false`
    /// (and drops the call) for unknown contexts or when capture is disabled.
    pub fn ingest(&self, context_id: &str, level: LogLevel, args: &[ConsoleArg]) -> bool {
        self.inner.ingest_args(context_id, level, args)
    }

    /// Routes a pre-built entry into `context_id`'s buffer.
    pub fn ingest_entry(&self, context_id: &str, entry: ConsoleEntry) -> bool {
        self.inner.ingest_entry(context_id, entry)
    }

    /// Snapshot of the entries currently buffered for `context_id`.
    pub fn get_events(&self, context_id: &str) -> Vec<ConsoleEntry> {
        self.inner
            .contexts
            .read()
            .get(context_id)
            .map(|slot| slot.buffer.get_events().to_vec())
            .unwrap_or_default()
    }

    /// Drains entries that arrived after `stop_capture`.
    pub fn take_late_entries(&self, context_id: &str) -> Vec<ConsoleEntry> {
        let mut contexts = self.inner.contexts.write();
        match contexts.get_mut(context_id) {
            Some(slot) if slot.state == ContextState::Stopped => slot.buffer.take_events(),
            _ => Vec::new(),
        }
    }

    pub fn state(&self, context_id: &str) -> Option<ContextState> {
        self.inner
            .contexts
            .read()
            .get(context_id)
            .map(|slot| slot.state)
    }

    /// Whether `context_id`'s buffer hit its cap.
    pub fn is_truncated(&self, context_id: &str) -> bool {
        self.inner
            .contexts
            .read()
            .get(context_id)
            .map(|slot| slot.buffer.is_truncated())
            .unwrap_or(false)
    }

    pub fn pending_cleanup(&self, context_id: &str) -> Option<PendingCleanup> {
        self.inner.pending.lock().get(context_id).cloned()
    }

    /// Cancels all pending cleanups, drops all buffers and un-patches the
    /// console.
    pub fn reset(&self) {
        self.inner.contexts.write().clear();
        for (_, pending) in self.inner.pending.lock().drain() {
            pending.token.cancel();
        }
        self.inner.interceptor.lock().disable();
        debug!("Console capture reset");
    }

    pub fn get_stats(&self) -> CaptureStats {
        CaptureStats {
            active_buffers: self.inner.contexts.read().len(),
            pending_cleanups: self.inner.pending.lock().len(),
            is_patched: self.inner.interceptor.lock().is_enabled(),
        }
    }

    /// Removes stopped contexts whose grace period has elapsed. Runs
    /// implicitly on start/stop so cleanup also happens without a runtime.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut contexts = self.inner.contexts.write();
        let mut pending = self.inner.pending.lock();
        let expired: Vec<String> = pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.context_id.clone())
            .collect();
        for context_id in expired {
            if let Some(p) = pending.remove(&context_id) {
                p.token.cancel();
            }
            contexts.remove(&context_id);
            trace!(context_id = %context_id, "Grace period elapsed; buffer removed");
        }
    }

    fn ensure_patched(&self) {
        if !self.inner.config.patch_console {
            return;
        }
        let mut interceptor = self.inner.interceptor.lock();
        if interceptor.is_enabled() {
            return;
        }
        let weak_inner: Weak<CaptureInner> = Arc::downgrade(&self.inner);
        let target: Weak<dyn IngestTarget> = weak_inner;
        if let Err(e) = interceptor.enable(target) {
            debug!(error = %e, "Console interception unavailable; only direct ingestion is captured");
        }
    }

    fn spawn_cleanup_timer(&self, pending: &PendingCleanup) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: sweep_expired picks it up later.
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let token = pending.token.clone();
        let context_id = pending.context_id.clone();
        let generation = pending.generation;
        let grace = pending.grace;

        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&context_id, generation);
                    }
                }
            }
        });
    }
}

impl CaptureInner {
    fn ingest_args(&self, context_id: &str, level: LogLevel, args: &[ConsoleArg]) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut entry = ConsoleEntry::new(level, render_args(args), EntryOrigin::Intercepted);
        if args.iter().any(|a| !matches!(a, ConsoleArg::Str(_))) {
            entry.args = Some(args_to_json(args));
        }
        self.ingest_entry(context_id, entry)
    }

    fn ingest_entry(&self, context_id: &str, entry: ConsoleEntry) -> bool {
        if !self.config.enabled {
            return false;
        }
        let mut contexts = self.contexts.write();
        let Some(slot) = contexts.get_mut(context_id) else {
            return false;
        };
        let hook = self.entry_hook.read().clone();
        let buffer = &mut slot.buffer;
        match hook {
            Some(hook) => {
                let mut add = |entry: ConsoleEntry| buffer.add(entry);
                hook(context_id, entry, &mut add);
            }
            None => {
                buffer.add(entry);
            }
        }
        true
    }

    fn expire(&self, context_id: &str, generation: u64) {
        let mut contexts = self.contexts.write();
        let mut pending = self.pending.lock();
        let current = pending
            .get(context_id)
            .map(|p| p.generation == generation)
            .unwrap_or(false);
        if !current {
            return;
        }
        pending.remove(context_id);
        if matches!(contexts.get(context_id), Some(slot) if slot.state == ContextState::Stopped) {
            contexts.remove(context_id);
            trace!(context_id = %context_id, "Grace period elapsed; buffer removed");
        }
    }
}

impl IngestTarget for CaptureInner {
    fn ingest_call(&self, level: LogLevel, args: &[ConsoleArg]) -> bool {
        match context::current_context() {
            Some(context_id) => self.ingest_args(&context_id, level, args),
            None => false,
        }
    }
}
