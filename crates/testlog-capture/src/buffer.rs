//! Per-context console buffer with byte/line caps

use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use testlog_common::{ConsoleEntry, DedupMetadata, EntryOrigin, Error, LogLevel, Result};
use tracing::trace;

/// Size caps for one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50_000,
            max_lines: 1_000,
        }
    }
}

impl BufferLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::validation("max_bytes must be greater than 0"));
        }
        if self.max_lines == 0 {
            return Err(Error::validation("max_lines must be greater than 0"));
        }
        Ok(())
    }
}

/// What happened to an entry passed to [`ConsoleBuffer::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Appended,
    /// Dedup key already recorded; the first occurrence was updated instead.
    Collapsed,
    /// This entry crossed a cap; the truncation warning was appended.
    Truncated,
    /// A cap was crossed earlier; nothing was recorded.
    Rejected,
}

/// Ordered log store owned by one capture context.
///
/// Entries keep arrival order. Once the byte or line cap would be exceeded
/// the buffer appends a single warning entry and rejects everything after.
#[derive(Debug)]
pub struct ConsoleBuffer {
    limits: BufferLimits,
    entries: Vec<ConsoleEntry>,
    bytes: usize,
    lines: usize,
    truncated: bool,
    /// dedup key -> index of first occurrence in `entries`
    seen_keys: HashMap<String, usize>,
}

impl ConsoleBuffer {
    pub fn new(limits: BufferLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            limits,
            entries: Vec::new(),
            bytes: 0,
            lines: 0,
            truncated: false,
            seen_keys: HashMap::new(),
        })
    }

    pub fn add(&mut self, entry: ConsoleEntry) -> AddOutcome {
        if self.truncated {
            return AddOutcome::Rejected;
        }

        if let Some(key) = entry.dedup_key.as_deref() {
            if let Some(&index) = self.seen_keys.get(key) {
                collapse_into(&mut self.entries[index], &entry);
                return AddOutcome::Collapsed;
            }
        }

        let entry_bytes = entry.byte_len();
        let entry_lines = line_count(&entry.text);
        if self.bytes + entry_bytes > self.limits.max_bytes
            || self.lines + entry_lines > self.limits.max_lines
        {
            self.truncated = true;
            trace!(
                bytes = self.bytes,
                lines = self.lines,
                "Console buffer cap reached"
            );
            self.entries.push(self.truncation_entry());
            return AddOutcome::Truncated;
        }

        self.bytes += entry_bytes;
        self.lines += entry_lines;
        if let Some(key) = entry.dedup_key.clone() {
            self.seen_keys.insert(key, self.entries.len());
        }
        self.entries.push(entry);
        AddOutcome::Appended
    }

    /// Entries in arrival order.
    pub fn get_events(&self) -> &[ConsoleEntry] {
        &self.entries
    }

    /// Moves all entries out, leaving counters and the truncation flag intact.
    ///
    /// Dedup keys go with the entries: a repeat added afterwards starts a new
    /// entry, since the first occurrence has already been handed out.
    pub fn take_events(&mut self) -> Vec<ConsoleEntry> {
        self.seen_keys.clear();
        std::mem::take(&mut self.entries)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn byte_count(&self) -> usize {
        self.bytes
    }

    pub fn line_count(&self) -> usize {
        self.lines
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    fn truncation_entry(&self) -> ConsoleEntry {
        ConsoleEntry::new(
            LogLevel::Warn,
            format!(
                "[console output truncated: limit of {} bytes / {} lines reached]",
                self.limits.max_bytes, self.limits.max_lines
            ),
            EntryOrigin::Intercepted,
        )
    }
}

fn line_count(text: &str) -> usize {
    text.split('\n').count()
}

fn collapse_into(first: &mut ConsoleEntry, repeat: &ConsoleEntry) {
    let last_seen = Utc
        .timestamp_millis_opt(repeat.timestamp_ms)
        .single()
        .unwrap_or_else(Utc::now);
    match first.deduplication.as_mut() {
        Some(meta) => {
            meta.count += 1;
            meta.last_seen = last_seen;
        }
        None => {
            let first_seen = Utc
                .timestamp_millis_opt(first.timestamp_ms)
                .single()
                .unwrap_or(last_seen);
            first.deduplication = Some(DedupMetadata {
                count: 2,
                first_seen,
                last_seen,
                sources: Vec::new(),
            });
        }
    }
}
