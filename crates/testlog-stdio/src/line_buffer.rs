//! Chunk-to-line reassembly and per-line filtering

use crate::filter::FilterRule;
use std::sync::Arc;
use testlog_common::SuppressedSummary;

/// Longest incomplete line held back before it is forced out
pub const DEFAULT_MAX_PENDING: usize = 64 * 1024;

/// Holds the incomplete trailing line between writes.
///
/// A line that grows past the pending limit without a `\n` is emitted in
/// limit-sized segments, cut at a UTF-8 boundary where possible.
#[derive(Debug)]
pub struct LineAccumulator {
    pending: Vec<u8>,
    max_pending: usize,
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator holding at most `max_pending` bytes (at least 1).
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Appends `chunk` and returns every line it completed, each including
    /// its trailing `\n`, followed by any forced segments of an overlong
    /// unterminated line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset + 1;
            lines.push(self.pending[start..end].to_vec());
            start = end;
        }
        while self.pending.len() - start > self.max_pending {
            let end = start + split_point(&self.pending[start..], self.max_pending);
            lines.push(self.pending[start..end].to_vec());
            start = end;
        }
        if start > 0 {
            self.pending.drain(..start);
        }
        lines
    }

    /// Takes the incomplete trailing segment, if any.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Verdict for one line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDecision {
    Pass,
    Suppress,
}

/// Line-buffered filter for one stream
#[derive(Debug)]
pub struct StreamFilter {
    rule: Arc<FilterRule>,
    /// When false every line passes; the stream is only counted.
    active: bool,
    accumulator: LineAccumulator,
    counts: SuppressedSummary,
}

impl StreamFilter {
    pub fn new(rule: Arc<FilterRule>, active: bool) -> Self {
        Self {
            rule,
            active,
            accumulator: LineAccumulator::new(),
            counts: SuppressedSummary::default(),
        }
    }

    /// Caps the incomplete trailing line at `max_line_bytes`.
    pub fn with_line_limit(mut self, max_line_bytes: usize) -> Self {
        self.accumulator = LineAccumulator::with_limit(max_line_bytes);
        self
    }

    /// Feeds one raw write and returns decisions for the lines it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<(Vec<u8>, LineDecision)> {
        self.accumulator
            .push(chunk)
            .into_iter()
            .map(|line| {
                let decision = self.decide(&line);
                (line, decision)
            })
            .collect()
    }

    /// Flushes the incomplete trailing line.
    ///
    /// With `filter_remainder == false` the remainder always passes, since a
    /// partial line cannot be judged reliably.
    pub fn finish(&mut self, filter_remainder: bool) -> Option<(Vec<u8>, LineDecision)> {
        let remainder = self.accumulator.take_remainder()?;
        let decision = if filter_remainder {
            self.decide(&remainder)
        } else {
            self.counts.total_lines += 1;
            LineDecision::Pass
        };
        Some((remainder, decision))
    }

    pub fn counts(&self) -> SuppressedSummary {
        self.counts
    }

    pub fn has_pending(&self) -> bool {
        self.accumulator.pending_len() > 0
    }

    fn decide(&mut self, line: &[u8]) -> LineDecision {
        self.counts.total_lines += 1;
        if !self.active {
            return LineDecision::Pass;
        }
        let text = String::from_utf8_lossy(strip_line_ending(line));
        if self.rule.matches(&text) {
            self.counts.suppressed_lines += 1;
            LineDecision::Suppress
        } else {
            LineDecision::Pass
        }
    }
}

/// Cut position at most `limit` bytes in that does not split a UTF-8
/// sequence, unless the whole prefix is continuation bytes.
fn split_point(bytes: &[u8], limit: usize) -> usize {
    (1..=limit)
        .rev()
        .find(|&i| i == bytes.len() || (bytes[i] & 0b1100_0000) != 0b1000_0000)
        .unwrap_or(limit)
}

/// Line content without its trailing `\n` / `\r\n`.
pub fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
