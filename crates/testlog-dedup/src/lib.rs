//! # testlog dedup
//!
//! Two levels of deduplication:
//!
//! - [`LogDeduplicator`] collapses *identical* log lines. Messages are
//!   normalized (ANSI codes, timestamps, whitespace, case) into a stable key;
//!   a repeat bumps the stored entry instead of being emitted again. The
//!   cache is bounded and evicts in insertion order.
//! - [`DeduplicationService`] groups *similar* failures using the blended
//!   similarity score and extracts a shared template per group.

pub mod deduplicator;
pub mod normalize;
pub mod service;

pub use deduplicator::{
    DedupScope, DeduplicationConfig, DeduplicationEntry, DeduplicationStats, LogDeduplicator,
    PreparedLog,
};
pub use normalize::{normalize_message, NormalizeOptions};
pub use service::{
    extract_template, mask_volatile, CompressionResult, DeduplicationGroup, DeduplicationService,
    FailureRecord, GroupingOptions, Template,
};
