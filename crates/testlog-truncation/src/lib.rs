//! # testlog truncation
//!
//! Keeps an assembled report within a token budget.
//!
//! Token counts are a heuristic (`ceil(chars / chars_per_token)`), not a
//! tokenizer. [`TruncationPolicy`] drops whole sections, lowest priority
//! first, so the output never contains a half-written record.

pub mod estimator;
pub mod policy;

pub use estimator::{TokenEstimator, DEFAULT_CHARS_PER_TOKEN};
pub use policy::{
    assemble, Section, SectionPriority, TruncationConfig, TruncationPolicy, TruncationResult,
    SECTION_SEPARATOR,
};
