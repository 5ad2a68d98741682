//! Report and status types of the unit log pipeline

use serde::Serialize;
use testlog_capture::CaptureStats;
use testlog_common::UnitLogs;
use testlog_dedup::{DeduplicationGroup, DeduplicationStats, FailureRecord};

/// Service-wide status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub active_units: usize,
    pub finished_units: usize,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub capture: CaptureStats,
    pub deduplication: DeduplicationStats,
}

/// Batch of finished units after grouping and truncation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogReport {
    pub summary: String,
    /// Units in finish order; units whose log section was dropped keep
    /// their status with an empty entry list
    pub units: Vec<UnitLogs>,
    /// Ungrouped failures plus one representative per group
    pub failures: Vec<FailureRecord>,
    pub failure_groups: Vec<DeduplicationGroup>,
    pub dropped_sections: Vec<String>,
    pub estimated_tokens: usize,
    pub within_budget: bool,
}
