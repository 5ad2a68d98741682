//! Exact-key log deduplicator with a bounded, insertion-ordered cache

use crate::normalize::{normalize_message, NormalizeOptions};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;
use testlog_common::{DedupMetadata, Error, LogEntry, LogLevel, Result};
use tracing::{debug, trace};

/// Whether repeats are collapsed across tests or only within one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupScope {
    PerTest,
    #[default]
    Global,
}

/// Deduplicator configuration; fixed once the deduplicator is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    pub max_cache_entries: usize,
    /// Record the test ids that produced each message
    pub include_sources: bool,
    pub normalize_whitespace: bool,
    pub strip_timestamps: bool,
    pub strip_ansi_codes: bool,
    pub scope: DedupScope,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_entries: 10_000,
            include_sources: true,
            normalize_whitespace: true,
            strip_timestamps: true,
            strip_ansi_codes: true,
            scope: DedupScope::Global,
        }
    }
}

impl DeduplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_entries == 0 {
            return Err(Error::validation("max_cache_entries must be greater than 0"));
        }
        Ok(())
    }

    fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            strip_ansi_codes: self.strip_ansi_codes,
            strip_timestamps: self.strip_timestamps,
            normalize_whitespace: self.normalize_whitespace,
        }
    }
}

/// One cached message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationEntry {
    pub key: String,
    pub log_level: LogLevel,
    pub original_message: String,
    pub normalized_message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub sources: BTreeSet<String>,
}

impl DeduplicationEntry {
    /// Metadata attached to the retained copy of a collapsed repeat.
    pub fn metadata(&self) -> DedupMetadata {
        DedupMetadata {
            count: self.count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            sources: self.sources.iter().cloned().collect(),
        }
    }
}

/// Counters since construction or the last [`LogDeduplicator::clear`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeduplicationStats {
    pub total_logs: u64,
    pub unique_logs: u64,
    pub duplicates_removed: u64,
    pub cache_size: usize,
    pub processing_time_ms: f64,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<String, DeduplicationEntry>,
    /// Insertion order; front is evicted first
    order: VecDeque<String>,
    total_logs: u64,
    unique_logs: u64,
    duplicates_removed: u64,
    processing_time_ms: f64,
}

/// Process-wide deduplicator shared by all contexts
pub struct LogDeduplicator {
    config: DeduplicationConfig,
    cache: Mutex<Cache>,
}

/// Cache key and normalized text of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedLog {
    pub key: String,
    pub normalized: String,
}

fn escape_key_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

impl std::fmt::Debug for LogDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDeduplicator")
            .field("config", &self.config)
            .field("cache_size", &self.cache.lock().entries.len())
            .finish()
    }
}

impl LogDeduplicator {
    pub fn new(config: DeduplicationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache: Mutex::new(Cache::default()),
        })
    }

    pub fn config(&self) -> &DeduplicationConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Stable key for `entry`: the scope prefix, level and normalized text.
    pub fn generate_key(&self, entry: &LogEntry) -> String {
        self.prepare(entry).key
    }

    /// Normalizes `entry` once, for a later [`record`](Self::record).
    pub fn prepare(&self, entry: &LogEntry) -> PreparedLog {
        let normalized = normalize_message(&entry.message, self.config.normalize_options());
        PreparedLog {
            key: self.key_for(entry, &normalized),
            normalized,
        }
    }

    fn key_for(&self, entry: &LogEntry, normalized: &str) -> String {
        match self.config.scope {
            DedupScope::Global => format!("{}:{}", entry.level, normalized),
            // The test id is escaped so that a ':' inside it cannot shift
            // the field boundaries.
            DedupScope::PerTest => format!(
                "{}:{}:{}",
                escape_key_part(entry.test_id.as_deref().unwrap_or("")),
                entry.level,
                normalized
            ),
        }
    }

    /// Records `entry` and returns true when it repeats a cached message.
    ///
    /// Disabled deduplicators return false and record nothing.
    pub fn is_duplicate(&self, entry: &LogEntry) -> bool {
        if !self.config.enabled {
            return false;
        }
        let prepared = self.prepare(entry);
        self.record(prepared, entry)
    }

    /// Records an entry already run through [`prepare`](Self::prepare);
    /// returns true when it repeats a cached message.
    pub fn record(&self, prepared: PreparedLog, entry: &LogEntry) -> bool {
        if !self.config.enabled {
            return false;
        }
        let started = Instant::now();
        let PreparedLog { key, normalized } = prepared;

        let mut guard = self.cache.lock();
        let cache = &mut *guard;
        cache.total_logs += 1;

        let duplicate = if let Some(existing) = cache.entries.get_mut(&key) {
            existing.count += 1;
            existing.last_seen = entry.timestamp;
            if self.config.include_sources {
                if let Some(test_id) = &entry.test_id {
                    existing.sources.insert(test_id.clone());
                }
            }
            cache.duplicates_removed += 1;
            true
        } else {
            if cache.entries.len() >= self.config.max_cache_entries {
                if let Some(oldest) = cache.order.pop_front() {
                    cache.entries.remove(&oldest);
                    trace!(key = %oldest, "Evicted oldest dedup entry");
                }
            }
            let mut sources = BTreeSet::new();
            if self.config.include_sources {
                if let Some(test_id) = &entry.test_id {
                    sources.insert(test_id.clone());
                }
            }
            cache.entries.insert(
                key.clone(),
                DeduplicationEntry {
                    key: key.clone(),
                    log_level: entry.level,
                    original_message: entry.message.clone(),
                    normalized_message: normalized,
                    first_seen: entry.timestamp,
                    last_seen: entry.timestamp,
                    count: 1,
                    sources,
                },
            );
            cache.order.push_back(key);
            cache.unique_logs += 1;
            false
        };

        cache.processing_time_ms += started.elapsed().as_secs_f64() * 1000.0;
        duplicate
    }

    pub fn get_entry(&self, key: &str) -> Option<DeduplicationEntry> {
        self.cache.lock().entries.get(key).cloned()
    }

    /// Cached entries, oldest first.
    pub fn entries(&self) -> Vec<DeduplicationEntry> {
        let cache = self.cache.lock();
        cache
            .order
            .iter()
            .filter_map(|key| cache.entries.get(key).cloned())
            .collect()
    }

    pub fn get_stats(&self) -> DeduplicationStats {
        let cache = self.cache.lock();
        DeduplicationStats {
            total_logs: cache.total_logs,
            unique_logs: cache.unique_logs,
            duplicates_removed: cache.duplicates_removed,
            cache_size: cache.entries.len(),
            processing_time_ms: cache.processing_time_ms,
        }
    }

    /// Drops every cached entry and resets the counters.
    pub fn clear(&self) {
        let mut cache = self.cache.lock();
        let dropped = cache.entries.len();
        *cache = Cache::default();
        debug!(dropped, "Deduplication cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup(config: DeduplicationConfig) -> LogDeduplicator {
        LogDeduplicator::new(config).unwrap()
    }

    #[test]
    fn test_repeat_increments_count() {
        let d = dedup(DeduplicationConfig::default());
        let entry = LogEntry::new(LogLevel::Warn, "disk almost full").with_test_id("t1");

        assert!(!d.is_duplicate(&entry));
        for expected in 2..=4 {
            assert!(d.is_duplicate(&entry));
            let key = d.generate_key(&entry);
            assert_eq!(d.get_entry(&key).unwrap().count, expected);
        }

        let stats = d.get_stats();
        assert_eq!(stats.total_logs, 4);
        assert_eq!(stats.unique_logs, 1);
        assert_eq!(stats.duplicates_removed, 3);
        assert_eq!(stats.cache_size, 1);
    }

    #[test]
    fn test_normalized_variants_collapse() {
        let d = dedup(DeduplicationConfig::default());
        assert!(!d.is_duplicate(&LogEntry::new(
            LogLevel::Error,
            "2024-01-01T00:00:00Z \x1b[31mDB   down\x1b[0m"
        )));
        assert!(d.is_duplicate(&LogEntry::new(LogLevel::Error, "db down")));
        // Same text at another level is a different key.
        assert!(!d.is_duplicate(&LogEntry::new(LogLevel::Warn, "db down")));
    }

    #[test]
    fn test_fifo_eviction() {
        let d = dedup(DeduplicationConfig {
            max_cache_entries: 10,
            ..DeduplicationConfig::default()
        });
        let entries: Vec<LogEntry> = (0..20)
            .map(|i| LogEntry::new(LogLevel::Log, format!("message number {}", i)))
            .collect();
        for entry in &entries {
            assert!(!d.is_duplicate(entry));
        }

        let stats = d.get_stats();
        assert_eq!(stats.cache_size, 10);
        assert_eq!(stats.unique_logs, 20);
        for entry in &entries[..10] {
            assert!(d.get_entry(&d.generate_key(entry)).is_none());
        }
        for entry in &entries[10..] {
            assert!(d.get_entry(&d.generate_key(entry)).is_some());
        }
    }

    #[test]
    fn test_eviction_ignores_recent_access() {
        let d = dedup(DeduplicationConfig {
            max_cache_entries: 2,
            ..DeduplicationConfig::default()
        });
        let hot = LogEntry::new(LogLevel::Log, "hot");
        d.is_duplicate(&hot);
        d.is_duplicate(&LogEntry::new(LogLevel::Log, "b"));
        assert!(d.is_duplicate(&hot));
        d.is_duplicate(&LogEntry::new(LogLevel::Log, "c"));

        assert!(d.get_entry(&d.generate_key(&hot)).is_none());
        let keys: Vec<String> = d.entries().into_iter().map(|e| e.original_message).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_sources_tracked_when_enabled() {
        let d = dedup(DeduplicationConfig::default());
        d.is_duplicate(&LogEntry::new(LogLevel::Log, "same").with_test_id("b"));
        d.is_duplicate(&LogEntry::new(LogLevel::Log, "same").with_test_id("a"));
        d.is_duplicate(&LogEntry::new(LogLevel::Log, "same").with_test_id("a"));
        let entry = &d.entries()[0];
        assert_eq!(entry.count, 3);
        assert_eq!(entry.metadata().sources, vec!["a", "b"]);

        let quiet = dedup(DeduplicationConfig {
            include_sources: false,
            ..DeduplicationConfig::default()
        });
        quiet.is_duplicate(&LogEntry::new(LogLevel::Log, "same").with_test_id("a"));
        assert!(quiet.entries()[0].sources.is_empty());
    }

    #[test]
    fn test_per_test_scope() {
        let d = dedup(DeduplicationConfig {
            scope: DedupScope::PerTest,
            ..DeduplicationConfig::default()
        });
        assert!(!d.is_duplicate(&LogEntry::new(LogLevel::Log, "ready").with_test_id("a")));
        assert!(!d.is_duplicate(&LogEntry::new(LogLevel::Log, "ready").with_test_id("b")));
        assert!(d.is_duplicate(&LogEntry::new(LogLevel::Log, "ready").with_test_id("a")));
    }

    #[test]
    fn test_per_test_key_survives_colon_in_test_id() {
        let d = dedup(DeduplicationConfig {
            scope: DedupScope::PerTest,
            ..DeduplicationConfig::default()
        });
        let plain = LogEntry::new(LogLevel::Log, "log:x").with_test_id("a");
        let colon = LogEntry::new(LogLevel::Log, "x").with_test_id("a:log");
        assert_ne!(d.generate_key(&plain), d.generate_key(&colon));
        assert!(!d.is_duplicate(&plain));
        assert!(!d.is_duplicate(&colon));
        assert_eq!(d.get_stats().unique_logs, 2);

        let escaped = LogEntry::new(LogLevel::Log, "x").with_test_id("a%3Alog");
        assert_ne!(d.generate_key(&colon), d.generate_key(&escaped));
    }

    #[test]
    fn test_prepare_then_record() {
        let d = dedup(DeduplicationConfig::default());
        let entry = LogEntry::new(LogLevel::Warn, "  Disk FULL ");
        let prepared = d.prepare(&entry);
        assert_eq!(prepared.key, d.generate_key(&entry));
        assert_eq!(d.get_stats().total_logs, 0);

        assert!(!d.record(prepared.clone(), &entry));
        assert!(d.record(prepared, &entry));
        let cached = d.get_entry(&d.generate_key(&entry)).unwrap();
        assert_eq!(cached.normalized_message, d.prepare(&entry).normalized);
        assert_eq!(cached.count, 2);
    }

    #[test]
    fn test_disabled_does_no_bookkeeping() {
        let d = dedup(DeduplicationConfig {
            enabled: false,
            ..DeduplicationConfig::default()
        });
        let entry = LogEntry::new(LogLevel::Log, "x");
        assert!(!d.is_enabled());
        assert!(!d.is_duplicate(&entry));
        assert!(!d.is_duplicate(&entry));
        assert_eq!(d.get_stats(), DeduplicationStats::default());
    }

    #[test]
    fn test_clear_resets_counters() {
        let d = dedup(DeduplicationConfig::default());
        let entry = LogEntry::new(LogLevel::Log, "x");
        d.is_duplicate(&entry);
        d.is_duplicate(&entry);
        d.clear();
        assert_eq!(d.get_stats().total_logs, 0);
        assert!(!d.is_duplicate(&entry));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = LogDeduplicator::new(DeduplicationConfig {
            max_cache_entries: 0,
            ..DeduplicationConfig::default()
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_config_from_yaml_style_json() {
        let config: DeduplicationConfig =
            serde_json::from_str(r#"{"max_cache_entries": 5, "scope": "per-test"}"#).unwrap();
        assert_eq!(config.max_cache_entries, 5);
        assert_eq!(config.scope, DedupScope::PerTest);
        assert!(config.strip_ansi_codes);
    }
}
