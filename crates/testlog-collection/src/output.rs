//! Output writers for finished unit records

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testlog_common::{Error, Result, UnitLogs};

/// Trait for writing unit records to various outputs
pub trait OutputWriter: Send + Sync {
    /// Write one unit record
    fn write(&mut self, record: &UnitLogs) -> Result<()>;

    /// Flush any buffered output
    fn flush(&mut self) -> Result<()>;

    /// Close the output writer
    fn close(&mut self) -> Result<()>;
}

/// JSON Lines file writer, one record per line
pub struct JsonLinesFileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonLinesFileWriter {
    /// Opens `path` for appending, creating parent directories if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::from(e).context(format!("Failed to create log directory: {}", parent.display()))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::from(e).context(format!("Failed to open log file: {}", path.display())))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputWriter for JsonLinesFileWriter {
    fn write(&mut self, record: &UnitLogs) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| Error::from(e).context("Failed to write to log file"))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| Error::from(e).context("Failed to flush log file"))
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Pretty-printed JSON on the real process stdout.
///
/// Writes bypass the stdio stream slots so report output is never filtered.
#[derive(Debug, Default)]
pub struct StdoutJsonWriter;

impl OutputWriter for StdoutJsonWriter {
    fn write(&mut self, record: &UnitLogs) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", json).map_err(|e| Error::from(e).context("Failed to write to stdout"))
    }

    fn flush(&mut self) -> Result<()> {
        std::io::stdout()
            .flush()
            .map_err(|e| Error::from(e).context("Failed to flush stdout"))
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// In-memory writer keeping the last `max_records` records
#[derive(Debug, Clone)]
pub struct MemoryOutputWriter {
    records: Arc<Mutex<VecDeque<UnitLogs>>>,
    max_records: usize,
}

impl MemoryOutputWriter {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(max_records.min(1024)))),
            max_records,
        }
    }

    /// Clones share storage, so a clone kept by the caller sees what the
    /// service writes.
    pub fn records(&self) -> Vec<UnitLogs> {
        self.records.lock().iter().cloned().collect()
    }
}

impl OutputWriter for MemoryOutputWriter {
    fn write(&mut self, record: &UnitLogs) -> Result<()> {
        let mut records = self.records.lock();
        records.push_back(record.clone());
        while records.len() > self.max_records {
            records.pop_front();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testlog_common::{ConsoleEntry, EntryOrigin, LogLevel, UnitStatus};

    fn record(unit_id: &str) -> UnitLogs {
        UnitLogs {
            unit_id: unit_id.to_string(),
            status: UnitStatus::Passed,
            entries: vec![ConsoleEntry::new(LogLevel::Log, "hello", EntryOrigin::Intercepted)],
            suppressed: None,
        }
    }

    #[test]
    fn test_json_lines_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("units.jsonl");

        let mut writer = JsonLinesFileWriter::new(&path).unwrap();
        writer.write(&record("a")).unwrap();
        writer.close().unwrap();

        let mut writer = JsonLinesFileWriter::new(&path).unwrap();
        writer.write(&record("b")).unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = content
            .lines()
            .map(|line| serde_json::from_str::<UnitLogs>(line).unwrap().unit_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_memory_writer_keeps_last_records() {
        let memory = MemoryOutputWriter::new(2);
        let mut writer = memory.clone();
        for id in ["a", "b", "c"] {
            writer.write(&record(id)).unwrap();
        }
        let ids: Vec<String> = memory.records().into_iter().map(|r| r.unit_id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
