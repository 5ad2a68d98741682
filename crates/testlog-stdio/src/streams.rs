//! Process-wide stdout/stderr writer slots.
//!
//! Output meant for the terminal goes through [`stdout`]/[`stderr`] (or
//! [`write_stream`]), which forward to whatever writer currently occupies
//! the stream's slot. By default the slots hold the real process streams.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::io::{self, Write};
use std::sync::Arc;
use testlog_common::StreamType;

/// Raw byte sink behind a stream slot
pub trait RawWriter: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub type WriterHandle = Arc<dyn RawWriter>;

struct ProcessStdout;

impl RawWriter for ProcessStdout {
    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        io::stdout().lock().write_all(bytes)
    }

    fn flush(&self) -> io::Result<()> {
        io::stdout().lock().flush()
    }
}

struct ProcessStderr;

impl RawWriter for ProcessStderr {
    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        io::stderr().lock().write_all(bytes)
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().lock().flush()
    }
}

lazy_static! {
    static ref STDOUT_SLOT: RwLock<WriterHandle> = RwLock::new(Arc::new(ProcessStdout));
    static ref STDERR_SLOT: RwLock<WriterHandle> = RwLock::new(Arc::new(ProcessStderr));
}

fn slot(stream: StreamType) -> &'static RwLock<WriterHandle> {
    match stream {
        StreamType::Stdout => &STDOUT_SLOT,
        StreamType::Stderr => &STDERR_SLOT,
    }
}

/// Writer currently installed for `stream`.
pub fn current_writer(stream: StreamType) -> WriterHandle {
    Arc::clone(&*slot(stream).read())
}

/// Installs `writer` for `stream`, returning the previous one.
pub fn replace_writer(stream: StreamType, writer: WriterHandle) -> WriterHandle {
    std::mem::replace(&mut *slot(stream).write(), writer)
}

/// Writes raw bytes through the stream's current writer.
pub fn write_stream(stream: StreamType, bytes: &[u8]) -> io::Result<()> {
    // Clone out of the lock: writers may write to the other stream.
    let writer = current_writer(stream);
    writer.write_bytes(bytes)
}

/// `io::Write` adapter over a stream slot
#[derive(Debug, Clone, Copy)]
pub struct StdioWriter {
    stream: StreamType,
}

impl Write for StdioWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_stream(self.stream, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        current_writer(self.stream).flush()
    }
}

pub fn stdout() -> StdioWriter {
    StdioWriter {
        stream: StreamType::Stdout,
    }
}

pub fn stderr() -> StdioWriter {
    StdioWriter {
        stream: StreamType::Stderr,
    }
}

/// In-memory writer, handy as a slot occupant in tests and for tee-ing
#[derive(Default)]
pub struct MemoryWriter {
    bytes: parking_lot::Mutex<Vec<u8>>,
}

impl MemoryWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl RawWriter for MemoryWriter {
    fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        self.bytes.lock().extend_from_slice(bytes);
        Ok(())
    }
}
