//! `tracing` bridge: events emitted inside an active capture context are
//! recorded into that context's buffer.

use crate::capture::ConsoleCapture;
use crate::context::current_context;
use std::fmt::Write as _;
use testlog_common::{ConsoleEntry, EntryOrigin, LogLevel};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Events from our own targets are never captured, or capture bookkeeping
/// would feed back into itself.
const OWN_TARGET_PREFIX: &str = "testlog";

/// Layer that routes events into [`ConsoleCapture`] by active context
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    capture: ConsoleCapture,
}

impl CaptureLayer {
    pub fn new(capture: ConsoleCapture) -> Self {
        Self { capture }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(OWN_TARGET_PREFIX) {
            return;
        }
        let Some(context_id) = current_context() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let entry = ConsoleEntry::new(
            level_for(metadata.level()),
            visitor.finish(),
            EntryOrigin::Intercepted,
        );
        self.capture.ingest_entry(&context_id, entry);
    }
}

fn level_for(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }

    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureConfig;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture() -> ConsoleCapture {
        ConsoleCapture::new(CaptureConfig {
            patch_console: false,
            ..CaptureConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_events_in_context_are_captured() {
        let capture = capture();
        capture.start_capture("A");
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(capture.clone()));

        tracing::subscriber::with_default(subscriber, || {
            capture.run_with_capture_sync("A", || {
                tracing::info!(target: "app", user = "bob", attempt = 2, "hello");
                tracing::warn!(target: "app", "careful");
            });
            tracing::info!(target: "app", "outside any context");
        });

        let entries = capture.stop_capture("A");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "hello user=bob attempt=2");
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].text, "careful");
        assert_eq!(entries[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_own_targets_are_ignored() {
        let capture = capture();
        capture.start_capture("A");
        let subscriber = tracing_subscriber::registry().with(CaptureLayer::new(capture.clone()));

        tracing::subscriber::with_default(subscriber, || {
            capture.run_with_capture_sync("A", || {
                tracing::info!(target: "testlog::capture", "internal");
            });
        });

        assert!(capture.stop_capture("A").is_empty());
    }
}
