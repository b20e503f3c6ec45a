//! # Built-in line logger (demo/reference only).
//!
//! [`LogWriter`] prints one line per event to stderr. It exists so small
//! programs and demos get readable output without wiring a real
//! observability stack; production users implement
//! [`Subscribe`](crate::subscribers::Subscribe) themselves.

use async_trait::async_trait;

use crate::events::{Event, EventKind};

use super::Subscribe;

/// Prints events as single lines to stderr.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Creates a new writer.
    pub fn new() -> Self {
        Self
    }

    fn format(event: &Event) -> String {
        let mut line = format!("[activisor] seq={} {:?}", event.seq, event.kind);
        if let Some(activity) = &event.activity {
            line.push_str(&format!(" activity={activity}"));
        }
        if let Some(device) = &event.device {
            line.push_str(&format!(" device={device}"));
        }
        if let Some(predecessor) = &event.predecessor {
            line.push_str(&format!(" after={predecessor}"));
        }
        if let Some(status) = event.status {
            line.push_str(&format!(" status={}", status.as_label()));
        }
        if let Some(reason) = &event.reason {
            line.push_str(&format!(" reason={reason}"));
        }
        line
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, event: &Event) {
        eprintln!("{}", Self::format(event));
    }

    fn name(&self) -> &'static str {
        "log_writer"
    }

    fn queue_capacity(&self) -> usize {
        512
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_includes_fields() {
        let ev = Event::new(EventKind::TakeoverChained)
            .with_activity("pick")
            .with_predecessor("approach");
        let line = LogWriter::format(&ev);
        assert!(line.contains("TakeoverChained"));
        assert!(line.contains("activity=pick"));
        assert!(line.contains("after=approach"));
    }
}
