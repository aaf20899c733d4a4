//! Diagnostic output
//!
//! Failures and listener log messages become one human-readable line each,
//! prefixed with the rule or pair id. Where the line goes is up to the sink.

use std::sync::{Arc, Mutex};

/// Receiver of diagnostic lines
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, line: &str);
}

/// Sink forwarding every line to `tracing` at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, line: &str) {
        tracing::warn!("{}", line);
    }
}

/// Sink keeping every line in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Whether any line contains every one of `needles`
    pub fn contains(&self, needles: &[&str]) -> bool {
        self.lines()
            .iter()
            .any(|line| needles.iter().all(|n| line.contains(n)))
    }
}

impl DiagnosticSink for MemorySink {
    fn report(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_lines() {
        let sink = MemorySink::new();
        let shared = sink.clone();

        sink.report("Error on A: broken pipe");
        shared.report("Mux open failed for B: Timeout");

        assert_eq!(sink.lines().len(), 2);
        assert!(sink.contains(&["A", "broken pipe"]));
        assert!(sink.contains(&["B", "Timeout"]));
        assert!(!sink.contains(&["A", "Timeout"]));
    }
}
