//! Progress reporting.
//!
//! The progress callback is the sole interface between the orchestrator and
//! any presentation layer. Every significant stage transition emits one
//! formatted status line through it.

use std::sync::Arc;

/// Callback invoked with a formatted status string at each stage transition.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Arc<dyn Fn(&str) + Send + Sync>,
}

impl ProgressReporter {
    /// Wrap a callback function.
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self { callback: Arc::new(callback) }
    }

    /// A reporter that discards everything (tests, embedding).
    pub fn sink() -> Self {
        Self::new(|_| {})
    }

    /// Emit one status line.
    pub fn emit(&self, message: impl AsRef<str>) {
        (self.callback)(message.as_ref());
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressReporter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_reporter_forwards_messages() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter = ProgressReporter::new(move |msg| sink.lock().unwrap().push(msg.to_string()));

        reporter.emit("Creating volume web-modules");
        reporter.emit("Installing dependencies for web");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("web-modules"));
    }
}
