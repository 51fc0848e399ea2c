use std::sync::Mutex;

/// Receives `(message, percent)` updates as the pipeline advances.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: &str, percent: u8);
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&self, message: &str, percent: u8) {
        tracing::info!(percent, "{message}");
    }
}

/// Keeps every update in memory.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<(String, u8)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(String, u8)> {
        self.updates
            .lock()
            .map(|updates| updates.clone())
            .unwrap_or_default()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, message: &str, percent: u8) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((message.to_owned(), percent));
        }
    }
}
