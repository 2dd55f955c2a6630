//! Ordered log of substrate calls

use std::sync::{Arc, Mutex, MutexGuard};

/// Records every substrate call as `op(device, detail)` in call order
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record(&self, op: &str, device: &str, detail: impl std::fmt::Display) {
        self.lock().push(format!("{}({}, {})", op, device, detail));
    }

    /// All calls so far
    pub fn calls(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Calls to one operation, e.g. `"release_link"`
    pub fn calls_matching(&self, op: &str) -> Vec<String> {
        let prefix = format!("{}(", op);
        self.lock()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Position of the first call to `op` on `device`
    pub fn position(&self, op: &str, device: &str) -> Option<usize> {
        let prefix = format!("{}({},", op, device);
        self.lock().iter().position(|c| c.starts_with(&prefix))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
