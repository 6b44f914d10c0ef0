//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Callback invoked by long-running operations, at most once per frame,
/// batch, or iteration. Receives a status line and a completion fraction in
/// `[0, 1]`; returning `false` requests cancellation.
pub type ProgressCallback = Box<dyn FnMut(&str, f64) -> bool + Send>;

/// Shared progress handler for the long-running pipeline stages.
///
/// The handler is polled *between* units of work only, so a cancelled
/// operation never leaves a peak half-written: peaks already processed keep
/// their results, the rest stay untouched.
#[derive(Default)]
pub struct ProgressHandler {
    callback: Mutex<Option<ProgressCallback>>,
    cancelled: AtomicBool,
}

impl ProgressHandler {
    /// Create a handler with no callback attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the callback receiving status updates.
    pub fn set_callback(&self, callback: ProgressCallback) {
        *self.callback.lock().expect("progress callback poisoned") = Some(callback);
    }

    /// Report progress. Returns `false` if cancellation was requested,
    /// either by the callback or by an earlier call to [`Self::cancel`].
    pub fn update(&self, status: &str, fraction: f64) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return false;
        }
        let mut guard = self.callback.lock().expect("progress callback poisoned");
        if let Some(callback) = guard.as_mut() {
            if !callback(status, fraction) {
                self.cancelled.store(true, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    /// Request cancellation from outside the callback.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_cancels() {
        let handler = ProgressHandler::new();
        let mut calls = 0;
        handler.set_callback(Box::new(move |_, fraction| {
            calls += 1;
            fraction < 0.5
        }));
        assert!(handler.update("stage", 0.1));
        assert!(!handler.update("stage", 0.9));
        // once cancelled, stays cancelled
        assert!(!handler.update("stage", 0.1));
        assert!(handler.cancelled());
    }

    #[test]
    fn no_callback_never_cancels() {
        let handler = ProgressHandler::new();
        assert!(handler.update("stage", 1.0));
        handler.cancel();
        assert!(!handler.update("stage", 1.0));
    }
}
