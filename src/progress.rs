//! Progress reporting and cooperative cancellation for long archive and copy
//! operations.

use crate::error::{PluginError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancel switch. Clones observe the same flag, so the shell keeps one
/// and hands another to the worker running the operation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A single step of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress<'a> {
    pub done: usize,
    pub total: usize,
    pub current: &'a str,
}

pub type ProgressFn = dyn Fn(Progress<'_>) + Send + Sync;

/// Cancellation and progress plumbing passed into every long operation.
#[derive(Clone, Default)]
pub struct Control {
    cancel: CancelFlag,
    observer: Option<Arc<ProgressFn>>,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, observer: impl Fn(Progress<'_>) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Fails with [`PluginError::Cancelled`] once the flag is raised. Called
    /// between entries, never in the middle of one.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PluginError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report(&self, done: usize, total: usize, current: &str) {
        if let Some(observer) = &self.observer {
            observer(Progress {
                done,
                total,
                current,
            });
        }
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("cancel", &self.cancel)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn checkpoint_fails_after_cancel() {
        let flag = CancelFlag::new();
        let control = Control::new().with_cancel(flag.clone());
        assert!(control.checkpoint().is_ok());

        flag.cancel();
        assert!(matches!(control.checkpoint(), Err(PluginError::Cancelled)));
    }

    #[test]
    fn report_reaches_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let control = Control::new().with_progress(move |p| {
            sink.lock().unwrap().push((p.done, p.total, p.current.to_string()));
        });

        control.report(1, 2, "a.txt");
        control.report(2, 2, "b.txt");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (2, 2, "b.txt".to_string()));
    }
}
