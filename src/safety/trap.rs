/// Cleanup trap stack
///
/// An ordered list of cleanup actions owned by the session. Actions fire in
/// registration order, all together, at most once per stack. A failing or
/// panicking action is logged and skipped so the ones after it still run.
///
/// Exit paths:
/// - normal return and `?` error returns: [`TrapGuard`] fires on drop
/// - terminating signals: the handler only records the signal; the session
///   turns it into `EnterError::Interrupted` and unwinds through the guard
/// - background launch: [`TrapStack::relocate`] moves the actions into a
///   fresh stack for the forked child and neutralizes the parent's
use crate::config::types::Result;
use log::{debug, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

/// One cleanup action. Must tolerate running when its resource was never acquired.
pub type CleanupAction = Box<dyn FnOnce() -> Result<()> + Send>;

struct TrapEntry {
    label: String,
    action: CleanupAction,
}

/// What happened when a stack fired
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FireReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl FireReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered cleanup actions with exactly-once firing
pub struct TrapStack {
    entries: Vec<TrapEntry>,
    fired: AtomicBool,
}

impl TrapStack {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            fired: AtomicBool::new(false),
        }
    }

    /// Append an action; it runs after every action registered before it
    pub fn register<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        if self.has_fired() {
            warn!("Trap already fired, dropping late cleanup action: {}", label);
            return;
        }
        debug!("Registering cleanup action: {}", label);
        self.entries.push(TrapEntry {
            label,
            action: Box::new(action),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Run every registered action once, in registration order.
    ///
    /// Subsequent calls are no-ops that return an empty report.
    pub fn fire(&mut self) -> FireReport {
        let mut report = FireReport::default();
        if self.fired.swap(true, Ordering::SeqCst) {
            return report;
        }

        let entries = std::mem::take(&mut self.entries);
        if entries.is_empty() {
            return report;
        }
        info!("Running {} cleanup actions", entries.len());

        for entry in entries {
            let label = entry.label;
            match panic::catch_unwind(AssertUnwindSafe(entry.action)) {
                Ok(Ok(())) => {
                    debug!("Cleanup action succeeded: {}", label);
                    report.completed.push(label);
                }
                Ok(Err(e)) => {
                    warn!("Cleanup action {} failed: {}", label, e);
                    report.failed.push(label);
                }
                Err(_) => {
                    warn!("Cleanup action {} panicked", label);
                    report.failed.push(label);
                }
            }
        }

        report
    }

    /// Move all actions into a new stack and neutralize this one.
    ///
    /// Used before forking a background child: the child owns the returned
    /// stack, the parent's stack becomes empty and already-fired.
    pub fn relocate(&mut self) -> TrapStack {
        let relocated = TrapStack {
            entries: std::mem::take(&mut self.entries),
            fired: AtomicBool::new(false),
        };
        self.fired.store(true, Ordering::SeqCst);
        debug!("Relocated {} cleanup actions", relocated.len());
        relocated
    }
}

impl Default for TrapStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires the owned stack when dropped (normal return, `?` early return, panic unwind)
pub struct TrapGuard {
    stack: TrapStack,
}

impl TrapGuard {
    pub fn new(stack: TrapStack) -> Self {
        Self { stack }
    }

    pub fn stack(&self) -> &TrapStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut TrapStack {
        &mut self.stack
    }

    /// Fire now instead of at drop
    pub fn fire(&mut self) -> FireReport {
        self.stack.fire()
    }
}

impl Drop for TrapGuard {
    fn drop(&mut self) {
        let report = self.stack.fire();
        if !report.is_clean() {
            warn!("Cleanup incomplete: {:?} failed", report.failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EnterError;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_fires_in_registration_order() {
        let log = recorder();
        let mut stack = TrapStack::new();
        for name in ["terminal", "unmount"] {
            let log = Arc::clone(&log);
            stack.register(name, move || {
                log.lock().unwrap().push(name);
                Ok(())
            });
        }

        let report = stack.fire();
        assert_eq!(*log.lock().unwrap(), vec!["terminal", "unmount"]);
        assert_eq!(report.completed, vec!["terminal", "unmount"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_second_fire_is_noop() {
        let log = recorder();
        let mut stack = TrapStack::new();
        let l = Arc::clone(&log);
        stack.register("once", move || {
            l.lock().unwrap().push("once");
            Ok(())
        });

        stack.fire();
        let report = stack.fire();
        assert!(report.completed.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failures_do_not_stop_later_actions() {
        let log = recorder();
        let mut stack = TrapStack::new();
        stack.register("fails", || Err(EnterError::Mount("busy".to_string())));
        stack.register("panics", || panic!("cleanup bug"));
        let l = Arc::clone(&log);
        stack.register("last", move || {
            l.lock().unwrap().push("last");
            Ok(())
        });

        let report = stack.fire();
        assert_eq!(report.failed, vec!["fails", "panics"]);
        assert_eq!(report.completed, vec!["last"]);
        assert_eq!(*log.lock().unwrap(), vec!["last"]);
    }

    #[test]
    fn test_relocate_neutralizes_parent() {
        let log = recorder();
        let mut parent = TrapStack::new();
        let l = Arc::clone(&log);
        parent.register("unmount", move || {
            l.lock().unwrap().push("unmount");
            Ok(())
        });

        let mut child = parent.relocate();
        assert!(parent.is_empty());
        assert!(parent.has_fired());
        assert_eq!(child.labels(), vec!["unmount"]);

        assert!(parent.fire().completed.is_empty());
        child.fire();
        assert_eq!(*log.lock().unwrap(), vec!["unmount"]);
    }

    #[test]
    fn test_late_registration_after_fire_is_dropped() {
        let mut stack = TrapStack::new();
        stack.fire();
        stack.register("late", || Ok(()));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_guard_fires_on_drop() {
        let log = recorder();
        {
            let mut guard = TrapGuard::new(TrapStack::new());
            let l = Arc::clone(&log);
            guard.stack_mut().register("drop", move || {
                l.lock().unwrap().push("drop");
                Ok(())
            });
        }
        assert_eq!(*log.lock().unwrap(), vec!["drop"]);
    }
}
