//! One-shot initialization handshake between a worker and its observers.
//!
//! Each worker owns one [`InitFlag`] and sets it exactly once, after its
//! affinity, handler table and batch buffers are in place. The dispatcher and
//! the accelerator coordinator wait on it before routing work to the worker.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Returned when a flag is set a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("initialization flag already set")]
pub struct AlreadySet;

#[derive(Debug, Default)]
pub struct InitFlag {
    initialized: Mutex<bool>,
    cond: Condvar,
}

impl InitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // The guarded value is a plain bool, so a poisoned lock is still usable.
        self.initialized.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition false → true and wake every waiter.
    pub fn set(&self) -> Result<(), AlreadySet> {
        let mut initialized = self.lock();
        if *initialized {
            return Err(AlreadySet);
        }
        *initialized = true;
        drop(initialized);
        self.cond.notify_all();
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Block until set or until `timeout` passes. Returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |initialized| !*initialized)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Wait until every flag is set, sharing one deadline across all of them.
pub fn wait_all<'a>(flags: impl IntoIterator<Item = &'a InitFlag>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    flags.into_iter().all(|flag| {
        let remaining = deadline.saturating_duration_since(Instant::now());
        flag.wait_timeout(remaining)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_once() {
        let flag = InitFlag::new();
        assert!(!flag.is_set());
        assert_eq!(flag.set(), Ok(()));
        assert!(flag.is_set());
        assert_eq!(flag.set(), Err(AlreadySet));
        assert!(flag.is_set());
    }

    #[test]
    fn test_wait_times_out() {
        let flag = InitFlag::new();
        assert!(!flag.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_observer_sees_set_and_never_reverts() {
        let flag = Arc::new(InitFlag::new());
        let observer = {
            let flag = flag.clone();
            thread::spawn(move || {
                assert!(flag.wait_timeout(Duration::from_secs(5)));
                for _ in 0..1000 {
                    assert!(flag.is_set());
                }
            })
        };
        thread::sleep(Duration::from_millis(10));
        flag.set().unwrap();
        observer.join().unwrap();
    }

    #[test]
    fn test_wait_all() {
        let flags: Vec<Arc<InitFlag>> = (0..4).map(|_| Arc::new(InitFlag::new())).collect();
        let setters: Vec<_> = flags
            .iter()
            .cloned()
            .map(|flag| thread::spawn(move || flag.set().unwrap()))
            .collect();
        for s in setters {
            s.join().unwrap();
        }
        assert!(wait_all(flags.iter().map(|f| f.as_ref()), Duration::from_secs(1)));

        let pending = [InitFlag::new()];
        assert!(!wait_all(pending.iter(), Duration::from_millis(10)));
    }
}
