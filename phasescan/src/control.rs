//! Cooperative run control shared between the controller and the scan worker
//!
//! Cancellation and pause are folded into one [`RunStatus`]. Cancelled is
//! terminal: once set it is never cleared, and it wakes every wait including
//! a paused one.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

/// Run status observed by the worker at every suspension point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Proceed normally
    Running,
    /// Block at the next checkpoint until resumed
    Paused,
    /// Stop as soon as possible
    Cancelled,
}

/// Marker returned when a wait ends because the run was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Shared run status with wakeups
#[derive(Debug)]
pub struct RunControl {
    status: Mutex<RunStatus>,
    changed: Condvar,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// Create a control block in the `Running` state
    pub fn new() -> Self {
        Self {
            status: Mutex::new(RunStatus::Running),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status
    pub fn status(&self) -> RunStatus {
        *self.lock()
    }

    /// True once cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.status() == RunStatus::Cancelled
    }

    /// Move `Running` to `Paused`. Returns false if not running.
    pub fn pause(&self) -> bool {
        self.transition(RunStatus::Running, RunStatus::Paused)
    }

    /// Move `Paused` to `Running`. Returns false if not paused.
    pub fn resume(&self) -> bool {
        self.transition(RunStatus::Paused, RunStatus::Running)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let mut status = self.lock();
        if *status != RunStatus::Cancelled {
            info!("Cancellation requested");
            *status = RunStatus::Cancelled;
        }
        drop(status);
        self.changed.notify_all();
    }

    fn transition(&self, from: RunStatus, to: RunStatus) -> bool {
        let mut status = self.lock();
        if *status != from {
            return false;
        }
        *status = to;
        drop(status);
        self.changed.notify_all();
        true
    }

    /// Return immediately unless paused; while paused, block until resumed.
    ///
    /// Returns `Err(Cancelled)` if the run is or becomes cancelled.
    pub fn wait_while_paused(&self) -> Result<(), Cancelled> {
        let guard = self.lock();
        let status = self
            .changed
            .wait_while(guard, |status| *status == RunStatus::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        match *status {
            RunStatus::Cancelled => Err(Cancelled),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early if the run is cancelled.
    ///
    /// Pausing does not interrupt the sleep; the pause takes effect at the
    /// next checkpoint.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        let mut status = self.lock();
        loop {
            if *status == RunStatus::Cancelled {
                return Err(Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            status = self
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Fail fast if cancelled, without blocking
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_transitions() {
        let control = RunControl::new();
        assert!(!control.resume());
        assert!(control.pause());
        assert!(!control.pause());
        assert_eq!(control.status(), RunStatus::Paused);
        assert!(control.resume());
        control.cancel();
        assert!(!control.pause());
        assert!(!control.resume());
        assert!(control.is_cancelled());
    }

    #[test]
    fn test_cancel_is_monotonic() {
        let control = RunControl::new();
        control.cancel();
        control.cancel();
        assert_eq!(control.status(), RunStatus::Cancelled);
    }

    #[test]
    fn test_running_does_not_block() {
        let control = RunControl::new();
        assert_eq!(control.wait_while_paused(), Ok(()));
        assert_eq!(control.sleep(Duration::ZERO), Ok(()));
        assert_eq!(control.checkpoint(), Ok(()));
    }

    #[test]
    fn test_resume_releases_pause() {
        let control = Arc::new(RunControl::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        control.resume();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_cancel_releases_pause() {
        let control = Arc::new(RunControl::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(20));
        control.cancel();
        assert_eq!(waiter.join().unwrap(), Err(Cancelled));
    }

    #[test]
    fn test_cancel_wakes_sleep_early() {
        let control = Arc::new(RunControl::new());
        let sleeper = {
            let control = control.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (control.sleep(Duration::from_secs(30)), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        control.cancel();
        let (result, elapsed) = sleeper.join().unwrap();
        assert_eq!(result, Err(Cancelled));
        assert!(elapsed < Duration::from_secs(5));
    }
}
