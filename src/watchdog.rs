//! Process watchdog for poll cycles and database startup.
//!
//! A hung cycle or connect must not block the host scheduler forever. The watchdog runs
//! on its own thread and, unless disarmed in time, terminates the process.
//! Dropping the [`Watchdog`] disarms it.

use log::{error, warn};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_WATCHDOG_SECS: u64 = 45;
pub const EXIT_WATCHDOG: i32 = 2;

pub struct Watchdog {
    disarm: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm a watchdog for one poll cycle.
    pub fn arm(deadline: Duration) -> Self {
        Self::arm_for("poll cycle", deadline)
    }

    /// Arm a watchdog that exits the process when `stage` outlives `deadline`.
    pub fn arm_for(stage: &'static str, deadline: Duration) -> Self {
        Self::arm_with(deadline, move || {
            error!(
                "Watchdog: {} did not finish within {}s; terminating",
                stage,
                deadline.as_secs()
            );
            std::process::exit(EXIT_WATCHDOG);
        })
    }

    pub fn arm_with<F>(deadline: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let spawned = thread::Builder::new().name("watchdog".to_string()).spawn(move || {
            // Disconnect (sender dropped) means the cycle finished.
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(deadline) {
                on_expiry();
            }
        });
        match spawned {
            Ok(handle) => Watchdog {
                disarm: Some(tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("Watchdog thread could not be started: {}", e);
                Watchdog {
                    disarm: None,
                    handle: None,
                }
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        drop(self.disarm.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn fires_when_not_disarmed() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let dog = Watchdog::arm_with(Duration::from_millis(20), move || flag.store(true, Ordering::SeqCst));
        thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
        drop(dog);
    }

    #[test]
    fn drop_disarms() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let dog = Watchdog::arm_with(Duration::from_millis(300), move || flag.store(true, Ordering::SeqCst));
        drop(dog);
        thread::sleep(Duration::from_millis(400));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
