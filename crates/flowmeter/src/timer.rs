//! Self-rescheduling report timer
//!
//! Fires a task every `interval`, measured from the end of the previous
//! firing. `stop()` cancels the next pending firing but does not wait for one
//! already running, so a single firing may still complete after `stop()`
//! returns.

use crate::error::StreamError;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Task = Arc<dyn Fn() + Send + Sync>;

struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    wake: Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Periodic task runner on a dedicated thread
pub struct RepeatedTimer {
    interval: Duration,
    task: Task,
    handle: Mutex<Option<TimerHandle>>,
}

impl RepeatedTimer {
    pub fn new(interval: Duration, task: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            interval,
            task: Arc::new(task),
            handle: Mutex::new(None),
        }
    }

    /// Start firing. Returns `false` when already running.
    pub fn start(&self) -> Result<bool, StreamError> {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.as_ref() {
            if !h.cancelled.load(Ordering::Acquire) && !h.thread.is_finished() {
                return Ok(false);
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let (wake, wakeup) = bounded::<()>(1);
        let interval = self.interval;
        let task = self.task.clone();
        let flag = cancelled.clone();

        let thread = thread::Builder::new()
            .name("flowmeter-report".to_string())
            .spawn(move || loop {
                match wakeup.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                        task();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| StreamError::SpawnFailed(e.to_string()))?;

        tracing::debug!(interval_ms = interval.as_millis() as u64, "report timer started");
        *handle = Some(TimerHandle {
            cancelled,
            wake,
            thread,
        });
        Ok(true)
    }

    /// Cancel the next firing. Does not block on a firing in progress.
    pub fn stop(&self) {
        if let Some(h) = self.handle.lock().take() {
            h.cancelled.store(true, Ordering::Release);
            let _ = h.wake.try_send(());
            tracing::debug!("report timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.cancelled.load(Ordering::Acquire) && !h.thread.is_finished())
    }
}

impl Drop for RepeatedTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
