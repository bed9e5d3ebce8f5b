//! Polling trigger: periodically submits a computation to a worker pool and
//! fires when the result differs from the previous one. Used for state that
//! has no filesystem or signal-level notification (e.g. a CI status
//! provider's HTTP response).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::Trigger;

struct Armed {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Polls `compute` every `period`, firing its callback when a new result
/// differs (by `PartialEq`) from the last one observed. Each tick's
/// computation runs on the `rayon` global pool; the next tick does not start
/// until the current one has returned, so there is never more than one
/// in-flight computation to cancel.
pub struct PollingTrigger<T> {
    period: Duration,
    compute: Arc<dyn Fn() -> T + Send + Sync>,
    armed: Mutex<Option<Armed>>,
}

impl<T> PollingTrigger<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    /// Creates a trigger that reruns `compute` every `period`.
    pub fn new(period: Duration, compute: impl Fn() -> T + Send + Sync + 'static) -> Self {
        PollingTrigger {
            period,
            compute: Arc::new(compute),
            armed: Mutex::new(None),
        }
    }
}

impl<T> Trigger for PollingTrigger<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    fn arm(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        let mut guard = self.armed.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let period = self.period;
        let compute = Arc::clone(&self.compute);

        let join = std::thread::spawn(move || {
            let mut last: Option<T> = None;
            while !stop_for_thread.load(Ordering::SeqCst) {
                let (tx, rx) = std::sync::mpsc::channel();
                let compute = Arc::clone(&compute);
                rayon::spawn(move || {
                    let _ = tx.send(compute());
                });
                if let Ok(new_value) = rx.recv() {
                    let changed = last.as_ref() != Some(&new_value);
                    last = Some(new_value);
                    if changed {
                        callback();
                    }
                }
                std::thread::sleep(period);
            }
        });

        *guard = Some(Armed {
            stop,
            join,
        });
    }

    fn disarm(&self) {
        let armed = self.armed.lock().unwrap().take();
        if let Some(Armed { stop, join }) = armed {
            stop.store(true, Ordering::SeqCst);
            let _ = join.join();
        }
    }
}
